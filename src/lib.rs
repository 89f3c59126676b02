pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;
pub mod service;

pub mod model {
    pub use crate::core::model::*;
}

pub use core::{
    CacheState, CacheStatus, ModelRegistry, ModelResolver, ModelSpec, TokenId, Tokenizer,
    TokenizerCache, TokenizerError, TokenizerKind, Vocabulary,
};

pub use infra::{DefaultSource, FileSource, GgufMetadata, GgufReader, MemorySource, ModelSource};

pub use service::{TokenizerOptions, TokenizerService};

pub type Result<T> = anyhow::Result<T>;
