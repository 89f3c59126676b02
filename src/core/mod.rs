pub mod model;
pub mod tokenizer;
pub mod cache;
pub mod error;

pub use model::{ModelRegistry, ModelResolver, ModelSpec, TokenId, AliasTable};
pub use tokenizer::{Tokenizer, TokenizerKind, Vocabulary, ChunkedTokenizer};
pub use cache::{TokenizerCache, EngineLoader, CacheStatus, CacheState};
pub use error::TokenizerError;

pub type Result<T> = anyhow::Result<T>;
