pub mod gguf;
pub mod loader;
pub mod source;

pub use gguf::{GgufMetadata, GgufReader, MetadataValue};
pub use loader::SourceLoader;
pub use source::{DefaultSource, FileSource, HttpSource, MemorySource, ModelSource, OllamaRegistrySource};

pub type Result<T> = anyhow::Result<T>;
