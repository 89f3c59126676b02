use super::gguf::GgufReader;
use super::source::ModelSource;
use crate::core::cache::EngineLoader;
use crate::core::tokenizer::{create_tokenizer, Tokenizer};
use crate::core::ModelRegistry;
use crate::infra::Result;
use anyhow::Context;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds engines from GGUF metadata: registry locator, source stream,
/// vocabulary, engine.
pub struct SourceLoader {
    registry: Arc<ModelRegistry>,
    source: Arc<dyn ModelSource>,
}

impl SourceLoader {
    pub fn new(registry: Arc<ModelRegistry>, source: Arc<dyn ModelSource>) -> Self {
        Self { registry, source }
    }
}

impl EngineLoader for SourceLoader {
    fn load(&self, model: &str) -> Result<Arc<dyn Tokenizer>> {
        let spec = self
            .registry
            .lookup(model)
            .with_context(|| format!("model {} is not registered", model))?;

        info!(model = %model, locator = %spec.locator, "fetching tokenizer definition");
        let stream = self
            .source
            .open(&spec.locator)
            .with_context(|| format!("opening {}", spec.locator))?;

        let metadata = GgufReader::read_metadata(&mut BufReader::new(stream))
            .with_context(|| format!("reading GGUF metadata from {}", spec.locator))?;
        debug!(
            model = %model,
            version = metadata.version,
            architecture = metadata.architecture().unwrap_or("unknown"),
            "read GGUF metadata"
        );

        let vocab = metadata.to_vocabulary()?;
        let engine = create_tokenizer(vocab)?;
        Ok(Arc::from(engine))
    }
}
