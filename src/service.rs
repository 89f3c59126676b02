use crate::core::cache::{CacheStatus, TokenizerCache};
use crate::core::tokenizer::ChunkedTokenizer;
use crate::core::{ModelRegistry, ModelResolver, TokenId, TokenizerError};
use crate::infra::source::{DefaultSource, ModelSource, OllamaRegistrySource};
use crate::infra::{GgufMetadata, GgufReader, SourceLoader};
use anyhow::Context;
use rayon::prelude::*;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction options for [`TokenizerService`]. Everything is optional.
pub struct TokenizerOptions {
    client: Option<reqwest::blocking::Client>,
    source: Option<Arc<dyn ModelSource>>,
    timeout: Duration,
    models: Vec<(String, String)>,
    include_defaults: bool,
    fallback: Option<String>,
    preload: Vec<String>,
    failure_backoff: Duration,
    ollama_models_dir: Option<PathBuf>,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self {
            client: None,
            source: None,
            timeout: DEFAULT_TIMEOUT,
            models: Vec::new(),
            include_defaults: true,
            fallback: None,
            preload: Vec::new(),
            failure_backoff: Duration::ZERO,
            ollama_models_dir: OllamaRegistrySource::default_models_dir(),
        }
    }
}

impl TokenizerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP client used by the default source. Ignored with `with_source`.
    pub fn with_http_client(mut self, client: reqwest::blocking::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_source(mut self, source: impl ModelSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds `name → locator` entries; they replace built-in entries of the
    /// same name.
    pub fn with_model_map<I, N, L>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = (N, L)>,
        N: Into<String>,
        L: Into<String>,
    {
        self.models
            .extend(models.into_iter().map(|(n, l)| (n.into(), l.into())));
        self
    }

    pub fn without_default_models(mut self) -> Self {
        self.include_defaults = false;
        self
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback = Some(model.into());
        self
    }

    /// Models loaded before `build` returns. Failures are logged, not fatal.
    pub fn with_preloaded_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preload.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Local Ollama store consulted before the registry; `None` disables it.
    pub fn with_ollama_models_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.ollama_models_dir = dir;
        self
    }

    pub fn build(self) -> crate::Result<TokenizerService> {
        TokenizerService::new(self)
    }
}

struct Inner {
    registry: Arc<ModelRegistry>,
    resolver: ModelResolver,
    cache: TokenizerCache,
    source: Arc<dyn ModelSource>,
}

/// Tokenization for any model name: resolve, load once, tokenize.
///
/// Cheap to clone; clones share the registry and the cache.
#[derive(Clone)]
pub struct TokenizerService {
    inner: Arc<Inner>,
}

impl TokenizerService {
    pub fn new(options: TokenizerOptions) -> crate::Result<Self> {
        let mut registry = ModelRegistry::from_map(options.models, options.include_defaults);

        let source: Arc<dyn ModelSource> = match options.source {
            Some(source) => source,
            None => {
                let client = match options.client {
                    Some(client) => client,
                    None => reqwest::blocking::Client::builder()
                        .timeout(options.timeout)
                        .build()
                        .context("building HTTP client")?,
                };
                Arc::new(DefaultSource::with_client(client).with_ollama_models_dir(options.ollama_models_dir))
            }
        };

        // Preload names are matched strictly: no fallback substitution.
        let mut preload = Vec::new();
        {
            let probe = ModelResolver::new(Arc::new(registry.clone()));
            for name in &options.preload {
                match probe.match_name(name) {
                    Some(canonical) => preload.push(canonical.to_string()),
                    None => warn!(model = %name, "ignoring unknown model in preload list"),
                }
            }
        }
        for name in &preload {
            registry.mark_preload(name);
        }

        let registry = Arc::new(registry);
        let mut resolver = ModelResolver::new(Arc::clone(&registry));
        if let Some(fallback) = options.fallback {
            if resolver.match_name(&fallback).is_none() {
                warn!(fallback = %fallback, "fallback model is not registered");
            }
            resolver = resolver.with_fallback(fallback);
        }

        let loader = SourceLoader::new(Arc::clone(&registry), Arc::clone(&source));
        let cache = TokenizerCache::new(loader).with_failure_backoff(options.failure_backoff);

        let service = Self {
            inner: Arc::new(Inner {
                registry,
                resolver,
                cache,
                source,
            }),
        };
        service.preload();

        Ok(service)
    }

    fn preload(&self) {
        let names = self.inner.registry.preload_names();
        if names.is_empty() {
            return;
        }

        info!(models = ?names, "preloading tokenizers");
        names.par_iter().for_each(|name| {
            if let Err(e) = self.inner.cache.get_or_load(name) {
                warn!(model = %name, error = %e, "preload failed");
            }
        });
    }

    pub fn tokenize(&self, model: &str, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let name = self.inner.resolver.resolve(model)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let engine = self.inner.cache.get_or_load(&name)?;
        ChunkedTokenizer::new(&name, engine.as_ref()).tokenize_all(text)
    }

    pub fn count_tokens(&self, model: &str, text: &str) -> Result<usize, TokenizerError> {
        self.tokenize(model, text).map(|tokens| tokens.len())
    }

    /// Every registered canonical name, sorted.
    pub fn available_models(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// The canonical model `tokenize` would use for `model`.
    pub fn optimal_tokenizer_model(&self, model: &str) -> Result<String, TokenizerError> {
        self.inner.resolver.resolve(model)
    }

    pub fn cache_status(&self) -> Vec<CacheStatus> {
        let names = self.inner.registry.names();
        self.inner.cache.status(names.iter().map(String::as_str))
    }

    /// Writes a tensor-free GGUF holding only the `general.*` and
    /// `tokenizer.*` metadata of `model`. Returns the canonical name.
    pub fn export_vocabulary<W: Write>(&self, model: &str, writer: &mut W) -> crate::Result<String> {
        let name = self.inner.resolver.resolve(model)?;
        let spec = self
            .inner
            .registry
            .lookup(&name)
            .with_context(|| format!("model {} is not registered", name))?;

        let stream = self.inner.source.open(&spec.locator)?;
        let metadata = GgufReader::read_metadata(&mut BufReader::new(stream))?;

        let mut vocab_only = GgufMetadata::new();
        for (key, value) in metadata.kv {
            if key.starts_with("general.") || key.starts_with("tokenizer.") {
                vocab_only.insert(key, value);
            }
        }
        vocab_only.to_vocabulary()?;
        vocab_only.write_to(writer)?;

        Ok(name)
    }
}
