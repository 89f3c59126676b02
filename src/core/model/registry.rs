use super::ModelSpec;
use std::collections::BTreeMap;

/// Built-in tokenizer sources, used for any name the caller does not map.
pub const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("tiny", "ollama://library/tinyllama:latest"),
    ("granite-embedding-30m", "ollama://library/granite-embedding:30m"),
    ("llama-3.2", "ollama://library/llama3.2:1b"),
    ("llama-3.1", "ollama://library/llama3.1:8b"),
    ("phi-3", "ollama://library/phi3:mini"),
    ("phi-4", "ollama://library/phi4-mini:latest"),
    ("qwen-2.5", "ollama://library/qwen2.5:0.5b"),
    ("gemma-2", "ollama://library/gemma2:2b"),
    ("mistral", "ollama://library/mistral:7b"),
    ("nomic-embed-text", "ollama://library/nomic-embed-text:latest"),
    ("all-minilm", "ollama://library/all-minilm:latest"),
];

/// Canonical model name to source locator.
///
/// Populated while the service is being built and shared read-only
/// afterwards, so lookups need no locking.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, locator) in DEFAULT_MODELS {
            registry.register(ModelSpec::new(*name, *locator));
        }
        registry
    }

    /// Caller entries replace defaults of the same name; defaults that are
    /// not overridden stay available.
    pub fn from_map<I, N, L>(map: I, include_defaults: bool) -> Self
    where
        I: IntoIterator<Item = (N, L)>,
        N: Into<String>,
        L: Into<String>,
    {
        let mut registry = if include_defaults {
            Self::with_defaults()
        } else {
            Self::new()
        };
        for (name, locator) in map {
            registry.register(ModelSpec::new(name, locator));
        }
        registry
    }

    pub fn register(&mut self, spec: ModelSpec) {
        self.models.insert(spec.name.clone(), spec);
    }

    pub fn mark_preload(&mut self, name: &str) -> bool {
        match self.models.get_mut(name) {
            Some(spec) => {
                spec.preload = true;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Sorted ascending.
    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn preload_names(&self) -> Vec<String> {
        self.models
            .values()
            .filter(|spec| spec.preload)
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
