use super::{AliasTable, ModelRegistry};
use crate::core::TokenizerError;
use std::sync::Arc;
use tracing::debug;

/// Maps any requested model name onto a registry key.
///
/// Order: exact key, alias rewrite, configured fallback. The fallback itself
/// goes through the first two steps, so it may be given in an informal
/// spelling.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    registry: Arc<ModelRegistry>,
    aliases: AliasTable,
    fallback: Option<String>,
}

impl ModelResolver {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            aliases: AliasTable::default(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Exact or alias match only; never consults the fallback.
    pub fn match_name<'a>(&self, requested: &'a str) -> Option<&'a str> {
        if self.registry.contains(requested) {
            return Some(requested);
        }

        let normalized = self.aliases.normalize(requested);
        if self.registry.contains(normalized) {
            return Some(normalized);
        }

        None
    }

    pub fn resolve(&self, requested: &str) -> Result<String, TokenizerError> {
        if let Some(name) = self.match_name(requested) {
            return Ok(name.to_string());
        }

        if let Some(name) = self.fallback.as_deref().and_then(|f| self.match_name(f)) {
            debug!(requested = %requested, fallback = %name, "using fallback tokenizer model");
            return Ok(name.to_string());
        }

        Err(TokenizerError::UnknownModel {
            requested: requested.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ModelResolver {
        ModelResolver::new(Arc::new(ModelRegistry::with_defaults()))
    }

    #[test]
    fn test_exact_match_is_unchanged() {
        assert_eq!(
            resolver().resolve("granite-embedding-30m").unwrap(),
            "granite-embedding-30m"
        );
    }

    #[test]
    fn test_alias_resolution() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("llama3.2").unwrap(), "llama-3.2");
        assert_eq!(resolver.resolve("phi3").unwrap(), "phi-3");
        assert_eq!(
            resolver.resolve("llama3.2").unwrap(),
            resolver.resolve("llama-3.2").unwrap()
        );
    }

    #[test]
    fn test_fallback() {
        let resolver = resolver().with_fallback("tiny");
        assert_eq!(resolver.resolve("nonexistent-model").unwrap(), "tiny");
    }

    #[test]
    fn test_fallback_through_alias() {
        let resolver = resolver().with_fallback("tinyllama");
        assert_eq!(resolver.resolve("nonexistent-model").unwrap(), "tiny");
    }

    #[test]
    fn test_unknown_without_fallback() {
        let err = resolver().resolve("nonexistent-model").unwrap_err();
        assert_eq!(
            err,
            TokenizerError::UnknownModel {
                requested: "nonexistent-model".to_string()
            }
        );
    }

    #[test]
    fn test_unusable_fallback() {
        let resolver = resolver().with_fallback("also-missing");
        assert!(matches!(
            resolver.resolve("nonexistent-model"),
            Err(TokenizerError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_alias_target_must_be_registered() {
        let registry = ModelRegistry::from_map([("tiny", "/tmp/tiny.gguf")], false);
        let resolver = ModelResolver::new(Arc::new(registry));
        assert!(resolver.resolve("llama3.2").is_err());
        assert_eq!(resolver.resolve("tinyllama").unwrap(), "tiny");
    }
}
