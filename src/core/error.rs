use thiserror::Error;

/// Errors surfaced by the tokenizer service.
///
/// `Clone` so a single failed load can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizerError {
    #[error("unknown model '{requested}' and no usable fallback")]
    UnknownModel { requested: String },

    #[error("failed to load tokenizer for '{model}': {reason}")]
    LoadFailure { model: String, reason: String },

    #[error("tokenizer for '{model}' rejected input: {reason}")]
    EngineFailure { model: String, reason: String },
}

impl TokenizerError {
    pub fn load_failure(model: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::LoadFailure {
            model: model.into(),
            reason: format!("{:#}", error),
        }
    }

    pub fn engine_failure(model: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::EngineFailure {
            model: model.into(),
            reason: format!("{:#}", error),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::UnknownModel { requested } => requested,
            Self::LoadFailure { model, .. } | Self::EngineFailure { model, .. } => model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_failure_keeps_context_chain() {
        let error = anyhow::anyhow!("connection refused").context("opening ollama://library/tinyllama");
        let err = TokenizerError::load_failure("tiny", &error);
        assert_eq!(err.model(), "tiny");
        assert_eq!(
            err.to_string(),
            "failed to load tokenizer for 'tiny': opening ollama://library/tinyllama: connection refused"
        );
    }
}
