use crate::core::tokenizer::Tokenizer;
use crate::core::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Builds the engine for a canonical model name. Called at most once per
/// load attempt, outside any cache lock.
pub trait EngineLoader: Send + Sync {
    fn load(&self, model: &str) -> Result<Arc<dyn Tokenizer>>;
}

impl<F> EngineLoader for F
where
    F: Fn(&str) -> Result<Arc<dyn Tokenizer>> + Send + Sync,
{
    fn load(&self, model: &str) -> Result<Arc<dyn Tokenizer>> {
        self(model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// Point-in-time view of one cache slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
    pub name: String,
    pub state: CacheState,
    /// When the slot entered its current state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CacheStatus {
    pub fn not_loaded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CacheState::NotLoaded,
            since: None,
            vocab_size: None,
            error: None,
        }
    }
}
