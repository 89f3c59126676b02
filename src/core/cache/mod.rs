pub mod traits;

pub use traits::{CacheState, CacheStatus, EngineLoader};

use crate::core::tokenizer::Tokenizer;
use crate::core::TokenizerError;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type LoadResult = Result<Arc<dyn Tokenizer>, TokenizerError>;

/// One in-flight load. Every caller that finds the slot `Loading` waits here
/// and receives the leader's outcome.
struct LoadAttempt {
    started_at: DateTime<Utc>,
    outcome: Mutex<Option<LoadResult>>,
    ready: Condvar,
}

impl LoadAttempt {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> LoadResult {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut outcome);
        }
    }

    fn complete(&self, result: LoadResult) {
        *self.outcome.lock() = Some(result);
        self.ready.notify_all();
    }
}

enum CacheEntry {
    Loading(Arc<LoadAttempt>),
    Loaded {
        engine: Arc<dyn Tokenizer>,
        loaded_at: DateTime<Utc>,
    },
    Failed {
        error: TokenizerError,
        failed_at: DateTime<Utc>,
        since: Instant,
    },
}

impl CacheEntry {
    fn status(&self, name: &str) -> CacheStatus {
        let mut status = CacheStatus::not_loaded(name);
        match self {
            CacheEntry::Loading(attempt) => {
                status.state = CacheState::Loading;
                status.since = Some(attempt.started_at);
            }
            CacheEntry::Loaded { engine, loaded_at } => {
                status.state = CacheState::Loaded;
                status.since = Some(*loaded_at);
                status.vocab_size = Some(engine.vocab_size());
            }
            CacheEntry::Failed { error, failed_at, .. } => {
                status.state = CacheState::Failed;
                status.since = Some(*failed_at);
                status.error = Some(error.to_string());
            }
        }
        status
    }
}

/// Process-wide map from canonical model name to its engine.
///
/// The map lock is only held to inspect or replace a slot. Loads run outside
/// it, so a slow model never holds up requests for another one.
pub struct TokenizerCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    loader: Box<dyn EngineLoader>,
    failure_backoff: Duration,
}

enum Role {
    Lead(Arc<LoadAttempt>),
    Wait(Arc<LoadAttempt>),
}

impl TokenizerCache {
    pub fn new(loader: impl EngineLoader + 'static) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            loader: Box::new(loader),
            failure_backoff: Duration::ZERO,
        }
    }

    /// How long a failed load is reported as-is before the next request
    /// retries it. Zero retries on every request.
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn get_or_load(&self, model: &str) -> LoadResult {
        let role = {
            let mut entries = self.entries.lock();

            let pending = match entries.get(model) {
                Some(CacheEntry::Loaded { engine, .. }) => return Ok(Arc::clone(engine)),
                Some(CacheEntry::Loading(attempt)) => Some(Arc::clone(attempt)),
                Some(CacheEntry::Failed { error, since, .. })
                    if since.elapsed() < self.failure_backoff =>
                {
                    return Err(error.clone())
                }
                _ => None,
            };

            match pending {
                Some(attempt) => Role::Wait(attempt),
                None => {
                    let attempt = Arc::new(LoadAttempt::new());
                    entries.insert(model.to_string(), CacheEntry::Loading(Arc::clone(&attempt)));
                    Role::Lead(attempt)
                }
            }
        };

        match role {
            Role::Wait(attempt) => {
                debug!(model = %model, "waiting on in-flight tokenizer load");
                attempt.wait()
            }
            Role::Lead(attempt) => self.lead(model, attempt),
        }
    }

    fn lead(&self, model: &str, attempt: Arc<LoadAttempt>) -> LoadResult {
        let mut guard = LeaderGuard {
            cache: self,
            model,
            attempt: Some(attempt),
        };

        info!(model = %model, "loading tokenizer");
        let started = Instant::now();
        let result = self
            .loader
            .load(model)
            .map_err(|e| TokenizerError::load_failure(model, &e));

        match &result {
            Ok(engine) => info!(
                model = %model,
                vocab_size = engine.vocab_size(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tokenizer loaded"
            ),
            Err(e) => warn!(model = %model, error = %e, "tokenizer load failed"),
        }

        guard.finish(result.clone());
        result
    }

    fn publish(&self, model: &str, attempt: &LoadAttempt, result: LoadResult) {
        let entry = match &result {
            Ok(engine) => CacheEntry::Loaded {
                engine: Arc::clone(engine),
                loaded_at: Utc::now(),
            },
            Err(error) => CacheEntry::Failed {
                error: error.clone(),
                failed_at: Utc::now(),
                since: Instant::now(),
            },
        };
        self.entries.lock().insert(model.to_string(), entry);
        attempt.complete(result);
    }

    pub fn is_loaded(&self, model: &str) -> bool {
        matches!(self.entries.lock().get(model), Some(CacheEntry::Loaded { .. }))
    }

    /// Snapshot of `names` plus every slot the cache has touched, sorted by
    /// name. Names never requested report `NotLoaded`.
    pub fn status<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<CacheStatus> {
        let entries = self.entries.lock();
        let mut rows: BTreeMap<&str, CacheStatus> = names
            .into_iter()
            .map(|name| (name, CacheStatus::not_loaded(name)))
            .collect();
        for (name, entry) in entries.iter() {
            rows.insert(name.as_str(), entry.status(name));
        }
        rows.into_values().collect()
    }
}

/// Publishes the leader's outcome even if the loader panics, so waiters are
/// never stranded on a slot stuck in `Loading`.
struct LeaderGuard<'a> {
    cache: &'a TokenizerCache,
    model: &'a str,
    attempt: Option<Arc<LoadAttempt>>,
}

impl LeaderGuard<'_> {
    fn finish(&mut self, result: LoadResult) {
        if let Some(attempt) = self.attempt.take() {
            self.cache.publish(self.model, &attempt, result);
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.attempt.is_some() {
            warn!(model = %self.model, "tokenizer loader panicked");
            self.finish(Err(TokenizerError::LoadFailure {
                model: self.model.to_string(),
                reason: "loader panicked".to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::TokenizerKind;
    use crate::core::{Result, TokenId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::thread;

    struct FakeEngine(usize);

    impl Tokenizer for FakeEngine {
        fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
            Ok(text.split_whitespace().map(|_| TokenId(self.0 as i32)).collect())
        }

        fn decode(&self, _tokens: &[TokenId]) -> Result<String> {
            Ok(String::new())
        }

        fn kind(&self) -> TokenizerKind {
            TokenizerKind::Bpe
        }

        fn vocab_size(&self) -> usize {
            self.0
        }

        fn bos_token(&self) -> TokenId {
            TokenId::BOS
        }

        fn eos_token(&self) -> TokenId {
            TokenId::EOS
        }

        fn token_to_id(&self, _token: &str) -> Option<TokenId> {
            None
        }

        fn id_to_token(&self, _id: TokenId) -> Option<&str> {
            None
        }
    }

    /// Loads `FakeEngine`s after a short delay; fails the first `failures` loads.
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        failures: usize,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(delay_ms: u64) -> (Self, Arc<AtomicUsize>) {
            let loads = Arc::new(AtomicUsize::new(0));
            let loader = Self {
                loads: Arc::clone(&loads),
                failures: 0,
                delay: Duration::from_millis(delay_ms),
            };
            (loader, loads)
        }

        fn failing(mut self, failures: usize) -> Self {
            self.failures = failures;
            self
        }
    }

    impl EngineLoader for CountingLoader {
        fn load(&self, model: &str) -> Result<Arc<dyn Tokenizer>> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if attempt < self.failures {
                anyhow::bail!("source for {} unreachable", model);
            }
            Ok(Arc::new(FakeEngine(model.len())))
        }
    }

    #[test]
    fn test_loads_once_then_hits() {
        let (loader, loads) = CountingLoader::new(0);
        let cache = TokenizerCache::new(loader);

        assert!(!cache.is_loaded("tiny"));
        let first = cache.get_or_load("tiny").unwrap();
        let second = cache.get_or_load("tiny").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.is_loaded("tiny"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let (loader, loads) = CountingLoader::new(50);
        let cache = Arc::new(TokenizerCache::new(loader));
        let barrier = Arc::new(Barrier::new(500));

        let handles: Vec<_> = (0..500)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let model = if i % 2 == 0 { "tiny" } else { "llama-3.2" };
                    barrier.wait();
                    cache.get_or_load(model).map(|engine| engine.vocab_size())
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let expected = if i % 2 == 0 { 4 } else { 9 };
            assert_eq!(handle.join().unwrap().unwrap(), expected);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_slow_load_does_not_block_other_models() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let loader = move |model: &str| -> Result<Arc<dyn Tokenizer>> {
            if model == "slow" {
                started_tx.lock().send(())?;
                release_rx.lock().recv()?;
            }
            Ok(Arc::new(FakeEngine(model.len())))
        };
        let cache = Arc::new(TokenizerCache::new(loader));

        let slow = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_or_load("slow").map(|e| e.vocab_size()))
        };
        started_rx.recv().unwrap();

        assert_eq!(cache.get_or_load("fast").unwrap().vocab_size(), 4);
        let status = cache.status([]);
        assert_eq!(status[1].name, "slow");
        assert_eq!(status[1].state, CacheState::Loading);

        release_tx.send(()).unwrap();
        assert_eq!(slow.join().unwrap().unwrap(), 4);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let (loader, loads) = CountingLoader::new(0);
        let cache = TokenizerCache::new(loader.failing(1));

        let err = cache.get_or_load("tiny").err().unwrap();
        assert!(matches!(err, TokenizerError::LoadFailure { ref model, .. } if model == "tiny"));
        assert!(err.to_string().contains("unreachable"));

        assert!(cache.get_or_load("tiny").is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_waiters_share_one_failure() {
        let (loader, loads) = CountingLoader::new(100);
        let cache = Arc::new(
            TokenizerCache::new(loader.failing(usize::MAX)).with_failure_backoff(Duration::from_secs(60)),
        );
        let barrier = Arc::new(Barrier::new(20));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_load("tiny").err()
                })
            })
            .collect();

        let errors: Vec<TokenizerError> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_suppresses_retry() {
        let (loader, loads) = CountingLoader::new(0);
        let cache = TokenizerCache::new(loader.failing(1)).with_failure_backoff(Duration::from_secs(60));

        assert!(cache.get_or_load("tiny").is_err());
        assert!(cache.get_or_load("tiny").is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_loader_releases_slot() {
        let calls = AtomicUsize::new(0);
        let loader = move |model: &str| -> Result<Arc<dyn Tokenizer>> {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("corrupt vocabulary");
            }
            Ok(Arc::new(FakeEngine(model.len())))
        };
        let cache = Arc::new(TokenizerCache::new(loader));

        let panicked = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_or_load("tiny")).join()
        };
        assert!(panicked.is_err());

        let status = cache.status(["tiny"]);
        assert_eq!(status[0].state, CacheState::Failed);
        assert!(cache.get_or_load("tiny").is_ok());
    }

    #[test]
    fn test_status_rows() {
        let (loader, _) = CountingLoader::new(0);
        let cache = TokenizerCache::new(loader.failing(1));

        assert!(cache.get_or_load("broken").is_err());
        cache.get_or_load("tiny").unwrap();

        let status = cache.status(["phi-3", "tiny"]);
        let states: Vec<(&str, CacheState)> = status.iter().map(|s| (s.name.as_str(), s.state)).collect();
        assert_eq!(
            states,
            vec![
                ("broken", CacheState::Failed),
                ("phi-3", CacheState::NotLoaded),
                ("tiny", CacheState::Loaded),
            ]
        );
        assert_eq!(status[2].vocab_size, Some(4));
        assert!(status[0].error.as_deref().unwrap().contains("broken"));

        let json = serde_json::to_value(&status[1]).unwrap();
        assert_eq!(json, serde_json::json!({"name": "phi-3", "state": "not_loaded"}));
    }
}
