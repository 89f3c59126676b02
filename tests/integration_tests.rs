use ollama_tokenizer::infra::MetadataValue;
use ollama_tokenizer::{GgufMetadata, MemorySource, TokenizerOptions, TokenizerService};
use std::sync::Arc;

fn bert_gguf(words: &[&str]) -> Vec<u8> {
    let mut tokens = vec!["[UNK]"];
    tokens.extend_from_slice(words);

    let mut metadata = GgufMetadata::new();
    metadata.insert("general.architecture", MetadataValue::String("bert".into()));
    metadata.insert("tokenizer.ggml.model", MetadataValue::String("bert".into()));
    metadata.insert("tokenizer.ggml.tokens", MetadataValue::strings(tokens));

    let mut bytes = Vec::new();
    metadata.write_to(&mut bytes).unwrap();
    bytes
}

fn memory() -> MemorySource {
    MemorySource::new()
        .with_blob("mem://tiny", bert_gguf(&["hello", "world", "!"]))
        .with_blob("mem://llama", bert_gguf(&["the", "quick", "brown", "fox", "hello"]))
}

/// Built-in registry with the two models tests touch redirected to memory.
fn service_with(source: Arc<MemorySource>) -> TokenizerService {
    TokenizerOptions::new()
        .with_source(source)
        .with_model_map([("tiny", "mem://tiny"), ("llama-3.2", "mem://llama")])
        .with_fallback_model("tiny")
        .build()
        .unwrap()
}

mod test_tokenize {
    use super::*;
    use ollama_tokenizer::{TokenId, TokenizerError};

    #[test]
    fn test_tokenize_and_count() {
        let service = service_with(Arc::new(memory()));

        let tokens = service.tokenize("tiny", "hello world!").unwrap();
        assert_eq!(tokens, vec![TokenId(1), TokenId(2), TokenId(3)]);
        assert_eq!(service.count_tokens("tiny", "hello world!").unwrap(), tokens.len());
    }

    #[test]
    fn test_empty_input() {
        let source = Arc::new(memory());
        let service = service_with(Arc::clone(&source));

        assert!(service.tokenize("llama3.2", "").unwrap().is_empty());
        assert_eq!(service.count_tokens("tiny", "").unwrap(), 0);
        assert_eq!(source.opens(), 0);
    }

    #[test]
    fn test_alias_is_equivalent_to_canonical() {
        let service = service_with(Arc::new(memory()));
        let text = "the quick brown fox";

        assert_eq!(
            service.tokenize("llama3.2", text).unwrap(),
            service.tokenize("llama-3.2", text).unwrap()
        );
        assert_eq!(service.count_tokens("tinyllama", "hello").unwrap(), 1);
    }

    #[test]
    fn test_unknown_model() {
        let with_fallback = service_with(Arc::new(memory()));
        assert_eq!(with_fallback.count_tokens("nonexistent-model", "hello world").unwrap(), 2);

        let strict = TokenizerOptions::new()
            .with_source(memory())
            .with_model_map([("tiny", "mem://tiny")])
            .without_default_models()
            .build()
            .unwrap();
        let err = strict.tokenize("nonexistent-model", "hello").unwrap_err();
        assert!(matches!(err, TokenizerError::UnknownModel { ref requested } if requested == "nonexistent-model"));
    }

    #[test]
    fn test_unknown_words_map_to_unk() {
        let service = service_with(Arc::new(memory()));
        assert_eq!(
            service.tokenize("tiny", "hello stranger").unwrap(),
            vec![TokenId(1), TokenId(0)]
        );
    }
}

mod test_resolve {
    use super::*;

    #[test]
    fn test_optimal_tokenizer_model() {
        let service = service_with(Arc::new(memory()));

        assert_eq!(service.optimal_tokenizer_model("llama3.2").unwrap(), "llama-3.2");
        assert_eq!(service.optimal_tokenizer_model("phi3").unwrap(), "phi-3");
        assert_eq!(service.optimal_tokenizer_model("nonexistent-model").unwrap(), "tiny");
        assert_eq!(
            service.optimal_tokenizer_model("granite-embedding-30m").unwrap(),
            "granite-embedding-30m"
        );
    }

    #[test]
    fn test_available_models() {
        let service = service_with(Arc::new(memory()));
        let models = service.available_models();

        for name in ["tiny", "llama-3.2", "phi-3", "granite-embedding-30m"] {
            assert!(models.iter().any(|m| m == name), "missing {}", name);
        }
        let mut sorted = models.clone();
        sorted.sort();
        assert_eq!(models, sorted);
    }
}

mod test_cache {
    use super::*;
    use ollama_tokenizer::{CacheState, ModelSource};
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_preload() {
        let source = Arc::new(memory());
        let service = TokenizerOptions::new()
            .with_source(Arc::clone(&source))
            .with_model_map([("tiny", "mem://tiny")])
            .without_default_models()
            .with_preloaded_models(["tiny"])
            .build()
            .unwrap();

        assert_eq!(source.opens(), 1);
        assert_eq!(service.cache_status()[0].state, CacheState::Loaded);

        service.tokenize("tiny", "hello").unwrap();
        assert_eq!(source.opens(), 1);
    }

    #[test]
    fn test_concurrent_calls_load_each_model_once() {
        let source = Arc::new(memory());
        let service = service_with(Arc::clone(&source));

        let handles: Vec<_> = (0..500)
            .map(|i| {
                let service = service.clone();
                thread::spawn(move || {
                    let model = if i % 2 == 0 { "tinyllama" } else { "llama3.2" };
                    let prompt = "hello ".repeat(i % 7 + 1);
                    let tokens = service.tokenize(model, &prompt).unwrap();
                    let count = service.count_tokens(model, &prompt).unwrap();
                    assert_eq!(count, tokens.len());
                    (i % 7 + 1, count)
                })
            })
            .collect();

        for handle in handles {
            let (words, count) = handle.join().unwrap();
            assert_eq!(count, words);
        }
        assert_eq!(source.opens(), 2);
    }

    struct FlakySource {
        inner: MemorySource,
        attempts: AtomicUsize,
    }

    impl ModelSource for FlakySource {
        fn open(&self, locator: &str) -> anyhow::Result<Box<dyn Read + Send>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Box::new(Cursor::new(b"GGUF truncated".to_vec())));
            }
            self.inner.open(locator)
        }
    }

    #[test]
    fn test_retry_after_failure() {
        let source = Arc::new(FlakySource {
            inner: memory(),
            attempts: AtomicUsize::new(0),
        });
        let service = TokenizerOptions::new()
            .with_source(Arc::clone(&source))
            .with_model_map([("tiny", "mem://tiny")])
            .without_default_models()
            .build()
            .unwrap();

        assert!(service.tokenize("tiny", "hello").is_err());
        assert_eq!(service.cache_status()[0].state, CacheState::Failed);

        assert_eq!(service.count_tokens("tiny", "hello world").unwrap(), 2);
        assert_eq!(service.cache_status()[0].state, CacheState::Loaded);
        assert_eq!(source.attempts.load(Ordering::SeqCst), 2);
    }
}

mod test_chunking {
    use super::*;
    use ollama_tokenizer::core::tokenizer::{split_chunks, MAX_CHUNK_BYTES};

    #[test]
    fn test_large_input_counts_every_chunk() {
        let service = service_with(Arc::new(memory()));
        let text = "the quick brown fox ".repeat(2_000);
        assert!(text.len() > MAX_CHUNK_BYTES);

        let chunks = split_chunks(&text, MAX_CHUNK_BYTES);
        assert!(chunks.len() > 1);

        let per_chunk: usize = chunks
            .iter()
            .map(|chunk| service.count_tokens("llama-3.2", chunk.text).unwrap())
            .sum();
        let total = service.count_tokens("llama-3.2", &text).unwrap();

        assert_eq!(total, per_chunk);
        assert_eq!(total, 8_000);
    }

    #[test]
    fn test_large_multibyte_input() {
        let service = service_with(Arc::new(memory()));
        let text = "héllo wörld ".repeat(2_000);

        let tokens = service.tokenize("tiny", &text).unwrap();
        assert_eq!(tokens.len(), 4_000);
    }
}

mod test_export {
    use super::*;
    use ollama_tokenizer::GgufReader;
    use std::io::Cursor;

    #[test]
    fn test_export_then_serve_from_export() {
        let service = service_with(Arc::new(memory()));
        let mut exported = Vec::new();
        assert_eq!(service.export_vocabulary("tinyllama", &mut exported).unwrap(), "tiny");

        let metadata = GgufReader::read_metadata(&mut Cursor::new(exported.clone())).unwrap();
        assert_eq!(metadata.tensor_count, 0);

        let reloaded = TokenizerOptions::new()
            .with_source(MemorySource::new().with_blob("mem://exported", exported))
            .with_model_map([("exported", "mem://exported")])
            .without_default_models()
            .build()
            .unwrap();
        assert_eq!(
            reloaded.tokenize("exported", "hello world!").unwrap(),
            service.tokenize("tiny", "hello world!").unwrap()
        );
    }
}
