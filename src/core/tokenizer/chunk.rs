use super::traits::Tokenizer;
use crate::core::{TokenId, TokenizerError};
use rayon::prelude::*;

/// Largest slice of text handed to an engine in one call.
pub const MAX_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Byte offset of `text` within the original input.
    pub offset: usize,
    pub text: &'a str,
}

/// Splits `text` into ordered, non-overlapping chunks of at most `max_bytes`.
///
/// Each cut lands just before the last whitespace char of the window so the
/// whitespace leads the next chunk. A window without whitespace is cut at its
/// last char boundary instead.
pub fn split_chunks(text: &str, max_bytes: usize) -> Vec<Chunk<'_>> {
    let max_bytes = max_bytes.max(4);
    let mut chunks = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut offset = 0;

    while offset < text.len() {
        let rest = &text[offset..];
        if rest.len() <= max_bytes {
            chunks.push(Chunk { offset, text: rest });
            break;
        }

        let mut limit = max_bytes;
        while !rest.is_char_boundary(limit) {
            limit -= 1;
        }
        let window = &rest[..limit];

        let cut = match window.rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };

        chunks.push(Chunk {
            offset,
            text: &rest[..cut],
        });
        offset += cut;
    }

    chunks
}

/// Runs an engine over input of any size.
pub struct ChunkedTokenizer<'a> {
    model: &'a str,
    engine: &'a dyn Tokenizer,
    max_chunk_bytes: usize,
}

impl<'a> ChunkedTokenizer<'a> {
    pub fn new(model: &'a str, engine: &'a dyn Tokenizer) -> Self {
        Self {
            model,
            engine,
            max_chunk_bytes: MAX_CHUNK_BYTES,
        }
    }

    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes;
        self
    }

    pub fn tokenize_all(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        if text.len() <= self.max_chunk_bytes {
            return self
                .engine
                .encode(text)
                .map_err(|e| TokenizerError::engine_failure(self.model, &e));
        }

        let chunks = split_chunks(text, self.max_chunk_bytes);
        tracing::debug!(model = %self.model, bytes = text.len(), chunks = chunks.len(), "tokenizing in chunks");

        let encoded: Vec<Vec<TokenId>> = chunks
            .par_iter()
            .map(|chunk| {
                self.engine.encode(chunk.text).map_err(|e| {
                    TokenizerError::engine_failure(self.model, &e.context(format!("chunk at byte {}", chunk.offset)))
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(encoded.into_iter().flatten().collect())
    }

    pub fn count_all(&self, text: &str) -> Result<usize, TokenizerError> {
        self.tokenize_all(text).map(|tokens| tokens.len())
    }
}
