pub mod traits;
pub mod bpe;
pub mod sentencepiece;
pub mod wordpiece;
pub mod chunk;

pub use traits::{Tokenizer, TokenizerKind};
pub use bpe::BpeTokenizer;
pub use sentencepiece::SentencePieceTokenizer;
pub use wordpiece::WordPieceTokenizer;
pub use chunk::{split_chunks, Chunk, ChunkedTokenizer, MAX_CHUNK_BYTES};

use crate::core::{Result, TokenId};
use std::collections::HashMap;

/// Builds the engine matching the vocabulary's `tokenizer.ggml.model`.
pub fn create_tokenizer(vocab: Vocabulary) -> Result<Box<dyn Tokenizer>> {
    let kind = TokenizerKind::from_model(&vocab.model)
        .ok_or_else(|| anyhow::anyhow!("Unsupported tokenizer model: {}", vocab.model))?;

    Ok(match kind {
        TokenizerKind::Bpe => Box::new(BpeTokenizer::new(vocab)?),
        TokenizerKind::SentencePiece => Box::new(SentencePieceTokenizer::new(vocab)),
        TokenizerKind::WordPiece => Box::new(WordPieceTokenizer::new(vocab)),
    })
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// Value of `tokenizer.ggml.model` (`gpt2`, `llama`, `bert`).
    pub model: String,
    /// Pre-tokenizer name from `tokenizer.ggml.pre`.
    pub pre: Option<String>,
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub types: Vec<TokenType>,
    pub merges: Vec<String>,
    pub bos_token: TokenId,
    pub eos_token: TokenId,
    pub unk_token: Option<TokenId>,
    pub add_space_prefix: bool,
}

impl Vocabulary {
    pub fn new(model: impl Into<String>, tokens: Vec<String>) -> Self {
        let len = tokens.len();
        Self {
            model: model.into(),
            pre: None,
            tokens,
            scores: vec![0.0; len],
            types: vec![TokenType::Normal; len],
            merges: Vec::new(),
            bos_token: TokenId::BOS,
            eos_token: TokenId::EOS,
            unk_token: None,
            add_space_prefix: true,
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        id.index()
            .and_then(|i| self.tokens.get(i))
            .map(|s| s.as_str())
    }

    pub fn score(&self, id: TokenId) -> f32 {
        id.index()
            .and_then(|i| self.scores.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn token_type(&self, id: TokenId) -> TokenType {
        id.index()
            .and_then(|i| self.types.get(i))
            .copied()
            .unwrap_or(TokenType::Normal)
    }

    pub(crate) fn encoder(&self) -> HashMap<String, TokenId> {
        let mut encoder = HashMap::with_capacity(self.tokens.len());
        for (i, token) in self.tokens.iter().enumerate() {
            // Keep the first id when a vocabulary repeats a string.
            encoder.entry(token.clone()).or_insert(TokenId(i as i32));
        }
        encoder
    }

    /// Control and user-defined tokens, longest first, so they can be
    /// matched literally in input text.
    pub(crate) fn special_tokens(&self) -> Vec<(String, TokenId)> {
        let mut specials: Vec<(String, TokenId)> = self
            .tokens
            .iter()
            .enumerate()
            .filter(|(i, token)| {
                !token.is_empty()
                    && matches!(
                        self.types.get(*i),
                        Some(TokenType::Control) | Some(TokenType::UserDefined)
                    )
            })
            .map(|(i, token)| (token.clone(), TokenId(i as i32)))
            .collect();
        specials.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));
        specials
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl From<i64> for TokenType {
    fn from(v: i64) -> Self {
        match v {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Special(TokenId),
}

/// Cuts `text` around literal occurrences of special tokens. At equal
/// positions the longest special token wins.
pub(crate) fn split_special<'a>(text: &'a str, specials: &[(String, TokenId)]) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let next = specials
            .iter()
            .filter_map(|(token, id)| rest.find(token.as_str()).map(|pos| (pos, token.len(), *id)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        match next {
            Some((pos, len, id)) => {
                if pos > 0 {
                    segments.push(Segment::Text(&rest[..pos]));
                }
                segments.push(Segment::Special(id));
                rest = &rest[pos + len..];
            }
            None => {
                segments.push(Segment::Text(rest));
                break;
            }
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tokenizer_by_model() {
        let bpe = create_tokenizer(Vocabulary::new("gpt2", vec!["a".into()])).unwrap();
        assert_eq!(bpe.kind(), TokenizerKind::Bpe);

        let spm = create_tokenizer(Vocabulary::new("llama", vec!["▁a".into()])).unwrap();
        assert_eq!(spm.kind(), TokenizerKind::SentencePiece);

        let wpm = create_tokenizer(Vocabulary::new("bert", vec!["[UNK]".into()])).unwrap();
        assert_eq!(wpm.kind(), TokenizerKind::WordPiece);
    }

    #[test]
    fn test_create_tokenizer_rejects_unknown_model() {
        let err = create_tokenizer(Vocabulary::new("rwkv", vec!["a".into()]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("rwkv"));
    }

    #[test]
    fn test_split_special() {
        let specials = vec![
            ("<|eot|>".to_string(), TokenId(7)),
            ("<s>".to_string(), TokenId(1)),
        ];
        let segments = split_special("<s>hi<|eot|> there", &specials);
        assert_eq!(
            segments,
            vec![
                Segment::Special(TokenId(1)),
                Segment::Text("hi"),
                Segment::Special(TokenId(7)),
                Segment::Text(" there"),
            ]
        );
        assert!(split_special("", &specials).is_empty());
    }

    #[test]
    fn test_special_tokens_longest_first() {
        let mut vocab = Vocabulary::new(
            "llama",
            vec!["<s>".into(), "<|start|>".into(), "hello".into()],
        );
        vocab.types = vec![TokenType::Control, TokenType::UserDefined, TokenType::Normal];
        let specials = vocab.special_tokens();
        assert_eq!(specials[0].0, "<|start|>");
        assert_eq!(specials[1].0, "<s>");
        assert_eq!(specials.len(), 2);
    }
}
