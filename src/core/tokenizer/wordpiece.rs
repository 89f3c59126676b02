use super::traits::{Tokenizer, TokenizerKind};
use super::{split_special, Segment, TokenType, Vocabulary};
use crate::core::{Result, TokenId};
use std::collections::HashMap;

const MAX_WORD_CHARS: usize = 100;

/// How a vocabulary marks where a word starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStyle {
    /// BERT style: continuation pieces carry a `##` prefix.
    Hashes,
    /// GGUF-converted BERT: word-initial pieces carry `▁`.
    Metaspace,
}

impl PieceStyle {
    fn detect(tokens: &[String]) -> Self {
        if tokens.iter().any(|t| t.len() > 2 && t.starts_with("##")) {
            PieceStyle::Hashes
        } else if tokens.iter().any(|t| t.starts_with('▁')) {
            PieceStyle::Metaspace
        } else {
            PieceStyle::Hashes
        }
    }
}

/// Greedy longest-match WordPiece, used by BERT-family embedding models.
pub struct WordPieceTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    specials: Vec<(String, TokenId)>,
    style: PieceStyle,
    lowercase: bool,
    unk: Option<TokenId>,
}

impl WordPieceTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let encoder = vocab.encoder();
        let style = PieceStyle::detect(&vocab.tokens);

        let lowercase = !vocab
            .tokens
            .iter()
            .zip(&vocab.types)
            .any(|(token, ty)| *ty == TokenType::Normal && token.chars().any(char::is_uppercase));

        let unk = vocab
            .unk_token
            .or_else(|| encoder.get("[UNK]").copied())
            .or_else(|| encoder.get("<unk>").copied());

        Self {
            specials: vocab.special_tokens(),
            vocab,
            encoder,
            style,
            lowercase,
            unk,
        }
    }

    pub fn style(&self) -> PieceStyle {
        self.style
    }

    fn piece(&self, text: &str, word_start: bool) -> Option<TokenId> {
        let candidate = match (self.style, word_start) {
            (PieceStyle::Hashes, true) | (PieceStyle::Metaspace, false) => text.to_string(),
            (PieceStyle::Hashes, false) => format!("##{}", text),
            (PieceStyle::Metaspace, true) => format!("▁{}", text),
        };
        self.encoder.get(&candidate).copied()
    }

    fn encode_word(&self, word: &str, tokens: &mut Vec<TokenId>) {
        if word.chars().count() > MAX_WORD_CHARS {
            tokens.extend(self.unk);
            return;
        }

        let mut pieces = Vec::new();
        let mut start = 0;

        while start < word.len() {
            let mut matched = None;
            let mut end = word.len();

            while end > start {
                if let Some(id) = self.piece(&word[start..end], start == 0) {
                    matched = Some(id);
                    break;
                }
                end = word[..end]
                    .char_indices()
                    .next_back()
                    .map(|(i, _)| i)
                    .unwrap_or(start);
            }

            match matched {
                Some(id) => {
                    pieces.push(id);
                    start = end;
                }
                None => {
                    // One unmatched piece poisons the whole word.
                    tokens.extend(self.unk);
                    return;
                }
            }
        }

        tokens.extend(pieces);
    }

    fn encode_text(&self, text: &str, tokens: &mut Vec<TokenId>) {
        let text = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };

        for chunk in text.split_whitespace() {
            for word in split_punctuation(chunk) {
                self.encode_word(word, tokens);
            }
        }
    }
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || matches!(c, '\u{2000}'..='\u{206F}' | '\u{3000}'..='\u{303F}')
}

/// Every punctuation char becomes a word of its own.
fn split_punctuation(word: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0;

    for (i, c) in word.char_indices() {
        if is_punctuation(c) {
            if i > start {
                words.push(&word[start..i]);
            }
            let end = i + c.len_utf8();
            words.push(&word[i..end]);
            start = end;
        }
    }
    if start < word.len() {
        words.push(&word[start..]);
    }

    words
}

impl Tokenizer for WordPieceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();

        for segment in split_special(text, &self.specials) {
            match segment {
                Segment::Special(id) => tokens.push(id),
                Segment::Text(text) => self.encode_text(text, &mut tokens),
            }
        }

        Ok(tokens)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let mut text = String::new();

        for &id in tokens {
            let Some(token) = self.vocab.token(id) else {
                anyhow::bail!("Token id {} out of range", id.0);
            };
            if self.vocab.token_type(id) == TokenType::Control {
                continue;
            }
            match self.style {
                PieceStyle::Hashes => match token.strip_prefix("##") {
                    Some(rest) => text.push_str(rest),
                    None => {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(token);
                    }
                },
                PieceStyle::Metaspace => text.push_str(&token.replace('▁', " ")),
            }
        }

        Ok(match self.style {
            PieceStyle::Hashes => text,
            PieceStyle::Metaspace => text.trim_start().to_string(),
        })
    }

    fn kind(&self) -> TokenizerKind {
        TokenizerKind::WordPiece
    }

    fn vocab_size(&self) -> usize {
        self.vocab.size()
    }

    fn bos_token(&self) -> TokenId {
        self.vocab.bos_token
    }

    fn eos_token(&self) -> TokenId {
        self.vocab.eos_token
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.encoder.get(token).copied()
    }

    fn id_to_token(&self, id: TokenId) -> Option<&str> {
        self.vocab.token(id)
    }
}
