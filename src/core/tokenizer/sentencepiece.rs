use super::traits::{Tokenizer, TokenizerKind};
use super::{split_special, Segment, TokenType, Vocabulary};
use crate::core::{Result, TokenId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

const SPACE: char = '▁';

#[derive(Debug, Clone, Copy)]
struct Symbol {
    start: usize,
    len: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, PartialEq)]
struct Bigram {
    score: f32,
    left: usize,
    right: usize,
    len: usize,
}

impl Eq for Bigram {}

impl Ord for Bigram {
    // Highest score first, leftmost on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// SentencePiece BPE (`tokenizer.ggml.model = llama`): greedily merges the
/// adjacent pair with the best score, falling back to `<0xNN>` byte tokens
/// for characters the vocabulary lacks.
pub struct SentencePieceTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    byte_tokens: [Option<TokenId>; 256],
    specials: Vec<(String, TokenId)>,
}

impl SentencePieceTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let encoder = vocab.encoder();

        let mut byte_tokens = [None; 256];
        for (b, slot) in byte_tokens.iter_mut().enumerate() {
            *slot = encoder.get(&format!("<0x{:02X}>", b)).copied();
        }

        Self {
            specials: vocab.special_tokens(),
            vocab,
            encoder,
            byte_tokens,
        }
    }

    fn normalize(&self, text: &str, first: bool) -> String {
        let mut normalized = String::with_capacity(text.len() + SPACE.len_utf8());
        if first && self.vocab.add_space_prefix && !text.starts_with(char::is_whitespace) {
            normalized.push(SPACE);
        }
        for c in text.chars() {
            normalized.push(if c == ' ' { SPACE } else { c });
        }
        normalized
    }

    fn mergeable(&self, piece: &str) -> Option<TokenId> {
        let id = *self.encoder.get(piece)?;
        match self.vocab.token_type(id) {
            TokenType::Control | TokenType::Unknown | TokenType::Unused => None,
            _ => Some(id),
        }
    }

    fn try_add(&self, text: &str, symbols: &[Symbol], left: usize, right: usize, heap: &mut BinaryHeap<Bigram>) {
        let start = symbols[left].start;
        let end = symbols[right].start + symbols[right].len;
        if let Some(id) = self.mergeable(&text[start..end]) {
            heap.push(Bigram {
                score: self.vocab.score(id),
                left,
                right,
                len: end - start,
            });
        }
    }

    fn encode_text(&self, text: &str, tokens: &mut Vec<TokenId>) {
        let mut symbols: Vec<Symbol> = Vec::with_capacity(text.len());
        for (index, (start, c)) in text.char_indices().enumerate() {
            symbols.push(Symbol {
                start,
                len: c.len_utf8(),
                prev: index.checked_sub(1),
                next: None,
            });
            if index > 0 {
                symbols[index - 1].next = Some(index);
            }
        }
        if symbols.is_empty() {
            return;
        }

        let mut heap = BinaryHeap::new();
        for left in 0..symbols.len() - 1 {
            self.try_add(text, &symbols, left, left + 1, &mut heap);
        }

        while let Some(bigram) = heap.pop() {
            let (left, right) = (bigram.left, bigram.right);
            // Skip pairs invalidated by an earlier merge.
            if symbols[left].len == 0
                || symbols[right].len == 0
                || symbols[left].next != Some(right)
                || symbols[left].len + symbols[right].len != bigram.len
            {
                continue;
            }

            symbols[left].len += symbols[right].len;
            symbols[right].len = 0;
            symbols[left].next = symbols[right].next;
            if let Some(next) = symbols[right].next {
                symbols[next].prev = Some(left);
            }

            if let Some(prev) = symbols[left].prev {
                self.try_add(text, &symbols, prev, left, &mut heap);
            }
            if let Some(next) = symbols[left].next {
                self.try_add(text, &symbols, left, next, &mut heap);
            }
        }

        let mut cursor = Some(0);
        while let Some(index) = cursor {
            let symbol = symbols[index];
            let piece = &text[symbol.start..symbol.start + symbol.len];
            match self.encoder.get(piece) {
                Some(&id) => tokens.push(id),
                None => {
                    for b in piece.bytes() {
                        match self.byte_tokens[b as usize] {
                            Some(id) => tokens.push(id),
                            None => tokens.extend(self.vocab.unk_token),
                        }
                    }
                }
            }
            cursor = symbol.next;
        }
    }

    fn byte_value(token: &str) -> Option<u8> {
        let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
        u8::from_str_radix(hex, 16).ok()
    }
}

impl Tokenizer for SentencePieceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();

        for (index, segment) in split_special(text, &self.specials).into_iter().enumerate() {
            match segment {
                Segment::Special(id) => tokens.push(id),
                Segment::Text(text) => {
                    let normalized = self.normalize(text, index == 0);
                    self.encode_text(&normalized, &mut tokens);
                }
            }
        }

        Ok(tokens)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let mut bytes = Vec::new();

        for &id in tokens {
            let Some(token) = self.vocab.token(id) else {
                anyhow::bail!("Token id {} out of range", id.0);
            };
            match self.vocab.token_type(id) {
                TokenType::Control => continue,
                TokenType::Byte => bytes.extend(Self::byte_value(token)),
                _ => bytes.extend_from_slice(token.replace(SPACE, " ").as_bytes()),
            }
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(match text.strip_prefix(' ') {
            Some(stripped) if self.vocab.add_space_prefix => stripped.to_string(),
            _ => text,
        })
    }

    fn kind(&self) -> TokenizerKind {
        TokenizerKind::SentencePiece
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
