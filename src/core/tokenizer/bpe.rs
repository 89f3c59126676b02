use super::traits::{Tokenizer, TokenizerKind};
use super::{split_special, Segment, Vocabulary};
use crate::core::{Result, TokenId};
use std::collections::HashMap;

const GPT2_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

const LLAMA3_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

const QWEN2_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

fn pattern_for(pre: Option<&str>) -> &'static str {
    match pre {
        Some("llama-bpe") | Some("llama3") | Some("smaug-bpe") | Some("falcon3") => LLAMA3_PATTERN,
        Some("qwen2") | Some("deepseek-r1-qwen") => QWEN2_PATTERN,
        _ => GPT2_PATTERN,
    }
}

/// Byte-level BPE as used by GPT-2 style vocabularies (`tokenizer.ggml.model = gpt2`).
pub struct BpeTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    specials: Vec<(String, TokenId)>,
    pattern: fancy_regex::Regex,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocabulary) -> Result<Self> {
        let byte_encoder = Self::build_byte_encoder();
        let byte_decoder: HashMap<char, u8> = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        let mut bpe_ranks = HashMap::with_capacity(vocab.merges.len());
        for (i, merge) in vocab.merges.iter().enumerate() {
            if let Some((left, right)) = merge.split_once(' ') {
                bpe_ranks.entry((left.to_string(), right.to_string())).or_insert(i);
            }
        }

        let pattern = fancy_regex::Regex::new(pattern_for(vocab.pre.as_deref()))?;

        Ok(Self {
            encoder: vocab.encoder(),
            specials: vocab.special_tokens(),
            vocab,
            bpe_ranks,
            byte_encoder,
            byte_decoder,
            pattern,
        })
    }

    /// GPT-2 maps every byte onto a printable char so merges operate on text.
    fn build_byte_encoder() -> [char; 256] {
        let mut mapping = ['\0'; 256];
        let mut assigned = [false; 256];

        for range in [b'!'..=b'~', 0xA1..=0xAC, 0xAE..=0xFF] {
            for b in range {
                mapping[b as usize] = char::from(b);
                assigned[b as usize] = true;
            }
        }

        let mut offset: u32 = 256;
        for b in 0..256usize {
            if !assigned[b] {
                mapping[b] = char::from_u32(offset).unwrap_or(char::REPLACEMENT_CHARACTER);
                offset += 1;
            }
        }

        mapping
    }

    fn get_pairs(word: &[String]) -> Vec<(String, String)> {
        word.windows(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        if self.encoder.contains_key(token) {
            return vec![token.to_string()];
        }

        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();

        loop {
            let pairs = Self::get_pairs(&word);
            if pairs.is_empty() {
                break;
            }

            let bigram = pairs
                .iter()
                .filter_map(|pair| self.bpe_ranks.get(pair).map(|&rank| (pair, rank)))
                .min_by_key(|(_, rank)| *rank)
                .map(|(pair, _)| pair.clone());

            let Some(bigram) = bigram else {
                break;
            };

            let mut new_word = Vec::with_capacity(word.len());
            let mut i = 0;

            while i < word.len() {
                if i < word.len() - 1 && word[i] == bigram.0 && word[i + 1] == bigram.1 {
                    new_word.push(format!("{}{}", word[i], word[i + 1]));
                    i += 2;
                } else {
                    new_word.push(word[i].clone());
                    i += 1;
                }
            }
            word = new_word;
        }
        word
    }

    fn byte_encode(&self, text: &str) -> String {
        text.bytes().map(|b| self.byte_encoder[b as usize]).collect()
    }

    fn push_piece(&self, piece: &str, tokens: &mut Vec<TokenId>) {
        if let Some(&id) = self.encoder.get(piece) {
            tokens.push(id);
            return;
        }
        // Vocabularies normally hold every single byte char; fall back to
        // them, then to <unk>, rather than dropping input silently.
        for c in piece.chars() {
            let mut buf = [0u8; 4];
            match self.encoder.get(c.encode_utf8(&mut buf) as &str) {
                Some(&id) => tokens.push(id),
                None => tokens.extend(self.vocab.unk_token),
            }
        }
    }

    fn encode_text(&self, text: &str, tokens: &mut Vec<TokenId>) -> Result<()> {
        for m in self.pattern.find_iter(text) {
            let m = m?;
            let encoded = self.byte_encode(m.as_str());
            for piece in self.bpe(&encoded) {
                self.push_piece(&piece, tokens);
            }
        }
        Ok(())
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();

        for segment in split_special(text, &self.specials) {
            match segment {
                Segment::Special(id) => tokens.push(id),
                Segment::Text(text) => self.encode_text(text, &mut tokens)?,
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
            if self.specials.iter().any(|(_, special)| *special == id) {
                bytes.extend_from_slice(token.as_bytes());
                continue;
            }
            for c in token.chars() {
                if let Some(&b) = self.byte_decoder.get(&c) {
                    bytes.push(b);
                }
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn kind(&self) -> TokenizerKind {
        TokenizerKind::Bpe
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
