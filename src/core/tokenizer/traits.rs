use crate::core::{Result, TokenId};
use serde::Serialize;

/// A loaded tokenizer engine.
///
/// Engines are shared by every request for their model and are called
/// concurrently through `&self`; implementations must be reentrant.
/// `encode` never adds BOS/EOS, so encoding a text piecewise and
/// concatenating gives a count that adds up.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;

    fn kind(&self) -> TokenizerKind;
    fn vocab_size(&self) -> usize;
    fn bos_token(&self) -> TokenId;
    fn eos_token(&self) -> TokenId;

    fn token_to_id(&self, token: &str) -> Option<TokenId>;
    fn id_to_token(&self, id: TokenId) -> Option<&str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Bpe,
    SentencePiece,
    WordPiece,
}

impl TokenizerKind {
    pub fn from_model(model: &str) -> Option<Self> {
        match model.to_lowercase().as_str() {
            "gpt2" | "bpe" => Some(TokenizerKind::Bpe),
            "llama" | "spm" | "sentencepiece" => Some(TokenizerKind::SentencePiece),
            "bert" | "wpm" | "wordpiece" => Some(TokenizerKind::WordPiece),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerKind::Bpe => "bpe",
            TokenizerKind::SentencePiece => "sentencepiece",
            TokenizerKind::WordPiece => "wordpiece",
        }
    }
}

impl std::fmt::Display for TokenizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
