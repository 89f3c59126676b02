pub mod alias;
pub mod registry;
pub mod resolver;

pub use alias::{AliasRule, AliasTable};
pub use registry::ModelRegistry;
pub use resolver::ModelResolver;

use serde::{Deserialize, Serialize};

pub type ModelName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub i32);

impl TokenId {
    pub const BOS: Self = Self(1);
    pub const EOS: Self = Self(2);

    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl From<TokenId> for i32 {
    fn from(id: TokenId) -> Self {
        id.0
    }
}

/// A model the registry knows how to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub name: ModelName,
    /// URI or filesystem path of the GGUF definition.
    pub locator: String,
    pub preload: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            preload: false,
        }
    }
}
