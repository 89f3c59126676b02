//! Informal model spellings and the canonical names they stand for.
//!
//! Callers tend to pass whatever name their client uses (`llama3.2`,
//! `phi3`, `granite-embedding:30m`), while the registry keys models by a
//! canonical spelling. Matching is exact and case-sensitive; the first
//! declared rule for a spelling wins.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasRule {
    pub informal: &'static str,
    pub canonical: &'static str,
}

const fn rule(informal: &'static str, canonical: &'static str) -> AliasRule {
    AliasRule {
        informal,
        canonical,
    }
}

pub const BUILTIN_ALIASES: &[AliasRule] = &[
    rule("tinyllama", "tiny"),
    rule("tinyllama:latest", "tiny"),
    rule("llama3.2", "llama-3.2"),
    rule("llama3.2:1b", "llama-3.2"),
    rule("llama3.2:3b", "llama-3.2"),
    rule("llama3.2:latest", "llama-3.2"),
    rule("llama3.1", "llama-3.1"),
    rule("llama3.1:8b", "llama-3.1"),
    rule("llama3.1:latest", "llama-3.1"),
    rule("phi3", "phi-3"),
    rule("phi3:mini", "phi-3"),
    rule("phi3:latest", "phi-3"),
    rule("phi4", "phi-4"),
    rule("phi4-mini", "phi-4"),
    rule("qwen2.5", "qwen-2.5"),
    rule("qwen2.5:0.5b", "qwen-2.5"),
    rule("qwen2.5:latest", "qwen-2.5"),
    rule("gemma2", "gemma-2"),
    rule("gemma2:2b", "gemma-2"),
    rule("gemma2:latest", "gemma-2"),
    rule("mistral:7b", "mistral"),
    rule("mistral:latest", "mistral"),
    rule("granite-embedding", "granite-embedding-30m"),
    rule("granite-embedding:30m", "granite-embedding-30m"),
    rule("nomic-embed-text:latest", "nomic-embed-text"),
    rule("all-minilm:latest", "all-minilm"),
];

#[derive(Debug, Clone, Copy)]
pub struct AliasTable {
    rules: &'static [AliasRule],
}

impl AliasTable {
    pub const fn new(rules: &'static [AliasRule]) -> Self {
        Self { rules }
    }

    pub fn normalize<'a>(&self, requested: &'a str) -> &'a str {
        self.rules
            .iter()
            .find(|rule| rule.informal == requested)
            .map(|rule| rule.canonical)
            .unwrap_or(requested)
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::new(BUILTIN_ALIASES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separator_drift() {
        let table = AliasTable::default();
        assert_eq!(table.normalize("llama3.2"), "llama-3.2");
        assert_eq!(table.normalize("phi3"), "phi-3");
        assert_eq!(table.normalize("qwen2.5"), "qwen-2.5");
        assert_eq!(table.normalize("granite-embedding:30m"), "granite-embedding-30m");
    }

    #[test]
    fn test_unmatched_is_unchanged() {
        let table = AliasTable::default();
        assert_eq!(table.normalize("granite-embedding-30m"), "granite-embedding-30m");
        assert_eq!(table.normalize("nonexistent-model"), "nonexistent-model");
        assert_eq!(table.normalize(""), "");
    }

    #[test]
    fn test_case_sensitive() {
        let table = AliasTable::default();
        assert_eq!(table.normalize("Llama3.2"), "Llama3.2");
        assert_eq!(table.normalize("PHI3"), "PHI3");
    }

    #[test]
    fn test_first_declared_wins() {
        static RULES: &[AliasRule] = &[rule("x", "first"), rule("x", "second")];
        let table = AliasTable::new(RULES);
        assert_eq!(table.normalize("x"), "first");
    }

    #[test]
    fn test_builtin_informal_spellings_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for rule in BUILTIN_ALIASES {
            assert!(seen.insert(rule.informal), "duplicate alias {}", rule.informal);
        }
    }
}
