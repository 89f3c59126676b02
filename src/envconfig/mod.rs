use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Settings read from `TOKENIZER_*` variables (and `OLLAMA_MODELS`).
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub host: Host,
    /// `TOKENIZER_MODELS=name=locator,name=locator`
    pub models: Vec<(String, String)>,
    pub fallback: Option<String>,
    pub preload: Vec<String>,
    pub timeout: Duration,
    pub ollama_models_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
    pub port: u16,
}

impl Host {
    pub fn parse(value: &str) -> crate::Result<Self> {
        match value.rsplit_once(':') {
            Some((host, port)) => Ok(Self {
                host: if host.is_empty() { DEFAULT_HOST.to_string() } else { host.to_string() },
                port: port.parse().with_context(|| format!("invalid port in {}", value))?,
            }),
            None => Ok(Self {
                host: value.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Host {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = match var("TOKENIZER_HOST") {
            Some(value) => Host::parse(&value)?,
            None => Host::default(),
        };

        let models = var("TOKENIZER_MODELS")
            .map(|value| parse_model_map(&value))
            .unwrap_or_default();

        let timeout = match var("TOKENIZER_TIMEOUT") {
            Some(value) => Duration::from_secs(
                value
                    .parse()
                    .with_context(|| format!("invalid TOKENIZER_TIMEOUT: {}", value))?,
            ),
            None => crate::service::DEFAULT_TIMEOUT,
        };

        Ok(Self {
            host,
            models,
            fallback: var("TOKENIZER_FALLBACK"),
            preload: var("TOKENIZER_PRELOAD")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            timeout,
            ollama_models_dir: models_dir(var("OLLAMA_MODELS")),
        })
    }
}

/// Parses `name=locator` pairs separated by commas. Malformed entries are
/// skipped with a warning.
pub fn parse_model_map(value: &str) -> Vec<(String, String)> {
    split_list(value)
        .into_iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((name, locator)) if !name.trim().is_empty() && !locator.trim().is_empty() => {
                Some((name.trim().to_string(), locator.trim().to_string()))
            }
            _ => {
                warn!(entry = %entry, "ignoring model mapping without name=locator");
                None
            }
        })
        .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// The Ollama model store: `OLLAMA_MODELS` or `~/.ollama/models`.
pub fn models_dir(configured: Option<String>) -> Option<PathBuf> {
    match configured {
        Some(path) => match path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
            None => Some(PathBuf::from(path)),
        },
        None => dirs::home_dir().map(|home| home.join(".ollama").join("models")),
    }
}
