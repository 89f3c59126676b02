use crate::infra::Result;
use anyhow::{bail, Context};
use bytes::Bytes;
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_REGISTRY: &str = "registry.ollama.ai";
pub const MODEL_MEDIA_TYPE: &str = "application/vnd.ollama.image.model";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Where model bytes come from. `open` may block on I/O.
pub trait ModelSource: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>>;
}

impl<S: ModelSource + ?Sized> ModelSource for Arc<S> {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        (**self).open(locator)
    }
}

/// Local paths, `file://` URLs and `~/` paths.
#[derive(Debug, Clone, Default)]
pub struct FileSource;

impl FileSource {
    pub fn resolve_path(locator: &str) -> Result<PathBuf> {
        if locator.starts_with("file://") {
            let url = Url::parse(locator)?;
            return url
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("Not a local file URL: {}", locator));
        }
        if let Some(rest) = locator.strip_prefix("~/") {
            let home = dirs::home_dir().context("no home directory to expand ~")?;
            return Ok(home.join(rest));
        }
        Ok(PathBuf::from(locator))
    }
}

impl ModelSource for FileSource {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        let path = Self::resolve_path(locator)?;
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Box::new(file))
    }
}

/// Plain `http(s)://` downloads.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl ModelSource for HttpSource {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        debug!(url = %locator, "fetching model over http");
        let response = self.client.get(locator).send()?.error_for_status()?;
        Ok(Box::new(response))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType")]
    pub media_type: Option<String>,
    pub layers: Vec<Layer>,
}

impl Manifest {
    pub fn model_layer(&self) -> Option<&Layer> {
        self.layers
            .iter()
            .find(|layer| layer.media_type.as_deref() == Some(MODEL_MEDIA_TYPE))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "mediaType")]
    pub media_type: Option<String>,
    pub digest: String,
    pub size: u64,
}

/// A parsed `ollama://[registry/]namespace/model[:tag]` locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaReference {
    pub registry: String,
    /// `namespace/model`
    pub name: String,
    pub tag: String,
}

impl OllamaReference {
    pub fn parse(locator: &str) -> Result<Self> {
        let Some(reference) = locator.strip_prefix("ollama://") else {
            bail!("Not an ollama locator: {}", locator);
        };

        let (path, tag) = match reference.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, tag),
            _ => (reference, "latest"),
        };

        let parts: Vec<&str> = path.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) || tag.is_empty() {
            bail!("Malformed ollama locator: {}", locator);
        }

        let (registry, name) = match parts.as_slice() {
            [model] => (DEFAULT_REGISTRY.to_string(), format!("library/{}", model)),
            [namespace, model] => (DEFAULT_REGISTRY.to_string(), format!("{}/{}", namespace, model)),
            [registry, namespace, model] => (registry.to_string(), format!("{}/{}", namespace, model)),
            _ => bail!("Malformed ollama locator: {}", locator),
        };

        Ok(Self {
            registry,
            name,
            tag: tag.to_string(),
        })
    }
}

/// Pulls the model layer of an Ollama image, preferring a local
/// `~/.ollama/models` store when it already holds the manifest.
#[derive(Debug, Clone)]
pub struct OllamaRegistrySource {
    client: Client,
    models_dir: Option<PathBuf>,
}

impl OllamaRegistrySource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            models_dir: Self::default_models_dir(),
        }
    }

    pub fn default_models_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ollama").join("models"))
    }

    pub fn with_models_dir(mut self, models_dir: Option<PathBuf>) -> Self {
        self.models_dir = models_dir;
        self
    }

    fn open_local(&self, reference: &OllamaReference) -> Result<Option<File>> {
        let Some(models_dir) = &self.models_dir else {
            return Ok(None);
        };

        let manifest_path = models_dir
            .join("manifests")
            .join(&reference.registry)
            .join(&reference.name)
            .join(&reference.tag);
        if !manifest_path.is_file() {
            return Ok(None);
        }

        let manifest: Manifest = serde_json::from_reader(File::open(&manifest_path)?)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;
        let layer = manifest
            .model_layer()
            .with_context(|| format!("no model layer in {}", manifest_path.display()))?;

        let blob_path = models_dir.join("blobs").join(layer.digest.replace(':', "-"));
        if !blob_path.is_file() {
            return Ok(None);
        }

        debug!(path = %blob_path.display(), "using local ollama blob");
        Ok(Some(File::open(blob_path)?))
    }

    fn fetch_manifest(&self, reference: &OllamaReference) -> Result<Manifest> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            reference.registry, reference.name, reference.tag
        );
        debug!(url = %url, "fetching ollama manifest");

        let manifest = self
            .client
            .get(&url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(manifest)
    }
}

impl ModelSource for OllamaRegistrySource {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        let reference = OllamaReference::parse(locator)?;

        if let Some(file) = self.open_local(&reference)? {
            return Ok(Box::new(file));
        }

        let manifest = self
            .fetch_manifest(&reference)
            .with_context(|| format!("fetching manifest for {}", locator))?;
        let layer = manifest
            .model_layer()
            .with_context(|| format!("no model layer in manifest for {}", locator))?;

        let url = format!(
            "https://{}/v2/{}/blobs/{}",
            reference.registry, reference.name, layer.digest
        );
        debug!(url = %url, size = layer.size, "streaming model blob");
        let response = self.client.get(&url).send()?.error_for_status()?;
        Ok(Box::new(response))
    }
}

/// Serves fixed byte blobs keyed by locator.
#[derive(Debug, Default)]
pub struct MemorySource {
    blobs: HashMap<String, Bytes>,
    opens: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(mut self, locator: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.blobs.insert(locator.into(), bytes.into());
        self
    }

    /// How many times `open` has been called.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ModelSource for MemorySource {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .blobs
            .get(locator)
            .with_context(|| format!("no blob for {}", locator))?;
        Ok(Box::new(Cursor::new(bytes.clone())))
    }
}

/// Dispatches on the locator scheme.
#[derive(Debug, Clone)]
pub struct DefaultSource {
    file: FileSource,
    http: HttpSource,
    ollama: OllamaRegistrySource,
}

impl DefaultSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(Client::builder().timeout(timeout).build()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            file: FileSource,
            http: HttpSource::with_client(client.clone()),
            ollama: OllamaRegistrySource::new(client),
        }
    }

    pub fn with_ollama_models_dir(mut self, models_dir: Option<PathBuf>) -> Self {
        self.ollama = self.ollama.with_models_dir(models_dir);
        self
    }
}

impl ModelSource for DefaultSource {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        match locator.split_once("://").map(|(scheme, _)| scheme) {
            Some("ollama") => self.ollama.open(locator),
            Some("http") | Some("https") => self.http.open(locator),
            Some("file") | None => self.file.open(locator),
            Some(scheme) => bail!("Unsupported locator scheme '{}': {}", scheme, locator),
        }
    }
}
