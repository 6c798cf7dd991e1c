//! Payload references.
//!
//! A work unit's input lives in a blob store and travels to the runner as a
//! URI. [`PayloadStore`] persists inline payloads for the launcher;
//! [`PayloadFetcher`] resolves a URI back to bytes inside the execution
//! context.
//!
//! Supported schemes:
//! - `file://<absolute path>` - local filesystem ([`FsPayloadStore`])
//! - `mem://<key>` - process-local map ([`MemoryPayloadStore`])
//! - `http://`, `https://` - plain GET ([`HttpPayloadFetcher`])

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors resolving or storing a payload.
///
/// The display text is the bare reason; callers prefix it with the URI.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Nothing is stored at the reference
    #[error("The specified key does not exist.")]
    NotFound(String),

    /// The blob store refused access
    #[error("Access denied")]
    AccessDenied(String),

    /// No fetcher handles the URI scheme
    #[error("Unsupported payload reference: {0}")]
    UnsupportedScheme(String),

    /// Network or protocol failure
    #[error("{0}")]
    Transport(String),

    /// I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Resolves a payload reference URI to its bytes.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Fetch the raw payload bytes.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, PayloadError>;
}

/// Persists payloads and hands back a reference URI.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store `body` under `key`, returning the URI that resolves to it.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String, PayloadError>;
}

fn scheme_of(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(scheme, _)| scheme)
}

/// Filesystem payload store.
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    root: PathBuf,
}

impl FsPayloadStore {
    /// Create a store rooted at `root`. Relative roots are made absolute so
    /// the URIs it hands out resolve from any working directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PayloadError> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PayloadStore for FsPayloadStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String, PayloadError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        debug!("Stored payload at {}", path.display());
        Ok(format!("file://{}", path.display()))
    }
}

#[async_trait]
impl PayloadFetcher for FsPayloadStore {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, PayloadError> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| PayloadError::UnsupportedScheme(uri.to_string()))?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(uri.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(PayloadError::AccessDenied(uri.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local payload store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryPayloadStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryPayloadStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an object, returning whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String, PayloadError> {
        self.objects.write().await.insert(key.to_string(), body);
        Ok(format!("mem://{}", key))
    }
}

#[async_trait]
impl PayloadFetcher for MemoryPayloadStore {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, PayloadError> {
        let key = uri
            .strip_prefix("mem://")
            .ok_or_else(|| PayloadError::UnsupportedScheme(uri.to_string()))?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PayloadError::NotFound(uri.to_string()))
    }
}

/// HTTP(S) payload fetcher.
#[derive(Debug, Clone)]
pub struct HttpPayloadFetcher {
    client: reqwest::Client,
}

impl HttpPayloadFetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, PayloadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PayloadError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, PayloadError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| PayloadError::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| PayloadError::Transport(e.to_string()))?;
                Ok(body.to_vec())
            }
            reqwest::StatusCode::NOT_FOUND => Err(PayloadError::NotFound(uri.to_string())),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(PayloadError::AccessDenied(uri.to_string()))
            }
            status => Err(PayloadError::Transport(format!("HTTP {}", status))),
        }
    }
}

/// Dispatches fetches by URI scheme.
#[derive(Clone, Default)]
pub struct PayloadRouter {
    fetchers: HashMap<String, Arc<dyn PayloadFetcher>>,
}

impl PayloadRouter {
    /// Create a router with no schemes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Router for `file`, `http` and `https` references.
    pub fn standard(http_timeout: Duration) -> Result<Self, PayloadError> {
        let http: Arc<dyn PayloadFetcher> = Arc::new(HttpPayloadFetcher::new(http_timeout)?);
        // FsPayloadStore only needs its root for writes.
        let fs: Arc<dyn PayloadFetcher> = Arc::new(FsPayloadStore {
            root: PathBuf::from("/"),
        });
        Ok(Self::new()
            .with_scheme("file", fs)
            .with_scheme("http", http.clone())
            .with_scheme("https", http))
    }

    /// Route `scheme://` references to `fetcher`.
    pub fn with_scheme(mut self, scheme: impl Into<String>, fetcher: Arc<dyn PayloadFetcher>) -> Self {
        self.fetchers.insert(scheme.into(), fetcher);
        self
    }
}

#[async_trait]
impl PayloadFetcher for PayloadRouter {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, PayloadError> {
        let fetcher = scheme_of(uri)
            .and_then(|scheme| self.fetchers.get(scheme))
            .ok_or_else(|| PayloadError::UnsupportedScheme(uri.to_string()))?;
        fetcher.fetch(uri).await
    }
}
