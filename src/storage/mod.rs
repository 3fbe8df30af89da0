use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{PipelineError, PipelineResult};
use crate::models::StorageBackendKind;

pub mod hybrid;
pub mod local;
pub mod s3;

pub use hybrid::{BackupDeferred, HybridStorageManager, StoreRequest, StoredFile};
pub use local::LocalStorage;
pub use s3::S3Storage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Network or backend hiccup; the same call may succeed later.
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage object not found: {0}")]
    NotFound(String),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Uniform access to one physical storage backend.
///
/// Locators returned by [`StorageProvider::write`] are opaque: callers persist
/// them and hand them back unchanged.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    fn kind(&self) -> StorageBackendKind;

    fn storage_class(&self) -> &str;

    async fn write(
        &self,
        destination_hint: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        content_disposition: Option<String>,
    ) -> StorageResult<String>;

    async fn read(&self, locator: &str) -> StorageResult<Vec<u8>>;

    async fn delete(&self, locator: &str) -> StorageResult<()>;

    async fn exists(&self, locator: &str) -> StorageResult<bool>;

    /// Time-limited download URL. Backends without signing return a path
    /// served directly by the application.
    async fn presign(&self, locator: &str, ttl: Duration) -> StorageResult<String>;
}

/// The configured backends, at most one per kind.
#[derive(Clone, Default)]
pub struct StorageProviders {
    object_store: Option<Arc<dyn StorageProvider>>,
    local: Option<Arc<dyn StorageProvider>>,
}

impl StorageProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        match provider.kind() {
            StorageBackendKind::ObjectStore => self.object_store = Some(provider),
            StorageBackendKind::Local => self.local = Some(provider),
        }
        self
    }

    pub fn get(&self, kind: StorageBackendKind) -> PipelineResult<Arc<dyn StorageProvider>> {
        let provider = match kind {
            StorageBackendKind::ObjectStore => self.object_store.clone(),
            StorageBackendKind::Local => self.local.clone(),
        };
        provider.ok_or_else(|| {
            PipelineError::Configuration(format!("no {kind} storage backend configured"))
        })
    }

    pub fn configured(&self) -> Vec<StorageBackendKind> {
        let mut kinds = Vec::new();
        if self.object_store.is_some() {
            kinds.push(StorageBackendKind::ObjectStore);
        }
        if self.local.is_some() {
            kinds.push(StorageBackendKind::Local);
        }
        kinds
    }
}

pub(crate) fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    ))
}
