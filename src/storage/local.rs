use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::{StorageError, StorageProvider, StorageResult};
use crate::models::StorageBackendKind;

const STORAGE_CLASS: &str = "local-disk";

/// Filesystem backend rooted at a single directory.
///
/// Locators are paths relative to the root; `presign` returns
/// `{public_base}/{locator}` for the application to serve directly.
pub struct LocalStorage {
    root: PathBuf,
    public_base: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, locator: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(locator);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if locator.is_empty() || escapes {
            return Err(StorageError::NotFound(locator.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn map_io(locator: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(locator.to_string())
    } else {
        StorageError::Transient(format!("local storage error for {locator}: {err}"))
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Local
    }

    fn storage_class(&self) -> &str {
        STORAGE_CLASS
    }

    async fn write(
        &self,
        destination_hint: &str,
        bytes: Vec<u8>,
        _content_type: Option<String>,
        _content_disposition: Option<String>,
    ) -> StorageResult<String> {
        let full_path = self.full_path(destination_hint)?;
        debug!(locator = %destination_hint, size = bytes.len(), "local storage write");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                warn!(parent = %parent.display(), error = %err, "create_dir_all failed");
                StorageError::Transient(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        // temp file + rename so readers never observe a partial object
        let temp_path = full_path.with_extension("partial");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|err| map_io(destination_hint, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| map_io(destination_hint, err))?;
        file.sync_all()
            .await
            .map_err(|err| map_io(destination_hint, err))?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|err| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %err, "rename failed");
            map_io(destination_hint, err)
        })?;

        Ok(destination_hint.to_string())
    }

    async fn read(&self, locator: &str) -> StorageResult<Vec<u8>> {
        let full_path = self.full_path(locator)?;
        fs::read(full_path).await.map_err(|err| map_io(locator, err))
    }

    async fn delete(&self, locator: &str) -> StorageResult<()> {
        let full_path = self.full_path(locator)?;
        match fs::remove_file(full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io(locator, err)),
        }
    }

    async fn exists(&self, locator: &str) -> StorageResult<bool> {
        let full_path = self.full_path(locator)?;
        fs::try_exists(full_path)
            .await
            .map_err(|err| map_io(locator, err))
    }

    async fn presign(&self, locator: &str, _ttl: Duration) -> StorageResult<String> {
        if !self.exists(locator).await? {
            return Err(StorageError::NotFound(locator.to_string()));
        }
        Ok(format!(
            "{}/{}",
            self.public_base.trim_end_matches('/'),
            locator
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(dir.path(), "/storage/")
    }

    #[tokio::test]
    async fn writes_reads_and_deletes_objects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let locator = storage
            .write("orgs/a/files/b", b"hello".to_vec(), None, None)
            .await
            .unwrap();
        assert_eq!(locator, "orgs/a/files/b");
        assert!(storage.exists(&locator).await.unwrap());
        assert_eq!(storage.read(&locator).await.unwrap(), b"hello");

        storage.delete(&locator).await.unwrap();
        assert!(!storage.exists(&locator).await.unwrap());
        // deleting twice is not an error
        storage.delete(&locator).await.unwrap();
    }

    #[tokio::test]
    async fn missing_objects_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let err = storage.read("orgs/a/missing").await.unwrap_err();
        assert_eq!(err, StorageError::NotFound("orgs/a/missing".into()));
        let err = storage
            .presign("orgs/a/missing", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn rejects_locators_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let err = storage
            .write("../escape", b"x".to_vec(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(storage.read("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn presign_returns_direct_serving_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage
            .write("orgs/a/files/c", b"data".to_vec(), None, None)
            .await
            .unwrap();

        let url = storage
            .presign("orgs/a/files/c", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url, "/storage/orgs/a/files/c");
    }
}
