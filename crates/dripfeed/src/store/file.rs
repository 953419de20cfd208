//! # Durable Store
//!
//! Blobs as files under `<root>/<namespace>/<sha256(key)>`. Writes land in a
//! temporary file first and are renamed into place, so a crash never leaves a
//! half-written blob under its real name.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use super::{BlobName, BlobStore, StoreResult};

#[derive(Debug, Clone)]
pub struct DurableStore {
    root: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl DurableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(&self.root).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Get the path for a stored blob
    pub fn path_of(&self, name: &BlobName) -> PathBuf {
        self.root.join(&name.namespace).join(name.to_filename())
    }
}

#[async_trait::async_trait]
impl BlobStore for DurableStore {
    async fn read(&self, name: &BlobName) -> StoreResult<Option<Bytes>> {
        let path = self.path_of(name);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read durable blob");
                Err(e)
            }
        }
    }

    async fn write(&self, name: &BlobName, data: Bytes) -> StoreResult<()> {
        self.ensure_initialized().await?;

        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("tmp");
        if let Err(e) = fs::write(&temp_path, &data).await {
            warn!(path = ?temp_path, error = %e, "Failed to write durable blob");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            warn!(
                from = ?temp_path,
                to = ?path,
                error = %e,
                "Failed to rename temporary blob file"
            );
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        debug!(key = %name.key, bytes = data.len(), "Wrote durable blob");
        Ok(())
    }

    async fn remove(&self, name: &BlobName) -> StoreResult<()> {
        let path = self.path_of(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove durable blob");
                Err(e)
            }
        }
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(dir = ?self.root, error = %e, "Failed to read durable store directory");
                return Err(e);
            }
        };

        let mut removed = 0;
        // Only the namespace directories hold blobs; files at the root
        // (the index) belong to the owner of the store.
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                if let Err(e) = fs::remove_dir_all(&path).await {
                    warn!(path = ?path, error = %e, "Failed to remove blob directory");
                } else {
                    removed += 1;
                }
            }
        }

        debug!(count = removed, "Cleared durable store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(dir.path().join("blobs"));
        let name = BlobName::new("image", "http://example.com/a.png");

        assert!(store.read(&name).await.unwrap().is_none());
        store
            .write(&name, Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let path = store.path_of(&name);
        assert!(path.starts_with(dir.path().join("blobs").join("image")));
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.read(&name).await.unwrap().unwrap(), "payload");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 7);

        store.remove(&name).await.unwrap();
        assert!(!path.exists());
        // Removing twice is fine
        store.remove(&name).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_keeps_root_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(dir.path());
        store
            .write(&BlobName::new("text", "a"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .write(&BlobName::new("data", "b"), Bytes::from_static(b"b"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("index.json"), b"{}").unwrap();

        store.clear().await.unwrap();

        assert!(store.read(&BlobName::new("text", "a")).await.unwrap().is_none());
        assert!(store.read(&BlobName::new("data", "b")).await.unwrap().is_none());
        assert!(dir.path().join("index.json").exists());
    }

    #[test]
    fn test_distinct_keys_map_to_distinct_files() {
        let store = DurableStore::new("/tmp/x");
        let a = store.path_of(&BlobName::new("text", "http://x/a?b=1"));
        let b = store.path_of(&BlobName::new("text", "http://x/a?b=2"));
        assert_ne!(a, b);
    }
}
