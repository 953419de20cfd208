//! # Volatile Store
//!
//! Process-lifetime blob storage. Budgeting is the asset cache's job.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{BlobName, BlobStore, StoreResult};

#[derive(Default)]
pub struct VolatileStore {
    blobs: Mutex<HashMap<BlobName, Bytes>>,
}

impl VolatileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, name: &BlobName) -> Option<Bytes> {
        self.blobs.lock().get(name).cloned()
    }

    pub(crate) fn insert(&self, name: BlobName, data: Bytes) {
        self.blobs.lock().insert(name, data);
    }

    pub(crate) fn take(&self, name: &BlobName) -> Option<Bytes> {
        self.blobs.lock().remove(name)
    }
}

#[async_trait::async_trait]
impl BlobStore for VolatileStore {
    async fn read(&self, name: &BlobName) -> StoreResult<Option<Bytes>> {
        Ok(self.get(name))
    }

    async fn write(&self, name: &BlobName, data: Bytes) -> StoreResult<()> {
        self.insert(name.clone(), data);
        Ok(())
    }

    async fn remove(&self, name: &BlobName) -> StoreResult<()> {
        if self.take(name).is_some() {
            debug!(key = %name.key, "Removed blob from volatile store");
        }
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.blobs.lock().clear();
        debug!("Volatile store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(key: &str) -> BlobName {
        BlobName::new("text", key)
    }

    #[tokio::test]
    async fn test_writes_replace_and_removes_drop() {
        let store = VolatileStore::new();
        store.write(&name("a"), Bytes::from_static(b"hello")).await.unwrap();
        store.write(&name("b"), Bytes::from_static(b"hi")).await.unwrap();

        store.write(&name("a"), Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(store.read(&name("a")).await.unwrap().unwrap(), "x");

        store.remove(&name("b")).await.unwrap();
        assert!(store.read(&name("b")).await.unwrap().is_none());
        assert_eq!(store.take(&name("a")).unwrap(), "x");
        assert!(store.get(&name("a")).is_none());

        store.insert(name("c"), Bytes::from_static(b"c"));
        store.clear().await.unwrap();
        assert!(store.get(&name("c")).is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let store = VolatileStore::new();
        assert!(store.remove(&name("ghost")).await.is_ok());
        assert!(store.read(&name("ghost")).await.unwrap().is_none());
    }
}
