//! # Blob Store
//!
//! The trait both storage tiers implement.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::store::StoreResult;

/// Name of a stored blob: a namespace (one directory per asset type on the
/// durable tier) plus the caller's exact-match key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobName {
    pub namespace: String,
    pub key: String,
}

impl BlobName {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Convert to a filename-safe string
    pub fn to_filename(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

/// A trait for storage tiers that hold named byte blobs
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob; `None` if it does not exist
    async fn read(&self, name: &BlobName) -> StoreResult<Option<Bytes>>;

    /// Write a blob, replacing any previous content
    async fn write(&self, name: &BlobName, data: Bytes) -> StoreResult<()>;

    /// Remove a blob; removing a missing blob is not an error
    async fn remove(&self, name: &BlobName) -> StoreResult<()>;

    /// Remove every blob
    async fn clear(&self) -> StoreResult<()>;
}
