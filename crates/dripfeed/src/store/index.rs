//! # Cache Index
//!
//! The companion file of the durable tier. It lets the cache rebuild its
//! bookkeeping at startup without reading any payload bytes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use crate::cache::{AssetType, Metadata};

/// One durable entry as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub key: String,
    pub asset_type: AssetType,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
    pub durable_path: PathBuf,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Aggregate counters persisted alongside the records
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexCounters {
    #[serde(default)]
    pub hit_count: u64,
    #[serde(default)]
    pub miss_count: u64,
    #[serde(default)]
    pub eviction_count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexFileRef<'a> {
    entries: &'a [IndexRecord],
    #[serde(flatten)]
    counters: IndexCounters,
}

#[derive(Debug, Clone)]
pub struct CacheIndex {
    path: PathBuf,
}

impl CacheIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the index.
    ///
    /// Never fails: an unreadable file yields an empty index, malformed
    /// records are skipped one by one, and records whose blob file is gone
    /// are dropped.
    pub async fn load(&self) -> (Vec<IndexRecord>, IndexCounters) {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Default::default(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to read cache index, starting empty");
                return Default::default();
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Cache index is corrupt, starting empty");
                return Default::default();
            }
        };

        let counters = serde_json::from_value::<IndexCounters>(value.clone()).unwrap_or_default();

        let raw_entries = match value.get("entries") {
            Some(serde_json::Value::Array(entries)) => entries.clone(),
            _ => Vec::new(),
        };

        let mut records = Vec::with_capacity(raw_entries.len());
        let mut discarded = 0usize;
        for raw_entry in raw_entries {
            match serde_json::from_value::<IndexRecord>(raw_entry) {
                Ok(record) => {
                    if fs::try_exists(&record.durable_path).await.unwrap_or(false) {
                        records.push(record);
                    } else {
                        debug!(key = %record.key, "Dropping index record with missing blob");
                    }
                }
                Err(e) => {
                    discarded += 1;
                    debug!(error = %e, "Discarding malformed index record");
                }
            }
        }

        if discarded > 0 {
            warn!(path = ?self.path, discarded, "Discarded malformed cache index records");
        }

        (records, counters)
    }

    /// Persist the index, replacing the previous file atomically
    pub async fn save(&self, records: &[IndexRecord], counters: IndexCounters) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec(&IndexFileRef {
            entries: records,
            counters,
        })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json).await?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, durable_path: PathBuf) -> IndexRecord {
        let now = Utc::now();
        IndexRecord {
            key: key.to_string(),
            asset_type: AssetType::Text,
            size_bytes: 10,
            created_at: now,
            last_accessed_at: now,
            hit_count: 2,
            durable_path,
            compressed: false,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("blob");
        std::fs::write(&blob, b"0123456789").unwrap();

        let index = CacheIndex::new(dir.path().join("index.json"));
        let counters = IndexCounters {
            hit_count: 3,
            miss_count: 1,
            eviction_count: 4,
        };
        index
            .save(&[record("a", blob.clone())], counters)
            .await
            .unwrap();

        let (records, loaded) = index.load().await;
        assert_eq!(records, vec![record_with_times(&records[0], "a", blob)]);
        assert_eq!(loaded, counters);
    }

    fn record_with_times(template: &IndexRecord, key: &str, path: PathBuf) -> IndexRecord {
        IndexRecord {
            created_at: template.created_at,
            last_accessed_at: template.last_accessed_at,
            ..record(key, path)
        }
    }

    #[tokio::test]
    async fn test_missing_blobs_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path().join("index.json"));
        index
            .save(
                &[record("gone", dir.path().join("nope"))],
                IndexCounters::default(),
            )
            .await
            .unwrap();

        let (records, _) = index.load().await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_records_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("blob");
        std::fs::write(&blob, b"x").unwrap();

        let good = serde_json::to_value(record("good", blob)).unwrap();
        let file = serde_json::json!({
            "entries": [good, {"key": 42}, "nonsense"],
            "hitCount": 9,
            "missCount": 1,
            "evictionCount": 0
        });
        let path = dir.path().join("index.json");
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let (records, counters) = CacheIndex::new(path).load().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "good");
        assert_eq!(counters.hit_count, 9);
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let (records, counters) = CacheIndex::new(path).load().await;
        assert!(records.is_empty());
        assert_eq!(counters, IndexCounters::default());
    }
}
