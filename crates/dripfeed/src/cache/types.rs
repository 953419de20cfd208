//! # Cache Types
//!
//! This module defines common types used across the caching system.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of assets the cache distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Text,
    Data,
    Script,
    Style,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Image => "image",
            AssetType::Text => "text",
            AssetType::Data => "data",
            AssetType::Script => "script",
            AssetType::Style => "style",
        }
    }

    /// Classify a response by its `Content-Type`
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return AssetType::Data;
        };
        let mime = crate::net::mime_essence(content_type);
        match mime.as_str() {
            m if m.starts_with("image/") => AssetType::Image,
            "text/css" => AssetType::Style,
            "text/javascript" | "application/javascript" | "application/x-lua" | "text/x-lua" => {
                AssetType::Script
            }
            m if m.starts_with("text/") || m == "application/xhtml+xml" => AssetType::Text,
            _ => AssetType::Data,
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A primitive metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

/// Caller-supplied metadata stored with an entry (content type, origin, ...)
pub type Metadata = BTreeMap<String, MetaValue>;

/// A snapshot of one cached entry's bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub asset_type: AssetType,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub hit_count: u64,
    /// Payload held in the volatile tier
    pub in_volatile: bool,
    /// Payload file in the durable tier
    pub durable_path: Option<PathBuf>,
    /// Whether the durable copy is compressed
    pub compressed: bool,
    pub metadata: Metadata,
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub data: Bytes,
    pub metadata: Metadata,
    pub asset_type: AssetType,
    /// Whether the payload came from the volatile tier
    pub from_volatile: bool,
}

/// Usage and effectiveness counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub volatile_usage: u64,
    pub durable_usage: u64,
    pub total_usage: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Hits over lookups, 0.0 before the first lookup
    pub hit_rate: f64,
    pub eviction_count: u64,
}

/// Configuration for the cache system
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Directory of the durable tier and its index
    pub directory: PathBuf,
    /// Global budget across both tiers, in bytes
    pub max_cache_size: u64,
    /// Budget of the volatile tier, in bytes
    pub max_volatile_size: u64,
    /// Budget of the durable tier, in bytes
    pub max_durable_size: u64,
    /// Largest single payload accepted
    pub max_entry_size: u64,
    /// Entries older than this are expired
    pub max_age: Duration,
    /// Compress durable copies when it saves at least 20%
    pub compression: bool,
    /// Apply per-asset-type optimization before storing
    pub optimize: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: std::env::temp_dir().join("dripfeed-cache"),
            max_cache_size: 4 * 1024 * 1024,     // 4MB
            max_volatile_size: 512 * 1024,       // 512KB
            max_durable_size: 4 * 1024 * 1024,   // 4MB
            max_entry_size: 1024 * 1024,         // 1MB
            max_age: Duration::from_secs(3600),  // 1 hour
            compression: true,
            optimize: true,
        }
    }
}

impl CacheConfig {
    /// Payloads below this size are also kept in the volatile tier
    pub fn volatile_threshold(&self) -> u64 {
        self.max_entry_size / 4
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, crate::DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_type_from_content_type() {
        assert_eq!(
            AssetType::from_content_type(Some("image/png")),
            AssetType::Image
        );
        assert_eq!(
            AssetType::from_content_type(Some("text/html; charset=utf-8")),
            AssetType::Text
        );
        assert_eq!(
            AssetType::from_content_type(Some("text/css")),
            AssetType::Style
        );
        assert_eq!(
            AssetType::from_content_type(Some("application/javascript")),
            AssetType::Script
        );
        assert_eq!(
            AssetType::from_content_type(Some("application/zip")),
            AssetType::Data
        );
        assert_eq!(AssetType::from_content_type(None), AssetType::Data);
    }

    #[test]
    fn test_metadata_serializes_as_plain_values() {
        let mut metadata = Metadata::new();
        metadata.insert("content-type".into(), "text/html".into());
        metadata.insert("status".into(), 200i64.into());
        metadata.insert("fresh".into(), true.into());

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(
            json,
            r#"{"content-type":"text/html","fresh":true,"status":200}"#
        );
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
