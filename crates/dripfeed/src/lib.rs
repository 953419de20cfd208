//! # Dripfeed
//!
//! Fetch, cache and incrementally deliver content over slow or unreliable
//! links.
//!
//! ## Features
//!
//! - Two-tier asset cache (in-process and on-disk) with LRU eviction and
//!   optional compression
//! - Progressive loader with priority lanes, chunked delivery and link
//!   prefetching
//! - Resumable download manager with retries and a persisted queue
//! - A single network-fetch primitive shared by every component

pub mod builder;
pub mod cache;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod loader;
pub mod net;
pub mod store;

pub use builder::EngineConfigBuilder;
pub use config::{ClientConfig, EngineConfig};
pub use engine::Engine;
pub use error::{DeliveryError, Result};

pub use cache::{AssetCache, AssetType, CacheConfig, CacheEntry, CacheHit, CacheStats, Metadata};
pub use download::{
    Download, DownloadCallbacks, DownloadConfig, DownloadManager, DownloadOptions, DownloadStatus,
    DownloadsSnapshot,
};
pub use loader::{
    LoadCallbacks, LoadOptions, LoadResult, LoadSnapshot, LoadStatus, LoaderConfig, LoaderStats,
    Priority, ProgressiveLoader, RequestId,
};
pub use net::{HttpTransport, Transport, create_client};
