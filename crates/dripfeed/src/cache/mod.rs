//! # Asset Cache
//!
//! Two-tier content cache keyed by exact strings (usually URLs).
//!
//! Small payloads live in an in-process volatile tier as well as on disk;
//! larger ones are kept on disk only, optionally DEFLATE-compressed. A single
//! byte budget spans both tiers and is enforced with least-recently-used
//! eviction. Bookkeeping survives restarts through a JSON index in the cache
//! directory.

mod compress;
mod manager;
mod optimize;
mod types;

pub use compress::{compress, compress_if_worthwhile, decompress};
pub use manager::AssetCache;
pub use optimize::optimize;
pub use types::{
    AssetType, CacheConfig, CacheEntry, CacheHit, CacheResult, CacheStats, MetaValue, Metadata,
};
