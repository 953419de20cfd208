//! # Content Store
//!
//! Byte-addressable storage in two tiers: an in-process volatile tier and a
//! durable tier of named files, plus the persisted index describing the
//! durable entries.

mod file;
mod index;
mod memory;
mod provider;

use std::path::{Path, PathBuf};

pub use file::DurableStore;
pub use index::{CacheIndex, IndexCounters, IndexRecord};
pub use memory::VolatileStore;
pub use provider::{BlobName, BlobStore};

/// Result of a storage operation
pub type StoreResult<T> = std::result::Result<T, std::io::Error>;

/// Free bytes on the disk that holds `path`.
///
/// Picks the mount point with the longest matching prefix. `None` when no
/// disk can be matched (some containers hide their mounts).
pub fn free_space(path: &Path) -> Option<u64> {
    let path = std::path::absolute(path).ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Temporary path a transfer writes to before it is renamed into place
pub fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}
