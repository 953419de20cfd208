//! # Asset Cache
//!
//! Coordinates the volatile and durable tiers under one byte budget.
//!
//! All bookkeeping lives behind a single async mutex, so the budget
//! invariants hold whenever a public method returns. Recency is tracked with
//! a logical clock that ticks on every insert and hit; equal wall-clock access
//! times therefore fall back to insertion order.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::compress::{compress_if_worthwhile, decompress};
use super::optimize::optimize;
use super::types::{
    AssetType, CacheConfig, CacheEntry, CacheHit, CacheResult, CacheStats, Metadata,
};
use crate::error::DeliveryError;
use crate::store::{
    BlobName, BlobStore, CacheIndex, DurableStore, IndexCounters, IndexRecord, VolatileStore,
};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone)]
struct DurableRef {
    path: PathBuf,
    compressed: bool,
}

#[derive(Debug, Clone)]
struct EntryState {
    asset_type: AssetType,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    hit_count: u64,
    in_volatile: bool,
    durable: Option<DurableRef>,
    metadata: Metadata,
    /// Logical access time; smallest is least recently used
    tick: u64,
}

impl EntryState {
    fn blob_name(&self, key: &str) -> BlobName {
        BlobName::new(self.asset_type.as_str(), key)
    }

    fn snapshot(&self, key: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            asset_type: self.asset_type,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            hit_count: self.hit_count,
            in_volatile: self.in_volatile,
            durable_path: self.durable.as_ref().map(|d| d.path.clone()),
            compressed: self.durable.as_ref().is_some_and(|d| d.compressed),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, EntryState>,
    clock: u64,
    volatile_usage: u64,
    durable_usage: u64,
    total_usage: u64,
    counters: IndexCounters,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Least recently used key, optionally restricted by a predicate
    fn lru_key(&self, filter: impl Fn(&EntryState) -> bool) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| filter(entry))
            .min_by_key(|(_, entry)| entry.tick)
            .map(|(key, _)| key.clone())
    }
}

/// Two-tier content cache with a global byte budget
pub struct AssetCache {
    config: CacheConfig,
    volatile: VolatileStore,
    durable: DurableStore,
    index: CacheIndex,
    state: Mutex<CacheState>,
}

impl AssetCache {
    /// Open the cache, rebuilding bookkeeping from the persisted index.
    ///
    /// Payload bytes are not read; reloaded entries live in the durable tier
    /// only until their first hit promotes them.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        let durable = DurableStore::new(&config.directory);
        if config.enabled {
            durable
                .ensure_initialized()
                .await
                .map_err(|e| DeliveryError::storage(&config.directory, e))?;
        }
        let index = CacheIndex::new(config.directory.join(INDEX_FILE));

        let mut state = CacheState::default();
        if config.enabled {
            let (mut records, counters) = index.load().await;
            records.sort_by(|a, b| {
                (a.last_accessed_at, a.created_at).cmp(&(b.last_accessed_at, b.created_at))
            });
            state.counters = counters;
            for record in records {
                let tick = state.next_tick();
                state.durable_usage += record.size_bytes;
                state.total_usage += record.size_bytes;
                state.entries.insert(
                    record.key,
                    EntryState {
                        asset_type: record.asset_type,
                        size_bytes: record.size_bytes,
                        created_at: record.created_at,
                        last_accessed_at: record.last_accessed_at,
                        hit_count: record.hit_count,
                        in_volatile: false,
                        durable: Some(DurableRef {
                            path: record.durable_path,
                            compressed: record.compressed,
                        }),
                        metadata: record.metadata,
                        tick,
                    },
                );
            }
            info!(
                entries = state.entries.len(),
                usage = state.total_usage,
                dir = ?config.directory,
                "Asset cache opened"
            );
        }

        let cache = Self {
            config,
            volatile: VolatileStore::new(),
            durable,
            index,
            state: Mutex::new(state),
        };

        // Budgets may have shrunk since the index was written
        {
            let mut state = cache.state.lock().await;
            let over_budget = state.total_usage > cache.config.max_cache_size
                || state.durable_usage > cache.config.max_durable_size;
            while state.total_usage > cache.config.max_cache_size
                || state.durable_usage > cache.config.max_durable_size
            {
                if !cache.evict_lru(&mut state).await {
                    break;
                }
            }
            if over_budget {
                cache.persist(&state).await;
            }
        }

        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`.
    ///
    /// When `asset_type` is given the entry must have been stored with the
    /// same type. Expired entries are removed and reported as a miss.
    pub async fn get(&self, key: &str, asset_type: Option<AssetType>) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }

        let mut state = self.state.lock().await;

        let Some(entry) = state.entries.get(key).cloned() else {
            state.counters.miss_count += 1;
            return None;
        };

        if asset_type.is_some_and(|t| t != entry.asset_type) {
            debug!(key, stored = %entry.asset_type, "Cache entry has a different asset type");
            state.counters.miss_count += 1;
            return None;
        }

        if self.is_expired(&entry) {
            debug!(key, "Cache entry expired");
            self.remove_entry(&mut state, key).await;
            state.counters.miss_count += 1;
            return None;
        }

        let name = entry.blob_name(key);
        let (data, from_volatile) = match self.load_payload(&name, &entry).await {
            Some(found) => found,
            None => {
                warn!(key, "Cache payload unreadable, dropping entry");
                self.remove_entry(&mut state, key).await;
                state.counters.miss_count += 1;
                return None;
            }
        };

        let tick = state.next_tick();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.tick = tick;
            entry.last_accessed_at = Utc::now();
            entry.hit_count += 1;
        }
        state.counters.hit_count += 1;

        if !from_volatile && self.fits_volatile(entry.size_bytes) {
            self.make_volatile_room(&mut state, entry.size_bytes).await;
            self.volatile.insert(name, data.clone());
            state.volatile_usage += entry.size_bytes;
            if let Some(entry) = state.entries.get_mut(key) {
                entry.in_volatile = true;
            }
            debug!(key, "Promoted durable entry to volatile tier");
        }

        Some(CacheHit {
            data,
            metadata: entry.metadata,
            asset_type: entry.asset_type,
            from_volatile,
        })
    }

    /// Store `payload` under `key`, replacing any previous entry.
    pub async fn set(
        &self,
        key: &str,
        payload: Bytes,
        asset_type: AssetType,
        metadata: Metadata,
    ) -> CacheResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let raw_size = payload.len() as u64;
        let limit = self.config.max_entry_size.min(self.config.max_cache_size);
        if raw_size > limit {
            return Err(DeliveryError::TooLarge {
                key: key.to_string(),
                size: raw_size,
                limit,
            });
        }

        let payload = if self.config.optimize {
            optimize(asset_type, payload)
        } else {
            payload
        };
        let size = payload.len() as u64;
        let in_volatile = self.fits_volatile(size);
        if !in_volatile && size > self.config.max_durable_size {
            // Neither tier can hold it
            return Err(DeliveryError::TooLarge {
                key: key.to_string(),
                size,
                limit: self.config.max_durable_size,
            });
        }

        let mut state = self.state.lock().await;

        if state.entries.contains_key(key) {
            self.remove_entry(&mut state, key).await;
        }

        while state.total_usage + size > self.config.max_cache_size {
            if !self.evict_lru(&mut state).await {
                break;
            }
        }

        let name = BlobName::new(asset_type.as_str(), key);

        if in_volatile {
            self.make_volatile_room(&mut state, size).await;
            self.volatile.insert(name.clone(), payload.clone());
            state.volatile_usage += size;
        }

        let durable = if size <= self.config.max_durable_size {
            self.make_durable_room(&mut state, size).await;
            match self.write_durable(&name, &payload).await {
                Ok(durable) => {
                    state.durable_usage += size;
                    Some(durable)
                }
                Err(e) if in_volatile => {
                    warn!(key, error = %e, "Durable write failed, entry kept in volatile tier only");
                    None
                }
                Err(e) => {
                    warn!(key, error = %e, "Durable write failed, entry not cached");
                    self.persist(&state).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let now = Utc::now();
        let tick = state.next_tick();
        state.total_usage += size;
        state.entries.insert(
            key.to_string(),
            EntryState {
                asset_type,
                size_bytes: size,
                created_at: now,
                last_accessed_at: now,
                hit_count: 0,
                in_volatile,
                durable,
                metadata,
                tick,
            },
        );

        debug!(
            key,
            size,
            in_volatile,
            total = state.total_usage,
            "Cached entry"
        );

        self.persist(&state).await;
        Ok(())
    }

    /// Remove `key` from both tiers; returns whether it existed
    pub async fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let existed = self.remove_entry(&mut state, key).await;
        if existed {
            self.persist(&state).await;
        }
        existed
    }

    /// Drop every entry and delete all durable files
    pub async fn clear(&self) -> CacheResult<()> {
        let mut state = self.state.lock().await;

        let _ = self.volatile.clear().await;
        let cleared = self.durable.clear().await;

        state.entries.clear();
        state.volatile_usage = 0;
        state.durable_usage = 0;
        state.total_usage = 0;
        self.persist(&state).await;

        info!("Asset cache cleared");
        cleared.map_err(|e| DeliveryError::storage(self.durable.root(), e))
    }

    /// Remove every entry older than the configured max age
    pub async fn clean_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove_entry(&mut state, key).await;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Removed expired cache entries");
            self.persist(&state).await;
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let lookups = state.counters.hit_count + state.counters.miss_count;
        CacheStats {
            entry_count: state.entries.len(),
            volatile_usage: state.volatile_usage,
            durable_usage: state.durable_usage,
            total_usage: state.total_usage,
            hit_count: state.counters.hit_count,
            miss_count: state.counters.miss_count,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.counters.hit_count as f64 / lookups as f64
            },
            eviction_count: state.counters.eviction_count,
        }
    }

    /// Whether a live entry exists for `key`, without touching recency
    pub async fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .is_some_and(|entry| !self.is_expired(entry))
    }

    /// Snapshot of one entry's bookkeeping
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        let state = self.state.lock().await;
        state.entries.get(key).map(|entry| entry.snapshot(key))
    }

    /// Keys from least to most recently used
    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut keys: Vec<(&String, u64)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key, entry.tick))
            .collect();
        keys.sort_by_key(|(_, tick)| *tick);
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Persist the index now (recency updates from `get` are not persisted
    /// on their own)
    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    fn is_expired(&self, entry: &EntryState) -> bool {
        let age = Utc::now().signed_duration_since(entry.created_at);
        age.to_std()
            .map(|age| age > self.config.max_age)
            .unwrap_or(false)
    }

    fn fits_volatile(&self, size: u64) -> bool {
        size < self.config.volatile_threshold() && size <= self.config.max_volatile_size
    }

    async fn load_payload(&self, name: &BlobName, entry: &EntryState) -> Option<(Bytes, bool)> {
        if entry.in_volatile {
            if let Some(data) = self.volatile.get(name) {
                return Some((data, true));
            }
        }

        let durable = entry.durable.as_ref()?;
        let raw = match self.durable.read(name).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(path = ?durable.path, error = %e, "Failed to read durable entry");
                return None;
            }
        };

        if durable.compressed {
            match decompress(&raw) {
                Ok(data) => Some((Bytes::from(data), false)),
                Err(e) => {
                    warn!(path = ?durable.path, error = %e, "Failed to decompress durable entry");
                    None
                }
            }
        } else {
            Some((raw, false))
        }
    }

    async fn write_durable(&self, name: &BlobName, payload: &Bytes) -> CacheResult<DurableRef> {
        let (stored, compressed) = match self
            .config
            .compression
            .then(|| compress_if_worthwhile(payload))
            .flatten()
        {
            Some(compressed) => (Bytes::from(compressed), true),
            None => (payload.clone(), false),
        };

        let path = self.durable.path_of(name);
        self.durable
            .write(name, stored)
            .await
            .map_err(|e| DeliveryError::storage(&path, e))?;
        Ok(DurableRef { path, compressed })
    }

    /// Drop volatile copies, least recently used first, until `size` more
    /// bytes fit. Copies with no durable backing take their entry with them.
    async fn make_volatile_room(&self, state: &mut CacheState, size: u64) {
        while state.volatile_usage + size > self.config.max_volatile_size {
            let Some(victim) = state.lru_key(|entry| entry.in_volatile) else {
                break;
            };

            let entry = &state.entries[&victim];
            if entry.durable.is_some() {
                let name = entry.blob_name(&victim);
                let freed = entry.size_bytes;
                self.volatile.take(&name);
                state.volatile_usage -= freed;
                if let Some(entry) = state.entries.get_mut(&victim) {
                    entry.in_volatile = false;
                }
                debug!(key = %victim, "Demoted entry out of volatile tier");
            } else {
                self.remove_entry(state, &victim).await;
                state.counters.eviction_count += 1;
            }
        }
    }

    /// Same as [`Self::make_volatile_room`] for the durable tier
    async fn make_durable_room(&self, state: &mut CacheState, size: u64) {
        while state.durable_usage + size > self.config.max_durable_size {
            let Some(victim) = state.lru_key(|entry| entry.durable.is_some()) else {
                break;
            };

            let entry = &state.entries[&victim];
            if entry.in_volatile {
                let name = entry.blob_name(&victim);
                let freed = entry.size_bytes;
                if let Err(e) = self.durable.remove(&name).await {
                    warn!(key = %victim, error = %e, "Failed to delete demoted durable entry");
                }
                state.durable_usage -= freed;
                if let Some(entry) = state.entries.get_mut(&victim) {
                    entry.durable = None;
                }
                debug!(key = %victim, "Demoted entry out of durable tier");
            } else {
                self.remove_entry(state, &victim).await;
                state.counters.eviction_count += 1;
            }
        }
    }

    /// Evict the least recently used entry; false if the cache is empty
    async fn evict_lru(&self, state: &mut CacheState) -> bool {
        let Some(victim) = state.lru_key(|_| true) else {
            return false;
        };
        debug!(key = %victim, "Evicting least recently used entry");
        self.remove_entry(state, &victim).await;
        state.counters.eviction_count += 1;
        true
    }

    async fn remove_entry(&self, state: &mut CacheState, key: &str) -> bool {
        let Some(entry) = state.entries.remove(key) else {
            return false;
        };
        let name = entry.blob_name(key);

        if entry.in_volatile {
            self.volatile.take(&name);
            state.volatile_usage -= entry.size_bytes;
        }
        if entry.durable.is_some() {
            if let Err(e) = self.durable.remove(&name).await {
                warn!(key, error = %e, "Failed to delete durable entry");
            }
            state.durable_usage -= entry.size_bytes;
        }
        state.total_usage -= entry.size_bytes;
        true
    }

    async fn persist(&self, state: &CacheState) {
        let mut records: Vec<(u64, IndexRecord)> = state
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let durable = entry.durable.as_ref()?;
                Some((
                    entry.tick,
                    IndexRecord {
                        key: key.clone(),
                        asset_type: entry.asset_type,
                        size_bytes: entry.size_bytes,
                        created_at: entry.created_at,
                        last_accessed_at: entry.last_accessed_at,
                        hit_count: entry.hit_count,
                        durable_path: durable.path.clone(),
                        compressed: durable.compressed,
                        metadata: entry.metadata.clone(),
                    },
                ))
            })
            .collect();
        records.sort_by_key(|(tick, _)| *tick);
        let records: Vec<IndexRecord> = records.into_iter().map(|(_, record)| record).collect();

        if let Err(e) = self.index.save(&records, state.counters).await {
            warn!(path = ?self.index.path(), error = %e, "Failed to persist cache index");
        }
    }
}
