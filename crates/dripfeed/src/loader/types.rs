use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Identifier handed out by [`super::ProgressiveLoader::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "load-{}", self.0)
    }
}

/// Scheduling lane; higher lanes are always drained first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub(crate) const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Queued,
    Loading,
    Completed,
    Failed,
    Cancelled,
}

impl LoadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadStatus::Completed | LoadStatus::Failed | LoadStatus::Cancelled
        )
    }
}

type StartFn = Box<dyn Fn(RequestId) + Send + Sync>;
type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;
type ChunkFn = Box<dyn Fn(&Bytes) -> Option<Bytes> + Send + Sync>;
type CompleteFn = Box<dyn Fn(&LoadResult) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&DeliveryError) + Send + Sync>;

/// Observers for one load. Every hook is optional.
#[derive(Default)]
pub struct LoadCallbacks {
    pub(crate) on_start: Option<StartFn>,
    pub(crate) on_progress: Option<ProgressFn>,
    pub(crate) on_chunk: Option<ChunkFn>,
    pub(crate) on_complete: Option<CompleteFn>,
    pub(crate) on_error: Option<ErrorFn>,
}

impl LoadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn(RequestId) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Called with `(loaded, total)` at most once per progress interval
    pub fn on_progress(mut self, f: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called for every streamed chunk. Returning `Some` replaces the chunk
    /// before it is accumulated.
    pub fn on_chunk(
        mut self,
        f: impl Fn(&Bytes) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&LoadResult) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&DeliveryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for LoadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_chunk", &self.on_chunk.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Per-request options for [`super::ProgressiveLoader::load`]
#[derive(Debug, Default)]
pub struct LoadOptions {
    pub priority: Priority,
    /// Skip the cache lookup and do not store the result
    pub no_cache: bool,
    /// Stream whenever the content type allows it, and prefetch links from
    /// markup even when prefetching is disabled globally
    pub force_progressive: bool,
    pub headers: HeaderMap,
    pub callbacks: LoadCallbacks,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn force_progressive(mut self, force: bool) -> Self {
        self.force_progressive = force;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_callbacks(mut self, callbacks: LoadCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// A finished load
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub request_id: RequestId,
    pub url: String,
    pub content: Bytes,
    pub content_type: Option<String>,
    pub from_cache: bool,
    /// Zero for cache hits
    pub elapsed: Duration,
    pub total_bytes: u64,
    /// Whether the body was delivered through the chunk loop
    pub streamed: bool,
}

/// Point-in-time view of a request
#[derive(Debug, Clone)]
pub struct LoadSnapshot {
    pub id: RequestId,
    pub url: String,
    pub priority: Priority,
    pub status: LoadStatus,
    pub loaded_bytes: u64,
    /// Zero while unknown
    pub total_bytes: u64,
    pub content_type: Option<String>,
    pub error: Option<String>,
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub queued_high: usize,
    pub queued_medium: usize,
    pub queued_low: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub bytes_loaded: u64,
}

impl LoaderStats {
    pub fn queued(&self) -> usize {
        self.queued_high + self.queued_medium + self.queued_low
    }
}

/// Configuration for the progressive loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Loads in flight at once
    pub concurrency: usize,
    /// Bytes requested per read in streaming mode
    pub chunk_size: usize,
    /// Minimum spacing of `on_progress` calls
    pub progress_interval: Duration,
    /// Enqueue links found in loaded markup at low priority
    pub prefetch: bool,
    /// Links enqueued per completed page
    pub prefetch_batch: usize,
    /// Terminal requests kept for status queries
    pub history_limit: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            chunk_size: 8 * 1024, // 8KiB
            progress_interval: Duration::from_millis(100),
            prefetch: true,
            prefetch_batch: 5,
            history_limit: 100,
        }
    }
}
