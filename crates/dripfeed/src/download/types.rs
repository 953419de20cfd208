use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One download and its progress, as persisted in the state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: Uuid,
    pub url: String,
    pub filename: String,
    pub destination_path: PathBuf,
    pub status: DownloadStatus,
    /// Full size of the resource, once the server has told us
    pub size_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub progress_percent: f64,
    pub speed_bytes_per_sec: f64,
    pub retry_count: u32,
    /// Bytes received so far; its length is the next resume offset
    pub partial_path: PathBuf,
    #[serde(default)]
    pub error: Option<String>,
    /// Request headers, kept so a reloaded download resumes with them
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_binary")]
    pub binary: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_binary() -> bool {
    true
}

impl Download {
    pub(crate) fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
        map
    }
}

pub(crate) fn header_strings(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

type ProgressFn = Box<dyn Fn(&Download) + Send + Sync>;
type CompleteFn = Box<dyn Fn(&Download) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&Download, &DeliveryError) + Send + Sync>;

/// Observers for one download; not persisted
#[derive(Default)]
pub struct DownloadCallbacks {
    pub(crate) on_progress: Option<ProgressFn>,
    pub(crate) on_complete: Option<CompleteFn>,
    pub(crate) on_error: Option<ErrorFn>,
}

impl DownloadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&Download) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&Download) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Called once the download has failed for good
    pub fn on_error(mut self, f: impl Fn(&Download, &DeliveryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for DownloadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct DownloadOptions {
    /// Destination file name; derived from the URL when absent
    pub filename: Option<String>,
    pub headers: HeaderMap,
    /// Ask for identity encoding so resume offsets match the server's bytes
    pub binary: bool,
    /// Replace an existing file instead of picking a numbered name
    pub overwrite: bool,
    pub callbacks: DownloadCallbacks,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            filename: None,
            headers: HeaderMap::new(),
            binary: true,
            overwrite: false,
            callbacks: DownloadCallbacks::default(),
        }
    }
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_callbacks(mut self, callbacks: DownloadCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Every known download grouped by state
#[derive(Debug, Clone, Default)]
pub struct DownloadsSnapshot {
    pub active: Vec<Download>,
    pub queued: Vec<Download>,
    pub paused: Vec<Download>,
    /// Most recent completions, oldest first
    pub completed: Vec<Download>,
    /// Most recent failures and cancellations, oldest first
    pub failed: Vec<Download>,
}

/// Configuration for the download manager
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Where downloaded files are written
    pub directory: PathBuf,
    /// Downloads transferring at once
    pub concurrency: usize,
    /// Attempts after the first before a download fails for good
    pub max_retries: u32,
    /// Wait before a failed attempt goes back to the queue
    pub retry_delay: Duration,
    /// Completed and failed records kept
    pub history_limit: usize,
    /// Records of each history returned by `get_all_downloads`
    pub history_view: usize,
    /// Persisted queue; `<directory>/.dripfeed-downloads.json` when unset
    pub state_file: Option<PathBuf>,
    /// Bytes requested per read
    pub chunk_size: usize,
    /// Longest gap between speed updates
    pub progress_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("dripfeed-downloads"),
            concurrency: 2,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            history_limit: 50,
            history_view: 10,
            state_file: None,
            chunk_size: 16 * 1024, // 16KiB
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl DownloadConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.directory.join(".dripfeed-downloads.json"))
    }
}
