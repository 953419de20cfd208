//! # Download Manager
//!
//! Resumable, retryable downloads to named files.
//!
//! A dispatcher task keeps at most `concurrency` transfers running. Each
//! transfer appends to `<destination>.part` and renames it into place once
//! the body is complete, so an interrupted download picks up where it left
//! off, whether it was paused, dropped by the network or cut short by a
//! process restart. The queue and the outcome histories are written to a
//! JSON state file after every status change.

mod state;
mod transfer;
mod types;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{DeliveryError, Result};
use crate::net::Transport;
use crate::store::partial_path;

use state::{PersistedState, StateFile};
use transfer::{TransferJob, TransferOutcome, TransferProgress, TransferSettings, transfer};
pub use types::{
    Download, DownloadCallbacks, DownloadConfig, DownloadOptions, DownloadStatus,
    DownloadsSnapshot,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    record: Download,
    callbacks: Arc<DownloadCallbacks>,
    /// A worker still owns the partial file
    running: bool,
    /// Put back on the queue once the worker lets go
    requeue: bool,
}

#[derive(Default)]
struct ManagerState {
    /// Unfinished downloads
    entries: HashMap<Uuid, Entry>,
    queue: VecDeque<Uuid>,
    completed: VecDeque<Download>,
    failed: VecDeque<Download>,
}

impl ManagerState {
    fn push_history(&mut self, record: Download, limit: usize) {
        let history = match record.status {
            DownloadStatus::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        history.push_back(record);
        while history.len() > limit {
            history.pop_front();
        }
    }

    fn find(&self, id: Uuid) -> Option<&Download> {
        self.entries
            .get(&id)
            .map(|entry| &entry.record)
            .or_else(|| self.completed.iter().find(|d| d.id == id))
            .or_else(|| self.failed.iter().find(|d| d.id == id))
    }

    fn to_persisted(&self) -> PersistedState {
        let mut queued: Vec<Download> = self
            .entries
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        queued.sort_by_key(|d| d.created_at);
        PersistedState {
            queued,
            completed: self.completed.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
        }
    }
}

struct Inner {
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<ManagerState>,
    state_file: StateFile,
    /// Serializes state file writes so a later snapshot never loses to an
    /// earlier one
    persist_lock: tokio::sync::Mutex<()>,
    notify: Notify,
}

/// Queue of resumable downloads
pub struct DownloadManager {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// Load persisted state and start the dispatcher on the current runtime.
    ///
    /// Downloads that were transferring when the previous process stopped are
    /// queued again and resume from their partial files.
    pub async fn new(config: DownloadConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory)
            .await
            .map_err(|e| DeliveryError::storage(&config.directory, e))?;

        let state_file = StateFile::new(config.state_path());
        let persisted = state_file.load().await;

        let mut state = ManagerState::default();
        for record in persisted.queued {
            if record.status == DownloadStatus::Queued {
                state.queue.push_back(record.id);
            }
            state.entries.insert(
                record.id,
                Entry {
                    record,
                    callbacks: Arc::new(DownloadCallbacks::default()),
                    running: false,
                    requeue: false,
                },
            );
        }
        for record in persisted.completed.into_iter().chain(persisted.failed) {
            state.push_history(record, config.history_limit);
        }

        if !state.entries.is_empty() {
            info!(
                pending = state.entries.len(),
                queued = state.queue.len(),
                path = ?state_file.path(),
                "Restored downloads from state file"
            );
        }

        let inner = Arc::new(Inner {
            config,
            transport,
            state: Mutex::new(state),
            state_file,
            persist_lock: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(Inner::run(inner.clone(), shutdown.clone()));

        Ok(Self { inner, shutdown })
    }

    /// Queue `url` for download and return its id.
    ///
    /// Without `overwrite`, a destination that already exists (or is claimed
    /// by another pending download) gets a numeric suffix: `file_1.bin`,
    /// `file_2.bin`, ...
    pub async fn download(&self, url: &str, options: DownloadOptions) -> Result<Uuid> {
        let parsed = Url::parse(url).map_err(|e| DeliveryError::InvalidUrl(format!("{url}: {e}")))?;
        let requested = options
            .filename
            .clone()
            .map(|name| sanitize_filename(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| filename_from_url(&parsed));

        let id = Uuid::new_v4();
        {
            let mut state = self.inner.state.lock();
            let destination = if options.overwrite {
                self.inner.config.directory.join(&requested)
            } else {
                let claimed: HashSet<&Path> = state
                    .entries
                    .values()
                    .map(|entry| entry.record.destination_path.as_path())
                    .collect();
                unique_destination(&self.inner.config.directory, &requested, &claimed)
            };
            let filename = destination
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or(requested);

            let record = Download {
                id,
                url: url.to_string(),
                filename,
                partial_path: partial_path(&destination),
                destination_path: destination,
                status: DownloadStatus::Queued,
                size_bytes: None,
                downloaded_bytes: 0,
                progress_percent: 0.0,
                speed_bytes_per_sec: 0.0,
                retry_count: 0,
                error: None,
                headers: types::header_strings(&options.headers),
                binary: options.binary,
                created_at: Utc::now(),
                completed_at: None,
            };
            info!(%id, url, destination = ?record.destination_path, "Queued download");

            state.entries.insert(
                id,
                Entry {
                    record,
                    callbacks: Arc::new(options.callbacks),
                    running: false,
                    requeue: false,
                },
            );
            state.queue.push_back(id);
        }

        self.inner.persist().await;
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Queue several URLs with default options
    pub async fn download_multiple<I, S>(&self, urls: I) -> Result<Vec<Uuid>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids = Vec::new();
        for url in urls {
            ids.push(self.download(url.as_ref(), DownloadOptions::default()).await?);
        }
        Ok(ids)
    }

    /// Pause a queued or running download; its partial file is kept.
    pub async fn pause(&self, id: Uuid) -> bool {
        let paused = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.entries.get_mut(&id) {
                Some(entry)
                    if matches!(
                        entry.record.status,
                        DownloadStatus::Queued | DownloadStatus::Downloading
                    ) =>
                {
                    entry.record.status = DownloadStatus::Paused;
                    entry.record.speed_bytes_per_sec = 0.0;
                    state.queue.retain(|queued| *queued != id);
                    true
                }
                _ => false,
            }
        };

        if paused {
            info!(%id, "Paused download");
            self.inner.persist().await;
        }
        paused
    }

    /// Put a paused download back on the queue
    pub async fn resume(&self, id: Uuid) -> bool {
        let resumed = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.entries.get_mut(&id) {
                Some(entry) if entry.record.status == DownloadStatus::Paused => {
                    entry.record.status = DownloadStatus::Queued;
                    if entry.running {
                        entry.requeue = true;
                    } else {
                        state.queue.push_back(id);
                    }
                    true
                }
                _ => false,
            }
        };

        if resumed {
            info!(%id, "Resumed download");
            self.inner.persist().await;
            self.inner.notify.notify_one();
        }
        resumed
    }

    /// Cancel a pending download and delete its partial file. The record
    /// moves to the failed history with status `cancelled`.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let cancelled = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.entries.remove(&id) {
                Some(entry) => {
                    state.queue.retain(|queued| *queued != id);
                    let mut record = entry.record;
                    record.status = DownloadStatus::Cancelled;
                    record.speed_bytes_per_sec = 0.0;
                    record.completed_at = Some(Utc::now());
                    let partial = record.partial_path.clone();
                    state.push_history(record, self.inner.config.history_limit);
                    Some(partial)
                }
                None => None,
            }
        };

        let Some(partial) = cancelled else {
            return false;
        };
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(%id, path = ?partial, error = %e, "Failed to delete partial file");
            }
        }
        info!(%id, "Cancelled download");
        self.inner.persist().await;
        true
    }

    pub fn get_status(&self, id: Uuid) -> Option<Download> {
        self.inner.state.lock().find(id).cloned()
    }

    /// Every known download, histories trimmed to the configured view
    pub fn get_all_downloads(&self) -> DownloadsSnapshot {
        let state = self.inner.state.lock();
        let mut snapshot = DownloadsSnapshot::default();

        let mut pending: Vec<&Download> = state.entries.values().map(|e| &e.record).collect();
        pending.sort_by_key(|d| d.created_at);
        for record in pending {
            let bucket = match record.status {
                DownloadStatus::Downloading => &mut snapshot.active,
                DownloadStatus::Paused => &mut snapshot.paused,
                _ => &mut snapshot.queued,
            };
            bucket.push(record.clone());
        }

        let view = self.inner.config.history_view;
        let tail = |history: &VecDeque<Download>| {
            history
                .iter()
                .skip(history.len().saturating_sub(view))
                .cloned()
                .collect::<Vec<_>>()
        };
        snapshot.completed = tail(&state.completed);
        snapshot.failed = tail(&state.failed);
        snapshot
    }

    /// Delete the file a download produced (or its partial file).
    /// Returns whether anything was removed.
    pub async fn delete_file(&self, id: Uuid) -> Result<bool> {
        let (destination, partial, status) = {
            let state = self.inner.state.lock();
            let record = state
                .find(id)
                .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;
            (
                record.destination_path.clone(),
                record.partial_path.clone(),
                record.status,
            )
        };

        let target = if status == DownloadStatus::Completed {
            destination
        } else {
            partial
        };
        let removed = match tokio::fs::remove_file(&target).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(DeliveryError::storage(target, e)),
        };
        if removed {
            info!(%id, "Deleted downloaded file");
        }
        Ok(removed)
    }

    /// Wait for `id` to reach a terminal status
    pub async fn wait_for_download(&self, id: Uuid, timeout: Duration) -> Result<Download> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self
                .get_status(id)
                .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;
            match record.status {
                DownloadStatus::Completed => return Ok(record),
                DownloadStatus::Failed => {
                    return Err(DeliveryError::transport(
                        &record.url,
                        record.error.as_deref().unwrap_or("download failed"),
                    ));
                }
                DownloadStatus::Cancelled => {
                    return Err(DeliveryError::Cancelled { target: record.url });
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(DeliveryError::Timeout {
                    target: id.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Forget completed, failed and cancelled records
    pub async fn clear_history(&self) {
        {
            let mut state = self.inner.state.lock();
            state.completed.clear();
            state.failed.clear();
        }
        self.inner.persist().await;
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.state.lock().to_persisted();
        if let Err(e) = self.state_file.save(&snapshot).await {
            warn!(error = %e, "Failed to persist download state");
        }
    }

    /// Pop the next queued download and mark it downloading
    fn next_job(&self) -> Option<(Uuid, TransferJob, Arc<DownloadCallbacks>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        while let Some(id) = state.queue.pop_front() {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.record.status != DownloadStatus::Queued {
                continue;
            }
            if entry.running {
                entry.requeue = true;
                continue;
            }

            entry.record.status = DownloadStatus::Downloading;
            entry.record.error = None;
            entry.running = true;
            let job = TransferJob {
                url: entry.record.url.clone(),
                destination: entry.record.destination_path.clone(),
                partial: entry.record.partial_path.clone(),
                headers: entry.record.header_map(),
                binary: entry.record.binary,
            };
            return Some((id, job, entry.callbacks.clone()));
        }
        None
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "Download dispatcher started");
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.config.concurrency.max(1) {
                let Some((id, job, callbacks)) = self.next_job() else {
                    break;
                };
                in_flight.push(self.clone().perform_download(id, job, callbacks));
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                _ = self.notify.notified() => {}
            }
        }

        info!(abandoned = in_flight.len(), "Download dispatcher stopped");
    }

    fn is_downloading(&self, id: Uuid) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.record.status == DownloadStatus::Downloading)
    }

    fn record_progress(&self, id: Uuid, progress: TransferProgress, callbacks: &DownloadCallbacks) {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            let record = &mut entry.record;
            record.downloaded_bytes = progress.downloaded;
            record.size_bytes = progress.total.or(record.size_bytes);
            record.speed_bytes_per_sec = progress.speed;
            record.progress_percent = match record.size_bytes {
                Some(total) if total > 0 => {
                    (progress.downloaded as f64 / total as f64 * 100.0).min(100.0)
                }
                _ => 0.0,
            };
            callbacks.on_progress.is_some().then(|| record.clone())
        };

        if let (Some(on_progress), Some(record)) = (&callbacks.on_progress, snapshot) {
            on_progress(&record);
        }
    }

    async fn perform_download(
        self: Arc<Self>,
        id: Uuid,
        job: TransferJob,
        callbacks: Arc<DownloadCallbacks>,
    ) {
        self.persist().await;
        debug!(%id, url = %job.url, "Starting transfer");

        let settings = TransferSettings {
            chunk_size: self.config.chunk_size,
            progress_interval: self.config.progress_interval,
        };
        let outcome = transfer(
            self.transport.as_ref(),
            &job,
            &settings,
            || self.is_downloading(id),
            |progress| self.record_progress(id, progress, &callbacks),
        )
        .await;

        match outcome {
            Ok(TransferOutcome::Completed { size }) => self.complete(id, size, &callbacks).await,
            Ok(TransferOutcome::Interrupted) => {
                debug!(%id, "Transfer stopped by pause or cancel");
                self.discard_cancelled_partial(id, &job.partial).await;
            }
            Err(e) => self.handle_failure(id, e, &callbacks).await,
        }

        self.release(id);
    }

    /// `cancel` may have deleted the partial while the transfer still had it
    /// open; whatever the transfer wrote afterwards goes too.
    async fn discard_cancelled_partial(&self, id: Uuid, partial: &Path) {
        let orphaned = {
            let state = self.state.lock();
            !state.entries.contains_key(&id)
                && !state
                    .entries
                    .values()
                    .any(|entry| entry.record.partial_path == partial)
        };
        if !orphaned {
            return;
        }
        match tokio::fs::remove_file(partial).await {
            Ok(()) => debug!(%id, path = ?partial, "Removed partial file of cancelled download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%id, path = ?partial, error = %e, "Failed to delete partial file"),
        }
    }

    /// The worker is done with the partial file
    fn release(&self, id: Uuid) {
        let requeued = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.running = false;
                    let requeue = std::mem::take(&mut entry.requeue)
                        && entry.record.status == DownloadStatus::Queued;
                    if requeue {
                        state.queue.push_back(id);
                    }
                    requeue
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    async fn complete(&self, id: Uuid, size: u64, callbacks: &DownloadCallbacks) {
        let record = {
            let mut state = self.state.lock();
            let finished = state
                .entries
                .get(&id)
                .is_some_and(|entry| entry.record.status == DownloadStatus::Downloading);
            // Paused or cancelled while the last bytes were renamed into place
            let entry = match state.entries.remove(&id) {
                Some(entry) if finished => entry,
                Some(entry) => {
                    state.entries.insert(id, entry);
                    return;
                }
                None => return,
            };
            let mut record = entry.record;
            record.status = DownloadStatus::Completed;
            record.size_bytes = Some(size);
            record.downloaded_bytes = size;
            record.progress_percent = 100.0;
            record.speed_bytes_per_sec = 0.0;
            record.completed_at = Some(Utc::now());
            state.push_history(record.clone(), self.config.history_limit);
            record
        };

        info!(%id, size, destination = ?record.destination_path, "Download completed");
        self.persist().await;
        if let Some(on_complete) = &callbacks.on_complete {
            on_complete(&record);
        }
    }

    async fn handle_failure(
        self: &Arc<Self>,
        id: Uuid,
        error: DeliveryError,
        callbacks: &DownloadCallbacks,
    ) {
        let message = error.to_string();
        let failed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            if entry.record.status != DownloadStatus::Downloading {
                return;
            }

            entry.record.error = Some(message.clone());
            entry.record.speed_bytes_per_sec = 0.0;
            if error.is_retryable() && entry.record.retry_count < self.config.max_retries {
                entry.record.retry_count += 1;
                entry.record.status = DownloadStatus::Queued;
                None
            } else {
                let Some(entry) = state.entries.remove(&id) else {
                    return;
                };
                let mut record = entry.record;
                record.status = DownloadStatus::Failed;
                record.completed_at = Some(Utc::now());
                state.push_history(record.clone(), self.config.history_limit);
                Some(record)
            }
        };

        self.persist().await;

        match failed {
            None => {
                warn!(%id, error = %message, delay = ?self.config.retry_delay, "Download attempt failed, retrying");
                self.schedule_retry(id);
            }
            Some(record) => {
                error!(%id, url = %record.url, error = %message, retries = record.retry_count, "Download failed");
                if let Some(on_error) = &callbacks.on_error {
                    on_error(&record, &error);
                }
            }
        }
    }

    /// Re-enqueue after the retry delay without holding a transfer slot
    fn schedule_retry(self: &Arc<Self>, id: Uuid) {
        let inner = Arc::clone(self);
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let requeued = {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                match state.entries.get_mut(&id) {
                    Some(entry) if entry.record.status == DownloadStatus::Queued => {
                        if entry.running {
                            entry.requeue = true;
                        } else {
                            state.queue.push_back(id);
                        }
                        true
                    }
                    _ => false,
                }
            };
            if requeued {
                inner.notify.notify_one();
            }
        });
    }
}

/// Last path segment of `url`, or `download` when it has none
fn filename_from_url(url: &Url) -> String {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(sanitize_filename)
        .unwrap_or_default();
    if name.is_empty() {
        "download".to_string()
    } else {
        name
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// `dir/name`, or `dir/stem_N.ext` with the smallest free `N`
fn unique_destination(dir: &Path, name: &str, claimed: &HashSet<&Path>) -> PathBuf {
    let is_free = |path: &Path| !path.exists() && !claimed.contains(path);

    let candidate = dir.join(name);
    if is_free(&candidate) {
        return candidate;
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = as_path
        .extension()
        .map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| match &extension {
            Some(ext) => dir.join(format!("{stem}_{n}.{ext}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|path| is_free(path))
        .unwrap_or(candidate)
}
