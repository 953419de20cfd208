//! # Progressive Loader
//!
//! Prioritized fetching with incremental delivery.
//!
//! Requests wait in one of three lanes and are started by a dispatcher task
//! that keeps at most `concurrency` loads in flight, always draining the
//! high lane before medium and medium before low. Large bodies of
//! progressive-capable types are read in fixed-size chunks so callers can
//! observe and rewrite them as they arrive; everything else is buffered.
//! Cache hits complete synchronously without touching the network.

mod prefetch;
mod types;

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::cache::{AssetCache, AssetType, MetaValue, Metadata};
use crate::error::{DeliveryError, Result};
use crate::net::{Connection, FetchRequest, Transport};
use crate::store::partial_path;

use prefetch::{extract_links, is_markup, is_progressive_capable};
pub use types::{
    LoadCallbacks, LoadOptions, LoadResult, LoadSnapshot, LoadStatus, LoaderConfig, LoaderStats,
    Priority, RequestId,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Metadata key under which the response content type is cached
const CONTENT_TYPE_KEY: &str = "content-type";

struct Tracked {
    url: String,
    priority: Priority,
    status: LoadStatus,
    no_cache: bool,
    force_progressive: bool,
    /// Enqueued by link discovery; its own links are not followed
    prefetched: bool,
    headers: HeaderMap,
    callbacks: Arc<LoadCallbacks>,
    loaded_bytes: u64,
    total_bytes: u64,
    content_type: Option<String>,
    error: Option<String>,
    result: Option<LoadResult>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl Tracked {
    fn new(url: String, options: LoadOptions, prefetched: bool) -> Self {
        Self {
            url,
            priority: options.priority,
            status: LoadStatus::Queued,
            no_cache: options.no_cache,
            force_progressive: options.force_progressive,
            prefetched,
            headers: options.headers,
            callbacks: Arc::new(options.callbacks),
            loaded_bytes: 0,
            total_bytes: 0,
            content_type: None,
            error: None,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn snapshot(&self, id: RequestId) -> LoadSnapshot {
        LoadSnapshot {
            id,
            url: self.url.clone(),
            priority: self.priority,
            status: self.status,
            loaded_bytes: self.loaded_bytes,
            total_bytes: self.total_bytes,
            content_type: self.content_type.clone(),
            error: self.error.clone(),
            from_cache: self.result.as_ref().is_some_and(|r| r.from_cache),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// What a worker needs to run one load, copied out of the shared state
struct Job {
    url: String,
    headers: HeaderMap,
    no_cache: bool,
    force_progressive: bool,
    prefetched: bool,
    callbacks: Arc<LoadCallbacks>,
}

struct Fetched {
    content: Bytes,
    /// Bytes read off the connection, before any `on_chunk` rewrite
    received: u64,
    content_type: Option<String>,
    mime: Option<String>,
    streamed: bool,
}

#[derive(Default)]
struct LoaderState {
    requests: HashMap<RequestId, Tracked>,
    lanes: [VecDeque<RequestId>; 3],
    active: usize,
    /// Terminal requests, oldest first
    history: VecDeque<RequestId>,
    stats: LoaderStats,
}

impl LoaderState {
    fn retire(&mut self, id: RequestId, limit: usize) {
        self.history.push_back(id);
        while self.history.len() > limit {
            if let Some(old) = self.history.pop_front() {
                self.requests.remove(&old);
            }
        }
    }
}

struct Inner {
    config: LoaderConfig,
    cache: Arc<AssetCache>,
    transport: Arc<dyn Transport>,
    state: Mutex<LoaderState>,
    notify: Notify,
    next_id: AtomicU64,
}

/// Prioritized, cache-aware loader
pub struct ProgressiveLoader {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl ProgressiveLoader {
    /// Create the loader and spawn its dispatcher on the current runtime.
    pub fn new(
        config: LoaderConfig,
        cache: Arc<AssetCache>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            cache,
            transport,
            state: Mutex::new(LoaderState::default()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(Inner::run(inner.clone(), shutdown.clone()));

        Self { inner, shutdown }
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.inner.cache
    }

    /// Submit `url` for loading.
    ///
    /// A live cache entry completes the request before this returns, firing
    /// `on_complete` with `from_cache` set. Otherwise the request is queued
    /// in its priority lane.
    pub async fn load(&self, url: impl Into<String>, options: LoadOptions) -> Result<RequestId> {
        let url = url.into();
        Url::parse(&url).map_err(|e| DeliveryError::InvalidUrl(format!("{url}: {e}")))?;
        let id = self.inner.allocate_id();

        if !options.no_cache {
            if let Some(hit) = self.inner.cache.get(&url, None).await {
                let content_type = match hit.metadata.get(CONTENT_TYPE_KEY) {
                    Some(MetaValue::Str(value)) => Some(value.clone()),
                    _ => None,
                };
                let result = LoadResult {
                    request_id: id,
                    url: url.clone(),
                    total_bytes: hit.data.len() as u64,
                    content: hit.data,
                    content_type: content_type.clone(),
                    from_cache: true,
                    elapsed: Duration::ZERO,
                    streamed: false,
                };
                let callbacks = {
                    let mut tracked = Tracked::new(url, options, false);
                    tracked.status = LoadStatus::Completed;
                    tracked.loaded_bytes = result.total_bytes;
                    tracked.total_bytes = result.total_bytes;
                    tracked.content_type = content_type;
                    tracked.result = Some(result.clone());
                    tracked.completed_at = Some(Utc::now());
                    let callbacks = tracked.callbacks.clone();

                    let mut state = self.inner.state.lock();
                    state.requests.insert(id, tracked);
                    state.stats.completed += 1;
                    state.stats.cache_hits += 1;
                    state.retire(id, self.inner.config.history_limit);
                    callbacks
                };

                debug!(%id, url = %result.url, "Served from cache");
                if let Some(on_complete) = &callbacks.on_complete {
                    on_complete(&result);
                }
                return Ok(id);
            }
        }

        self.inner.enqueue(id, url, options, false);
        Ok(id)
    }

    /// Load several URLs: the first 3 at high priority, the next 7 at
    /// medium, the rest at low.
    pub async fn load_multiple<I, S>(&self, urls: I) -> Result<Vec<RequestId>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids = Vec::new();
        for (i, url) in urls.into_iter().enumerate() {
            let priority = match i {
                0..3 => Priority::High,
                3..10 => Priority::Medium,
                _ => Priority::Low,
            };
            ids.push(
                self.load(url, LoadOptions::new().with_priority(priority))
                    .await?,
            );
        }
        Ok(ids)
    }

    /// Cancel a queued or running load. Returns false if the request is
    /// unknown or already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(tracked) = state.requests.get_mut(&id) else {
            return false;
        };

        match tracked.status {
            LoadStatus::Queued => {
                tracked.status = LoadStatus::Cancelled;
                tracked.completed_at = Some(Utc::now());
                state.lanes[tracked.priority.lane()].retain(|queued| *queued != id);
                state.stats.cancelled += 1;
                state.retire(id, self.inner.config.history_limit);
                debug!(%id, "Cancelled queued load");
                true
            }
            LoadStatus::Loading => {
                // The worker notices at its next chunk boundary and retires it
                tracked.status = LoadStatus::Cancelled;
                tracked.completed_at = Some(Utc::now());
                state.stats.cancelled += 1;
                debug!(%id, "Cancelled running load");
                true
            }
            _ => false,
        }
    }

    pub fn get_status(&self, id: RequestId) -> Option<LoadSnapshot> {
        let state = self.inner.state.lock();
        state.requests.get(&id).map(|tracked| tracked.snapshot(id))
    }

    /// Wait for `id` to finish. The load is cancelled if it is still pending
    /// when `timeout` runs out.
    pub async fn wait_for_load(&self, id: RequestId, timeout: Duration) -> Result<LoadResult> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.inner.state.lock();
                let Some(tracked) = state.requests.get(&id) else {
                    return Err(DeliveryError::NotFound(id.to_string()));
                };
                match tracked.status {
                    LoadStatus::Completed => {
                        return tracked
                            .result
                            .clone()
                            .ok_or_else(|| DeliveryError::NotFound(id.to_string()));
                    }
                    LoadStatus::Failed => {
                        return Err(DeliveryError::transport(
                            &tracked.url,
                            tracked.error.as_deref().unwrap_or("load failed"),
                        ));
                    }
                    LoadStatus::Cancelled => {
                        return Err(DeliveryError::Cancelled {
                            target: tracked.url.clone(),
                        });
                    }
                    LoadStatus::Queued | LoadStatus::Loading => {}
                }
            }

            if Instant::now() >= deadline {
                warn!(%id, ?timeout, "Load timed out, cancelling");
                self.cancel(id);
                return Err(DeliveryError::Timeout {
                    target: id.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stream `url` straight into `path`, bypassing the cache and the lanes.
    ///
    /// Bytes land in a `.part` file that is renamed over `path` once the body
    /// is complete. Returns the number of bytes written.
    #[instrument(skip(self, path, headers, on_progress))]
    pub async fn stream_to_file(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        headers: HeaderMap,
        on_progress: impl Fn(u64, Option<u64>) + Send + Sync,
    ) -> Result<u64> {
        let path = path.as_ref();
        let partial = partial_path(path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeliveryError::storage(parent, e))?;
        }

        let request = FetchRequest::new(url).with_headers(headers).binary(true);
        let mut conn = self.inner.transport.open(request).await?;
        let total = conn.headers().content_length;

        let written = match self
            .inner
            .write_stream(conn.as_mut(), &partial, total, &on_progress)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| DeliveryError::storage(path, e))?;
        info!(url, bytes = written, "Streamed to file");
        Ok(written)
    }

    pub fn get_stats(&self) -> LoaderStats {
        let state = self.inner.state.lock();
        LoaderStats {
            queued_high: state.lanes[Priority::High.lane()].len(),
            queued_medium: state.lanes[Priority::Medium.lane()].len(),
            queued_low: state.lanes[Priority::Low.lane()].len(),
            active: state.active,
            ..state.stats
        }
    }
}

impl Drop for ProgressiveLoader {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    fn allocate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn enqueue(&self, id: RequestId, url: String, options: LoadOptions, prefetched: bool) {
        let priority = options.priority;
        {
            let mut state = self.state.lock();
            state.requests.insert(id, Tracked::new(url, options, prefetched));
            state.lanes[priority.lane()].push_back(id);
        }
        debug!(%id, %priority, "Queued load");
        self.notify.notify_one();
    }

    /// Pop the next queued request, high lane first, and mark it loading
    fn next_job(&self) -> Option<(RequestId, Job)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for priority in Priority::ALL {
            while let Some(id) = state.lanes[priority.lane()].pop_front() {
                let Some(tracked) = state.requests.get_mut(&id) else {
                    continue;
                };
                if tracked.status != LoadStatus::Queued {
                    continue;
                }
                tracked.status = LoadStatus::Loading;
                state.active += 1;
                let job = Job {
                    url: tracked.url.clone(),
                    headers: tracked.headers.clone(),
                    no_cache: tracked.no_cache,
                    force_progressive: tracked.force_progressive,
                    prefetched: tracked.prefetched,
                    callbacks: tracked.callbacks.clone(),
                };
                return Some((id, job));
            }
        }
        None
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "Loader dispatcher started");
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.config.concurrency.max(1) {
                let Some((id, job)) = self.next_job() else {
                    break;
                };
                in_flight.push(self.clone().perform_load(id, job));
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                _ = self.notify.notified() => {}
            }
        }

        info!(abandoned = in_flight.len(), "Loader dispatcher stopped");
    }

    async fn perform_load(self: Arc<Self>, id: RequestId, job: Job) {
        if let Some(on_start) = &job.callbacks.on_start {
            on_start(id);
        }
        let started = Instant::now();

        match self.fetch(id, &job).await {
            Ok(Some(fetched)) => self.complete(id, &job, fetched, started.elapsed()).await,
            Ok(None) => {
                debug!(%id, url = %job.url, "Load abandoned after cancellation");
                self.finish(id, |_, _| {});
            }
            Err(e) => self.fail(id, &job, e),
        }
    }

    fn is_loading(&self, id: RequestId) -> bool {
        self.state
            .lock()
            .requests
            .get(&id)
            .is_some_and(|tracked| tracked.status == LoadStatus::Loading)
    }

    fn update(&self, id: RequestId, f: impl FnOnce(&mut Tracked)) {
        if let Some(tracked) = self.state.lock().requests.get_mut(&id) {
            f(tracked);
        }
    }

    /// Fetch the body; `None` when the request was cancelled meanwhile
    async fn fetch(&self, id: RequestId, job: &Job) -> Result<Option<Fetched>> {
        let request = FetchRequest::new(&job.url).with_headers(job.headers.clone());
        let mut conn = self.transport.open(request).await?;

        let headers = conn.headers().clone();
        let mime = headers.mime();
        let total = headers.content_length;
        self.update(id, |tracked| {
            tracked.total_bytes = total.unwrap_or(0);
            tracked.content_type = headers.content_type.clone();
        });
        if !self.is_loading(id) {
            return Ok(None);
        }

        let capable = mime.as_deref().is_some_and(is_progressive_capable);
        let large = total.is_none_or(|len| len > 2 * self.config.chunk_size as u64);
        let streamed = capable && (job.force_progressive || large);

        let (content, received) = if streamed {
            match self.stream_body(id, job, conn.as_mut(), total).await? {
                Some(streamed) => streamed,
                None => return Ok(None),
            }
        } else {
            let content = conn.read_all().await?;
            if !self.is_loading(id) {
                return Ok(None);
            }
            let loaded = content.len() as u64;
            self.update(id, |tracked| tracked.loaded_bytes = loaded);
            (content, loaded)
        };

        Ok(Some(Fetched {
            content,
            received,
            content_type: headers.content_type,
            mime,
            streamed,
        }))
    }

    /// Read the body chunk by chunk. Returns the delivered content and the
    /// number of bytes received.
    async fn stream_body(
        &self,
        id: RequestId,
        job: &Job,
        conn: &mut dyn Connection,
        total: Option<u64>,
    ) -> Result<Option<(Bytes, u64)>> {
        let mut body = BytesMut::new();
        let mut received = 0u64;
        let mut reported = None;
        let mut last_progress: Option<Instant> = None;

        loop {
            if !self.is_loading(id) {
                return Ok(None);
            }
            let Some(chunk) = conn.read(self.config.chunk_size).await? else {
                break;
            };
            received += chunk.len() as u64;

            let chunk = match &job.callbacks.on_chunk {
                Some(on_chunk) => on_chunk(&chunk).unwrap_or(chunk),
                None => chunk,
            };
            body.extend_from_slice(&chunk);

            self.update(id, |tracked| tracked.loaded_bytes = received);

            if let Some(on_progress) = &job.callbacks.on_progress {
                if last_progress.is_none_or(|at| at.elapsed() >= self.config.progress_interval) {
                    on_progress(received, total);
                    reported = Some(received);
                    last_progress = Some(Instant::now());
                }
            }
        }

        if let Some(on_progress) = &job.callbacks.on_progress {
            if reported != Some(received) {
                on_progress(received, total);
            }
        }
        Ok(Some((body.freeze(), received)))
    }

    async fn write_stream(
        &self,
        conn: &mut dyn Connection,
        partial: &Path,
        total: Option<u64>,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<u64> {
        let file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| DeliveryError::storage(partial, e))?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut written = 0u64;
        let mut last_progress: Option<Instant> = None;

        while let Some(chunk) = conn.read(self.config.chunk_size).await? {
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DeliveryError::storage(partial, e))?;
            written += chunk.len() as u64;

            if last_progress.is_none_or(|at| at.elapsed() >= self.config.progress_interval) {
                on_progress(written, total);
                last_progress = Some(Instant::now());
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| DeliveryError::storage(partial, e))?;
        on_progress(written, total);
        Ok(written)
    }

    /// Retire a running request. `apply` runs only if it is still loading,
    /// i.e. it was not cancelled meanwhile.
    fn finish(&self, id: RequestId, apply: impl FnOnce(&mut Tracked, &mut LoaderStats)) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.active = state.active.saturating_sub(1);

        let applied = match state.requests.get_mut(&id) {
            Some(tracked) if tracked.status == LoadStatus::Loading => {
                apply(tracked, &mut state.stats);
                tracked.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        };
        state.retire(id, self.config.history_limit);
        applied
    }

    async fn complete(&self, id: RequestId, job: &Job, fetched: Fetched, elapsed: Duration) {
        if !job.no_cache {
            let asset_type = AssetType::from_content_type(fetched.content_type.as_deref());
            let mut metadata = Metadata::new();
            if let Some(content_type) = &fetched.content_type {
                metadata.insert(CONTENT_TYPE_KEY.to_string(), content_type.as_str().into());
            }
            if let Err(e) = self
                .cache
                .set(&job.url, fetched.content.clone(), asset_type, metadata)
                .await
            {
                debug!(url = %job.url, error = %e, "Load result not cached");
            }
        }

        let result = LoadResult {
            request_id: id,
            url: job.url.clone(),
            total_bytes: fetched.content.len() as u64,
            content: fetched.content,
            content_type: fetched.content_type,
            from_cache: false,
            elapsed,
            streamed: fetched.streamed,
        };

        let received = fetched.received;
        let recorded = result.clone();
        let accepted = self.finish(id, move |tracked, stats| {
            tracked.status = LoadStatus::Completed;
            tracked.loaded_bytes = received;
            stats.completed += 1;
            stats.bytes_loaded += received;
            tracked.result = Some(recorded);
        });
        if !accepted {
            return;
        }

        debug!(
            %id,
            url = %result.url,
            bytes = result.total_bytes,
            streamed = result.streamed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Load completed"
        );
        if let Some(on_complete) = &job.callbacks.on_complete {
            on_complete(&result);
        }

        let wants_links = (self.config.prefetch || job.force_progressive) && !job.prefetched;
        if wants_links && fetched.mime.as_deref().is_some_and(is_markup) {
            self.prefetch_links(&job.url, &result.content).await;
        }
    }

    fn fail(&self, id: RequestId, job: &Job, error: DeliveryError) {
        error!(%id, url = %job.url, error = %error, "Load failed");
        let message = error.to_string();
        let accepted = self.finish(id, |tracked, stats| {
            tracked.status = LoadStatus::Failed;
            tracked.error = Some(message);
            stats.failed += 1;
        });
        if accepted {
            if let Some(on_error) = &job.callbacks.on_error {
                on_error(&error);
            }
        }
    }

    fn is_known(&self, url: &str) -> bool {
        self.state
            .lock()
            .requests
            .values()
            .any(|tracked| tracked.url == url)
    }

    async fn prefetch_links(&self, page_url: &str, content: &Bytes) {
        let Ok(base) = Url::parse(page_url) else {
            return;
        };
        let Ok(markup) = std::str::from_utf8(content) else {
            return;
        };

        let mut queued = 0;
        for link in extract_links(&base, markup) {
            if queued >= self.config.prefetch_batch {
                break;
            }
            if self.is_known(&link) || self.cache.contains(&link).await {
                continue;
            }
            let id = self.allocate_id();
            self.enqueue(id, link, LoadOptions::new().with_priority(Priority::Low), true);
            queued += 1;
        }

        if queued > 0 {
            debug!(page = page_url, count = queued, "Prefetching linked resources");
        }
    }
}
