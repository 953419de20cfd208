//! A single resumable transfer attempt.
//!
//! Bytes are appended to the partial file as they arrive, so its length is
//! always the offset the next attempt resumes from. Only a complete body is
//! renamed into place.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{DeliveryError, Result};
use crate::net::{FetchRequest, Transport};
use crate::store::free_space;

/// What one attempt should fetch and where it goes
#[derive(Debug, Clone)]
pub(crate) struct TransferJob {
    pub url: String,
    pub destination: PathBuf,
    pub partial: PathBuf,
    pub headers: HeaderMap,
    pub binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    /// The destination file now holds `size` bytes
    Completed { size: u64 },
    /// Stopped at a chunk boundary because the download left `downloading`
    Interrupted,
}

pub(crate) struct TransferSettings {
    pub chunk_size: usize,
    pub progress_interval: Duration,
}

async fn partial_len(path: &Path) -> Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DeliveryError::storage(path, e)),
    }
}

async fn finalize(job: &TransferJob) -> Result<()> {
    fs::rename(&job.partial, &job.destination)
        .await
        .map_err(|e| DeliveryError::storage(&job.destination, e))
}

/// Run one attempt.
///
/// `is_active` is polled once the connection opens, at every chunk boundary
/// and before the partial file is renamed; `report` receives progress
/// after each chunk, with the speed refreshed at least once per
/// `progress_interval`.
#[instrument(skip_all, fields(url = %job.url))]
pub(crate) async fn transfer(
    transport: &dyn Transport,
    job: &TransferJob,
    settings: &TransferSettings,
    is_active: impl Fn() -> bool,
    mut report: impl FnMut(TransferProgress),
) -> Result<TransferOutcome> {
    if let Some(parent) = job.destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DeliveryError::storage(parent, e))?;
    }

    let offset = partial_len(&job.partial).await?;
    let request = FetchRequest::new(&job.url)
        .with_headers(job.headers.clone())
        .binary(job.binary)
        .with_range_start(offset);
    let mut conn = transport.open(request).await?;
    if !is_active() {
        debug!(offset, "Transfer interrupted before the first byte");
        return Ok(TransferOutcome::Interrupted);
    }
    let headers = conn.headers().clone();

    if headers.status == 416 {
        if offset > 0 && headers.total_length.is_none_or(|total| total == offset) {
            info!(size = offset, "Partial file already complete");
            finalize(job).await?;
            report(TransferProgress {
                downloaded: offset,
                total: Some(offset),
                speed: 0.0,
            });
            return Ok(TransferOutcome::Completed { size: offset });
        }
        // Partial is longer than the resource; start over on the next attempt
        let _ = fs::remove_file(&job.partial).await;
        return Err(DeliveryError::transport(
            &job.url,
            format!("range not satisfiable at offset {offset}"),
        ));
    }

    let resuming = offset > 0 && headers.is_partial();
    if offset > 0 && !resuming {
        warn!(offset, "Server ignored the range request, restarting from zero");
    } else if resuming {
        debug!(offset, "Resuming partial download");
    }
    let mut downloaded = if resuming { offset } else { 0 };
    let total = headers
        .total_length
        .or(headers.content_length.map(|len| len + downloaded));

    if let Some(total) = total {
        let needed = total.saturating_sub(downloaded);
        let dir = job.partial.parent().unwrap_or(Path::new("."));
        if let Some(available) = free_space(dir) {
            if needed > available {
                return Err(DeliveryError::storage(
                    &job.partial,
                    io::Error::new(
                        io::ErrorKind::StorageFull,
                        format!("{needed} bytes needed, {available} available"),
                    ),
                ));
            }
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(resuming)
        .truncate(!resuming)
        .open(&job.partial)
        .await
        .map_err(|e| DeliveryError::storage(&job.partial, e))?;
    let mut writer = BufWriter::new(file);

    let mut speed = 0.0;
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;
    report(TransferProgress {
        downloaded,
        total,
        speed,
    });

    loop {
        if !is_active() {
            writer
                .flush()
                .await
                .map_err(|e| DeliveryError::storage(&job.partial, e))?;
            debug!(downloaded, "Transfer interrupted");
            return Ok(TransferOutcome::Interrupted);
        }

        let chunk = match conn.read(settings.chunk_size).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                // Keep what arrived so the next attempt resumes after it
                let _ = writer.flush().await;
                return Err(e);
            }
        };

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DeliveryError::storage(&job.partial, e))?;
        downloaded += chunk.len() as u64;
        window_bytes += chunk.len() as u64;

        let elapsed = window_start.elapsed();
        if elapsed >= settings.progress_interval {
            speed = window_bytes as f64 / elapsed.as_secs_f64();
            window_start = Instant::now();
            window_bytes = 0;
        }
        report(TransferProgress {
            downloaded,
            total,
            speed,
        });
    }

    writer
        .flush()
        .await
        .map_err(|e| DeliveryError::storage(&job.partial, e))?;
    drop(writer);

    if let Some(total) = total {
        if downloaded < total {
            return Err(DeliveryError::transport(
                &job.url,
                format!("connection closed after {downloaded} of {total} bytes"),
            ));
        }
    }

    if !is_active() {
        debug!(downloaded, "Transfer interrupted before finalizing");
        return Ok(TransferOutcome::Interrupted);
    }
    finalize(job).await?;
    info!(size = downloaded, destination = ?job.destination, "Transfer complete");
    Ok(TransferOutcome::Completed { size: downloaded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::config::ClientConfig;
    use crate::net::HttpTransport;
    use crate::net::mock::{MockRoute, MockTransport};
    use crate::store::partial_path;

    fn body() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    fn job(dir: &Path, url: &str) -> TransferJob {
        let destination = dir.join("file.bin");
        TransferJob {
            url: url.to_string(),
            partial: partial_path(&destination),
            destination,
            headers: HeaderMap::new(),
            binary: true,
        }
    }

    fn settings() -> TransferSettings {
        TransferSettings {
            chunk_size: 100,
            progress_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_resume_sends_range_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.serve("http://t/file.bin", body(), "application/octet-stream");
        let job = job(dir.path(), "http://t/file.bin");
        std::fs::write(&job.partial, &body()[..300]).unwrap();

        let mut last = None;
        let outcome = transfer(&*mock, &job, &settings(), || true, |p| last = Some(p))
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { size: 1000 });
        assert_eq!(mock.requests()[0].range.as_deref(), Some("bytes=300-"));
        assert_eq!(std::fs::read(&job.destination).unwrap(), body());
        assert!(!job.partial.exists());
        let last = last.unwrap();
        assert_eq!((last.downloaded, last.total), (1000, Some(1000)));
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        let mut route = MockRoute::new(body(), "application/octet-stream");
        route.ignore_range = true;
        mock.route("http://t/file.bin", route);
        let job = job(dir.path(), "http://t/file.bin");
        std::fs::write(&job.partial, vec![0xAA; 300]).unwrap();

        transfer(&*mock, &job, &settings(), || true, |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&job.destination).unwrap(), body());
    }

    #[tokio::test]
    async fn test_complete_partial_is_finalized_on_416() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.serve("http://t/file.bin", body(), "application/octet-stream");
        let job = job(dir.path(), "http://t/file.bin");
        std::fs::write(&job.partial, body()).unwrap();

        let outcome = transfer(&*mock, &job, &settings(), || true, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Completed { size: 1000 });
        assert_eq!(std::fs::read(&job.destination).unwrap(), body());
    }

    #[tokio::test]
    async fn test_dropped_connection_keeps_received_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        let mut route = MockRoute::new(body(), "application/octet-stream");
        route.fail_after = Some(400);
        mock.route("http://t/file.bin", route);
        let job = job(dir.path(), "http://t/file.bin");

        let err = transfer(&*mock, &job, &settings(), || true, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(std::fs::metadata(&job.partial).unwrap().len(), 400);

        transfer(&*mock, &job, &settings(), || true, |_| {})
            .await
            .unwrap();
        assert_eq!(mock.requests()[1].range.as_deref(), Some("bytes=400-"));
        assert_eq!(std::fs::read(&job.destination).unwrap(), body());
    }

    #[tokio::test]
    async fn test_interrupt_stops_at_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.serve("http://t/file.bin", body(), "application/octet-stream");
        let job = job(dir.path(), "http://t/file.bin");

        let active = AtomicBool::new(true);
        let outcome = transfer(
            &*mock,
            &job,
            &settings(),
            || active.load(Ordering::SeqCst),
            |p| {
                if p.downloaded >= 200 {
                    active.store(false, Ordering::SeqCst);
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, TransferOutcome::Interrupted);
        assert_eq!(std::fs::metadata(&job.partial).unwrap().len(), 200);
        assert!(!job.destination.exists());
    }

    #[tokio::test]
    async fn test_416_from_http_server_finalizes_complete_partial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;

            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = "HTTP/1.1 416 Range Not Satisfiable\r\n\
                            Content-Range: bytes */1000\r\n\
                            Content-Length: 0\r\n\
                            Connection: close\r\n\r\n";
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        let dir = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new(&ClientConfig::default()).unwrap();
        let job = job(dir.path(), &format!("http://{addr}/file.bin"));
        std::fs::write(&job.partial, body()).unwrap();

        let outcome = transfer(&transport, &job, &settings(), || true, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Completed { size: 1000 });
        assert_eq!(std::fs::read(&job.destination).unwrap(), body());
        assert!(!job.partial.exists());
    }

    #[tokio::test]
    async fn test_cancel_during_open_leaves_partial_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        let mut route = MockRoute::new(body(), "application/octet-stream");
        route.open_delay = Some(Duration::from_millis(50));
        mock.route("http://t/file.bin", route);
        let job = job(dir.path(), "http://t/file.bin");

        let outcome = transfer(&*mock, &job, &settings(), || false, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Interrupted);
        assert!(!job.partial.exists());
        assert!(!job.destination.exists());
    }

    #[tokio::test]
    async fn test_cancel_after_last_chunk_skips_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.serve("http://t/file.bin", body(), "application/octet-stream");
        let job = job(dir.path(), "http://t/file.bin");

        // One check after open, ten full chunks, then the read that hits the end
        let checks_while_reading = 1 + body().len() / settings().chunk_size + 1;
        let calls = AtomicUsize::new(0);
        let outcome = transfer(
            &*mock,
            &job,
            &settings(),
            || calls.fetch_add(1, Ordering::SeqCst) < checks_while_reading,
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome, TransferOutcome::Interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), checks_while_reading + 1);
        assert!(!job.destination.exists());
        assert_eq!(std::fs::metadata(&job.partial).unwrap().len(), 1000);
    }
}
