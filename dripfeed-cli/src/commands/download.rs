use std::time::Duration;

use dripfeed::{DeliveryError, DownloadCallbacks, DownloadManager, DownloadOptions};
use reqwest::header::HeaderMap;
use tracing::{error, info};

use crate::error::AppError;
use crate::utils::format_bytes;
use crate::utils::progress::ProgressManager;

const WAIT_SLICE: Duration = Duration::from_secs(3600);

pub struct DownloadArgs {
    pub urls: Vec<String>,
    pub overwrite: bool,
    pub headers: HeaderMap,
}

/// Queue every URL and wait until each download succeeds or fails for good
pub async fn run_download(
    manager: &DownloadManager,
    progress: &ProgressManager,
    args: DownloadArgs,
) -> Result<(), AppError> {
    let mut ids = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let bar = progress.add_bar(url);
        let (on_progress, on_complete, on_error) = (bar.clone(), bar.clone(), bar);
        let callbacks = DownloadCallbacks::new()
            .on_progress(move |download| ProgressManager::update(&on_progress, download))
            .on_complete(move |download| ProgressManager::finish(&on_complete, download))
            .on_error(move |download, _| ProgressManager::finish(&on_error, download));
        let options = DownloadOptions::new()
            .with_headers(args.headers.clone())
            .overwrite(args.overwrite)
            .with_callbacks(callbacks);
        let id = manager.download(url, options).await?;
        info!(%id, %url, "Queued download");
        ids.push(id);
    }

    let mut failed = 0;
    for id in ids {
        let outcome = loop {
            match manager.wait_for_download(id, WAIT_SLICE).await {
                Err(DeliveryError::Timeout { .. }) => continue,
                other => break other,
            }
        };
        match outcome {
            Ok(download) => info!(
                file = %download.destination_path.display(),
                size = %format_bytes(download.downloaded_bytes),
                retries = download.retry_count,
                "Download complete"
            ),
            Err(e) => {
                failed += 1;
                error!(%id, error = %e, "Download failed");
            }
        }
    }

    if failed > 0 {
        return Err(AppError::Incomplete {
            failed,
            total: args.urls.len(),
        });
    }
    Ok(())
}
