use dripfeed::{Download, DownloadStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// One bar per download, all drawn through a shared `MultiProgress`
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            disabled: true,
        }
    }

    /// Create the bar for a download about to be queued
    pub fn add_bar(&self, label: &str) -> ProgressBar {
        if self.disabled {
            return ProgressBar::hidden();
        }
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(download_style());
        bar.set_message(format!("Queued {label}"));
        bar.enable_steady_tick(Duration::from_millis(500));
        bar
    }

    /// Reflect a download's latest progress on its bar
    pub fn update(bar: &ProgressBar, download: &Download) {
        if let Some(total) = download.size_bytes {
            bar.set_length(total);
        }
        bar.set_position(download.downloaded_bytes);
        match download.status {
            DownloadStatus::Downloading if download.retry_count > 0 => bar.set_message(format!(
                "Downloading {} (retry {})",
                download.filename, download.retry_count
            )),
            DownloadStatus::Downloading => {
                bar.set_message(format!("Downloading {}", download.filename))
            }
            DownloadStatus::Queued => bar.set_message(format!("Waiting {}", download.filename)),
            _ => {}
        }
    }

    pub fn finish(bar: &ProgressBar, download: &Download) {
        match download.status {
            DownloadStatus::Completed => {
                bar.finish_with_message(format!("Finished {}", download.filename))
            }
            status => bar.abandon_with_message(format!("{} {}", status, download.filename)),
        }
    }
}
