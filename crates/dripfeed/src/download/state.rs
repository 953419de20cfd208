//! Persisted download queue and outcome histories.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::types::{Download, DownloadStatus};
use crate::error::{DeliveryError, Result};

/// On-disk shape of the state file
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PersistedState {
    /// Unfinished downloads: queued, downloading or paused
    #[serde(default)]
    pub queued: Vec<Download>,
    #[serde(default)]
    pub completed: Vec<Download>,
    #[serde(default)]
    pub failed: Vec<Download>,
}

#[derive(Debug, Clone)]
pub(crate) struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state.
    ///
    /// A download that was transferring when the process stopped comes back
    /// queued; paused ones stay paused. A missing or corrupt file yields an
    /// empty state.
    pub async fn load(&self) -> PersistedState {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedState::default(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to read download state");
                return PersistedState::default();
            }
        };

        let mut state: PersistedState = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Download state is corrupt, starting empty");
                return PersistedState::default();
            }
        };

        for download in &mut state.queued {
            if download.status != DownloadStatus::Paused {
                download.status = DownloadStatus::Queued;
            }
            download.speed_bytes_per_sec = 0.0;
        }
        debug!(
            path = ?self.path,
            queued = state.queued.len(),
            completed = state.completed.len(),
            failed = state.failed.len(),
            "Loaded download state"
        );
        state
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DeliveryError::storage(parent, e))?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .await
            .map_err(|e| DeliveryError::storage(&temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DeliveryError::storage(&self.path, e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn download(status: DownloadStatus) -> Download {
        Download {
            id: Uuid::new_v4(),
            url: "http://x/file.bin".into(),
            filename: "file.bin".into(),
            destination_path: "/tmp/file.bin".into(),
            status,
            size_bytes: Some(100),
            downloaded_bytes: 40,
            progress_percent: 40.0,
            speed_bytes_per_sec: 12.5,
            retry_count: 1,
            partial_path: "/tmp/file.bin.part".into(),
            error: None,
            headers: Default::default(),
            binary: true,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_interrupted_downloads_come_back_queued() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));

        let state = PersistedState {
            queued: vec![
                download(DownloadStatus::Downloading),
                download(DownloadStatus::Paused),
                download(DownloadStatus::Queued),
            ],
            completed: vec![download(DownloadStatus::Completed)],
            failed: Vec::new(),
        };
        file.save(&state).await.unwrap();

        let loaded = file.load().await;
        let statuses: Vec<DownloadStatus> = loaded.queued.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![
                DownloadStatus::Queued,
                DownloadStatus::Paused,
                DownloadStatus::Queued
            ]
        );
        assert!(loaded.queued.iter().all(|d| d.speed_bytes_per_sec == 0.0));
        assert_eq!(loaded.queued[0].downloaded_bytes, 40);
        assert_eq!(loaded.completed, state.completed);
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let loaded = StateFile::new(&path).load().await;
        assert!(loaded.queued.is_empty());
        assert!(loaded.completed.is_empty());
        assert!(loaded.failed.is_empty());
    }
}
