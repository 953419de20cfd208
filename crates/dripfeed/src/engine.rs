//! Wiring of the shared transport and cache into the loader and the
//! download manager.

use std::sync::Arc;

use tracing::debug;

use crate::cache::AssetCache;
use crate::config::EngineConfig;
use crate::download::DownloadManager;
use crate::error::Result;
use crate::loader::ProgressiveLoader;
use crate::net::{HttpTransport, Transport};

/// Factory for the delivery components, all sharing one transport and one
/// cache
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    cache: Arc<AssetCache>,
}

impl Engine {
    /// Build an engine on top of a reqwest client configured from `config.client`
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.client)?);
        Self::with_transport(config, transport).await
    }

    /// Build an engine on top of an existing transport
    pub async fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let cache = Arc::new(AssetCache::open(config.cache.clone()).await?);
        debug!(
            cache_dir = ?config.cache.directory,
            download_dir = ?config.download.directory,
            "Engine ready"
        );
        Ok(Self {
            config,
            transport,
            cache,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Create a loader; its dispatcher runs until the loader is dropped
    pub fn loader(&self) -> ProgressiveLoader {
        ProgressiveLoader::new(
            self.config.loader.clone(),
            self.cache.clone(),
            self.transport.clone(),
        )
    }

    /// Create a download manager, restoring any persisted queue
    pub async fn download_manager(&self) -> Result<DownloadManager> {
        DownloadManager::new(self.config.download.clone(), self.transport.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::loader::LoadOptions;
    use crate::net::mock::MockTransport;

    #[tokio::test]
    async fn test_components_share_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::builder()
            .with_cache_dir(dir.path().join("cache"))
            .with_download_dir(dir.path().join("downloads"))
            .build();
        let mock = MockTransport::new();
        mock.serve("http://t/a.css", b"body { }".to_vec(), "text/css");

        let engine = Engine::with_transport(config, mock.clone()).await.unwrap();
        let loader = engine.loader();
        let id = loader
            .load("http://t/a.css", LoadOptions::default())
            .await
            .unwrap();
        loader
            .wait_for_load(id, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(engine.cache().contains("http://t/a.css").await);
        let manager = engine.download_manager().await.unwrap();
        assert!(manager.get_all_downloads().queued.is_empty());
    }
}
