//! # Builder for EngineConfig
//!
//! Fluent construction of an [`EngineConfig`], starting from the defaults of
//! every component.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use dripfeed::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .with_read_timeout(Duration::from_secs(60))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .with_cache_dir("/tmp/my-cache")
//!     .with_cache_size(8 * 1024 * 1024)
//!     .with_loader_concurrency(4)
//!     .with_max_retries(5)
//!     .build();
//!
//! assert_eq!(config.loader.concurrency, 4);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::{CacheConfig, ClientConfig, DownloadConfig, EngineConfig, LoaderConfig};

/// Builder for creating EngineConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.config.client = client;
        self
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.connect_timeout = timeout;
        self
    }

    /// Set the read timeout (maximum time between receiving data chunks)
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.read_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.client.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.client.user_agent = user_agent.into();
        self
    }

    /// Add a header sent with every request; invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.client.headers.insert(name, value);
        }
        self
    }

    /// Merge headers into the client defaults
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.client.merge_headers(&headers);
        self
    }

    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn with_caching_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn with_cache_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.cache.directory = directory.into();
        self
    }

    /// Set the global cache budget. Tier budgets larger than it are clamped.
    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        let cache = &mut self.config.cache;
        cache.max_cache_size = bytes;
        cache.max_durable_size = cache.max_durable_size.min(bytes);
        cache.max_volatile_size = cache.max_volatile_size.min(bytes);
        self
    }

    pub fn with_cache_max_age(mut self, max_age: Duration) -> Self {
        self.config.cache.max_age = max_age;
        self
    }

    pub fn with_loader_config(mut self, loader: LoaderConfig) -> Self {
        self.config.loader = loader;
        self
    }

    pub fn with_loader_concurrency(mut self, concurrency: usize) -> Self {
        self.config.loader.concurrency = concurrency;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.config.loader.chunk_size = bytes;
        self
    }

    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.config.loader.prefetch = enabled;
        self
    }

    pub fn with_download_config(mut self, download: DownloadConfig) -> Self {
        self.config.download = download;
        self
    }

    pub fn with_download_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.download.directory = directory.into();
        self
    }

    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.config.download.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.download.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.download.retry_delay = delay;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = EngineConfigBuilder::new().build();
        assert_eq!(config.client.timeout, Duration::ZERO);
        assert_eq!(config.client.connect_timeout, Duration::from_secs(15));
        assert!(config.client.follow_redirects);
        assert!(config.cache.enabled);
        assert_eq!(config.loader.concurrency, 3);
        assert_eq!(config.download.max_retries, 3);
    }

    #[test]
    fn test_builder_customization() {
        let config = EngineConfigBuilder::new()
            .with_read_timeout(Duration::from_secs(90))
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_header("bad header", "ignored")
            .with_cache_dir("/tmp/elsewhere")
            .with_cache_size(1024)
            .with_prefetch(false)
            .with_download_concurrency(1)
            .with_retry_delay(Duration::from_millis(500))
            .build();

        assert_eq!(config.client.read_timeout, Duration::from_secs(90));
        assert_eq!(config.client.user_agent, "CustomUserAgent/1.0");
        assert_eq!(
            config.client.headers.get("X-Custom-Header").unwrap(),
            "CustomValue"
        );
        assert!(config.client.headers.get("bad header").is_none());
        assert!(
            config
                .client
                .headers
                .contains_key(reqwest::header::ACCEPT)
        );
        assert_eq!(config.cache.directory, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.cache.max_cache_size, 1024);
        assert_eq!(config.cache.max_durable_size, 1024);
        assert_eq!(config.cache.max_volatile_size, 1024);
        assert!(!config.loader.prefetch);
        assert_eq!(config.download.concurrency, 1);
        assert_eq!(config.download.retry_delay, Duration::from_millis(500));
    }
}
