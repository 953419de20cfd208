use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::{CacheConfig, DownloadConfig, LoaderConfig};

const DEFAULT_USER_AGENT: &str = concat!("dripfeed/", env!("CARGO_PKG_VERSION"));

/// Options for the HTTP client behind the network-fetch primitive
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Overall timeout for the entire HTTP request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            // Slow links: no overall cap, rely on the read timeout instead
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: ClientConfig::get_default_headers(),
        }
    }
}

impl ClientConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers
    }

    /// Merge extra headers on top of the defaults; later values win.
    pub fn merge_headers(&mut self, extra: &HeaderMap) {
        for (name, value) in extra.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
    }
}

/// Configuration for every component of the engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    pub download: DownloadConfig,
}

impl EngineConfig {
    pub fn builder() -> crate::builder::EngineConfigBuilder {
        crate::builder::EngineConfigBuilder::new()
    }
}
