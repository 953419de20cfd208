//! # Network-fetch primitive
//!
//! The loader and the download manager never talk to an HTTP client
//! directly. They open a [`Connection`] through a [`Transport`] and pull
//! bounded chunks from it, which keeps memory use proportional to the chunk
//! size rather than the resource size.

mod http;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::HeaderMap;

use crate::error::Result;

pub use http::{HttpTransport, create_client};

/// A single fetch to be opened by a [`Transport`]
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Extra request headers, applied on top of the client defaults
    pub headers: HeaderMap,
    /// Byte offset to resume from; sent as `Range: bytes=N-`
    pub range_start: Option<u64>,
    /// Binary transfers ask for identity encoding so byte offsets line up
    /// with the server's view of the resource.
    pub binary: bool,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            range_start: None,
            binary: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_range_start(mut self, offset: u64) -> Self {
        self.range_start = (offset > 0).then_some(offset);
        self
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// The `Range` header value for this request, if any
    pub fn range_header(&self) -> Option<String> {
        self.range_start.map(|offset| format!("bytes={offset}-"))
    }
}

/// Response metadata available once a connection is open
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    pub status: u16,
    /// Length of the body that will be delivered on this connection
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    /// Full size of the resource, derived from `Content-Range` on partial
    /// responses and equal to `content_length` otherwise.
    pub total_length: Option<u64>,
    pub headers: HashMap<String, String>,
}

impl ResponseHeaders {
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Content type without parameters, lowercased (`text/html; charset=x` → `text/html`)
    pub fn mime(&self) -> Option<String> {
        self.content_type.as_deref().map(mime_essence)
    }
}

pub(crate) fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Total resource size from a `Content-Range: bytes a-b/T` header value
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// An open response body
#[async_trait]
pub trait Connection: Send {
    fn headers(&self) -> &ResponseHeaders;

    /// Read at most `max_bytes`; `None` once the body is exhausted.
    async fn read(&mut self, max_bytes: usize) -> Result<Option<Bytes>>;

    /// Drain the remainder of the body.
    async fn read_all(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read(64 * 1024).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Opens connections; implemented over reqwest for real traffic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: FetchRequest) -> Result<Box<dyn Connection>>;
}
