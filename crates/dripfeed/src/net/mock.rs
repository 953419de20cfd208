//! In-memory transport used by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{Connection, FetchRequest, ResponseHeaders, Transport};
use crate::error::{DeliveryError, Result};

#[derive(Debug, Clone)]
pub(crate) struct MockRoute {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Serve without a content length
    pub omit_length: bool,
    /// Ignore `Range` and always answer 200 with the full body
    pub ignore_range: bool,
    /// Fail the first N opens with a transport error
    pub fail_opens: usize,
    /// Drop the next connection once this many bytes of the body have
    /// been served; later connections succeed
    pub fail_after: Option<usize>,
    pub status: u16,
    /// Wait this long before answering an open
    pub open_delay: Option<Duration>,
    pub chunk_delay: Option<Duration>,
}

impl MockRoute {
    pub fn new(body: impl Into<Bytes>, content_type: &str) -> Self {
        Self {
            body: body.into(),
            content_type: Some(content_type.to_string()),
            omit_length: false,
            ignore_range: false,
            fail_opens: 0,
            fail_after: None,
            status: 200,
            open_delay: None,
            chunk_delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub url: String,
    pub range: Option<String>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<HashMap<String, MockRoute>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, route: MockRoute) {
        self.routes.lock().insert(url.to_string(), route);
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>, content_type: &str) {
        self.route(url, MockRoute::new(body, content_type));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn open_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: FetchRequest) -> Result<Box<dyn Connection>> {
        self.requests.lock().push(RecordedRequest {
            url: request.url.clone(),
            range: request.range_header(),
        });
        tokio::task::yield_now().await;

        let route = {
            let mut routes = self.routes.lock();
            let Some(route) = routes.get_mut(&request.url) else {
                return Err(DeliveryError::Status {
                    url: request.url,
                    status: reqwest::StatusCode::NOT_FOUND,
                });
            };
            if route.fail_opens > 0 {
                route.fail_opens -= 1;
                return Err(DeliveryError::transport(&request.url, "connection reset"));
            }
            let served = route.clone();
            route.fail_after = None;
            served
        };
        if let Some(delay) = route.open_delay {
            tokio::time::sleep(delay).await;
        }

        if route.status >= 400 {
            return Err(DeliveryError::Status {
                url: request.url,
                status: reqwest::StatusCode::from_u16(route.status)
                    .unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            });
        }

        let full_len = route.body.len() as u64;
        let offset = match request.range_start {
            Some(start) if !route.ignore_range => start,
            _ => 0,
        };

        let mut headers = ResponseHeaders {
            content_type: route.content_type.clone(),
            ..Default::default()
        };
        if offset >= full_len && offset > 0 {
            headers.status = 416;
            headers.total_length = Some(full_len);
            headers.content_length = Some(0);
            return Ok(Box::new(MockConnection {
                headers,
                body: Bytes::new(),
                position: 0,
                served_before: 0,
                fail_after: None,
                chunk_delay: None,
            }));
        }

        let body = route.body.slice(offset as usize..);
        headers.status = if offset > 0 { 206 } else { 200 };
        if !route.omit_length {
            headers.content_length = Some(body.len() as u64);
            headers.total_length = Some(full_len);
        }

        Ok(Box::new(MockConnection {
            headers,
            body,
            position: 0,
            served_before: offset as usize,
            fail_after: route.fail_after,
            chunk_delay: route.chunk_delay,
        }))
    }
}

struct MockConnection {
    headers: ResponseHeaders,
    body: Bytes,
    position: usize,
    served_before: usize,
    fail_after: Option<usize>,
    chunk_delay: Option<Duration>,
}

#[async_trait]
impl Connection for MockConnection {
    fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    async fn read(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        match self.chunk_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if let Some(limit) = self.fail_after {
            if self.served_before + self.position >= limit {
                return Err(DeliveryError::transport("mock", "connection dropped"));
            }
        }
        if self.position >= self.body.len() {
            return Ok(None);
        }
        let mut end = (self.position + max_bytes.max(1)).min(self.body.len());
        if let Some(limit) = self.fail_after {
            end = end.min(limit.saturating_sub(self.served_before)).max(self.position + 1);
        }
        let chunk = self.body.slice(self.position..end);
        self.position = end;
        Ok(Some(chunk))
    }
}
