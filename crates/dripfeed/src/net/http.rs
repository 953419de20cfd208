use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, CONTENT_TYPE, HeaderValue, RANGE};
use tracing::{debug, instrument};

use super::{Connection, FetchRequest, ResponseHeaders, Transport, parse_content_range_total};
use crate::config::ClientConfig;
use crate::error::{DeliveryError, Result};

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &ClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(2)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    client_builder.build().map_err(DeliveryError::from)
}

/// [`Transport`] over a shared reqwest client
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(url = %request.url), level = "debug")]
    async fn open(&self, request: FetchRequest) -> Result<Box<dyn Connection>> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| DeliveryError::InvalidUrl(format!("{}: {e}", request.url)))?;

        let mut builder = self.client.get(url).headers(request.headers.clone());
        if let Some(range) = request.range_header() {
            builder = builder.header(RANGE, range);
        }
        if request.binary {
            builder = builder.header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DeliveryError::transport(&request.url, e))?;

        let status = response.status();
        // 416 is handed to the caller: a resume past the end means the partial
        // file may already be complete.
        if !status.is_success() && status.as_u16() != 416 {
            return Err(DeliveryError::Status {
                url: request.url,
                status,
            });
        }

        let headers = response_headers(&response, request.range_start);
        debug!(
            status = headers.status,
            length = ?headers.content_length,
            total = ?headers.total_length,
            content_type = ?headers.content_type,
            "Connection opened"
        );

        Ok(Box::new(HttpConnection::new(
            request.url,
            headers,
            response.bytes_stream(),
        )))
    }
}

fn response_headers(response: &reqwest::Response, range_start: Option<u64>) -> ResponseHeaders {
    let status = response.status().as_u16();
    let header = |name: reqwest::header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let content_length = response.content_length();
    let total_length = total_length(
        status,
        header(CONTENT_RANGE).as_deref(),
        content_length,
        range_start,
    );

    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    ResponseHeaders {
        status,
        content_length,
        content_type: header(CONTENT_TYPE),
        total_length,
        headers,
    }
}

/// Full resource size for a response.
///
/// 206 and 416 replies describe the resource in `Content-Range` (`bytes a-b/T`
/// and `bytes */T`); their `Content-Length` only covers the body sent.
fn total_length(
    status: u16,
    content_range: Option<&str>,
    content_length: Option<u64>,
    range_start: Option<u64>,
) -> Option<u64> {
    match status {
        206 => content_range
            .and_then(parse_content_range_total)
            .or_else(|| content_length.map(|len| len + range_start.unwrap_or(0))),
        416 => content_range.and_then(parse_content_range_total),
        _ => content_length,
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Re-slices the response stream into chunks no larger than the caller asks for
struct HttpConnection {
    url: String,
    headers: ResponseHeaders,
    stream: ByteStream,
    current_chunk: Option<Bytes>,
}

impl HttpConnection {
    fn new(
        url: String,
        headers: ResponseHeaders,
        stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            url,
            headers,
            stream: Box::pin(stream),
            current_chunk: None,
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    async fn read(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        let max_bytes = max_bytes.max(1);
        loop {
            if let Some(chunk) = self.current_chunk.as_mut() {
                if !chunk.is_empty() {
                    let take = chunk.len().min(max_bytes);
                    return Ok(Some(chunk.split_to(take)));
                }
                self.current_chunk = None;
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    if !chunk.is_empty() {
                        self.current_chunk = Some(chunk);
                    }
                }
                Some(Err(e)) => return Err(DeliveryError::transport(&self.url, e)),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn connection(chunks: Vec<&'static [u8]>) -> HttpConnection {
        let items: Vec<reqwest::Result<Bytes>> =
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))).collect();
        HttpConnection::new(
            "http://example.com/a".into(),
            ResponseHeaders::default(),
            stream::iter(items),
        )
    }

    #[tokio::test]
    async fn test_read_reslices_large_chunks() {
        let mut conn = connection(vec![b"abcdefgh", b"", b"ij"]);
        assert_eq!(conn.read(3).await.unwrap().unwrap(), "abc");
        assert_eq!(conn.read(3).await.unwrap().unwrap(), "def");
        assert_eq!(conn.read(3).await.unwrap().unwrap(), "gh");
        assert_eq!(conn.read(3).await.unwrap().unwrap(), "ij");
        assert!(conn.read(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_all_drains_remainder() {
        let mut conn = connection(vec![b"hello ", b"world"]);
        assert_eq!(conn.read(2).await.unwrap().unwrap(), "he");
        assert_eq!(conn.read_all().await.unwrap(), "llo world");
    }

    #[test]
    fn test_total_length_by_status() {
        assert_eq!(total_length(200, None, Some(1000), None), Some(1000));
        assert_eq!(
            total_length(206, Some("bytes 300-999/1000"), Some(700), Some(300)),
            Some(1000)
        );
        assert_eq!(total_length(206, None, Some(700), Some(300)), Some(1000));
        // The error body's length says nothing about the resource
        assert_eq!(
            total_length(416, Some("bytes */1000"), Some(49), Some(1000)),
            Some(1000)
        );
        assert_eq!(total_length(416, None, Some(49), Some(1000)), None);
    }

    /// Serve one raw HTTP response on a local port and return its base URL
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
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
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_416_reports_total_from_content_range() {
        let base = serve_once(
            "HTTP/1.1 416 Range Not Satisfiable\r\n\
             Content-Range: bytes */1000\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: 5\r\n\
             Connection: close\r\n\r\nnope!",
        )
        .await;
        let transport = HttpTransport::new(&ClientConfig::default()).unwrap();

        let conn = transport
            .open(FetchRequest::new(format!("{base}/file.bin")).with_range_start(1000))
            .await
            .unwrap();
        assert_eq!(conn.headers().status, 416);
        assert_eq!(conn.headers().total_length, Some(1000));
    }

    #[test]
    fn test_create_client_with_defaults() {
        assert!(create_client(&ClientConfig::default()).is_ok());
    }
}
