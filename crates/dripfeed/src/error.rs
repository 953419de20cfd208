use std::path::PathBuf;

use reqwest::StatusCode;

/// Errors produced by the fetch, cache and delivery layers.
///
/// A cache miss is not an error: lookups return `Option` instead.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("payload for {key} is {size} bytes, over the {limit} byte limit")]
    TooLarge { key: String, size: u64, limit: u64 },

    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status code {status} for {url}")]
    Status { url: String, status: StatusCode },

    #[error("storage failure at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{target} was cancelled")]
    Cancelled { target: String },

    #[error("timed out waiting for {target}")]
    Timeout { target: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("no such request or download: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    pub(crate) fn transport(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether a download that hit this error should be attempted again.
    ///
    /// Client errors (4xx) and a full disk are final: retrying would produce
    /// the same answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Http(_) | Self::Timeout { .. } => true,
            Self::Storage { source, .. } => source.kind() != std::io::ErrorKind::StorageFull,
            Self::Status { status, .. } => !status.is_client_error(),
            _ => false,
        }
    }
}

pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DeliveryError::transport("http://x/a", "reset").is_retryable());
        assert!(
            DeliveryError::storage("/tmp/a", std::io::Error::other("write failed")).is_retryable()
        );
        assert!(
            !DeliveryError::storage(
                "/tmp/a",
                std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left")
            )
            .is_retryable()
        );
        assert!(
            DeliveryError::Status {
                url: "http://x/a".into(),
                status: StatusCode::BAD_GATEWAY,
            }
            .is_retryable()
        );
        assert!(
            !DeliveryError::Status {
                url: "http://x/a".into(),
                status: StatusCode::NOT_FOUND,
            }
            .is_retryable()
        );
        assert!(
            !DeliveryError::TooLarge {
                key: "k".into(),
                size: 10,
                limit: 5,
            }
            .is_retryable()
        );
        assert!(
            !DeliveryError::Cancelled {
                target: "k".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_messages_carry_origin() {
        let err = DeliveryError::transport("http://x/a", "connection reset");
        assert_eq!(
            err.to_string(),
            "transport failure for http://x/a: connection reset"
        );
        let err = DeliveryError::TooLarge {
            key: "http://x/big".into(),
            size: 2048,
            limit: 1024,
        };
        assert!(err.to_string().contains("http://x/big"));
    }
}
