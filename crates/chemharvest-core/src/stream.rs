//! HTTP plumbing: shared client/runtime and failure classification.
//!
//! Uses async reqwest internally with a shared tokio runtime, but presents a
//! sync interface for the dispatcher's worker lanes.

use std::sync::LazyLock;
use std::time::Duration;

use futures_util::StreamExt;

use crate::error::CallError;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Stall detection while streaming a body: this long with no bytes = timeout
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Sent with every request; some public APIs throttle anonymous clients harder.
const USER_AGENT: &str = concat!("chemharvest/", env!("CARGO_PKG_VERSION"));

/// Error types for HTTP operations
#[derive(Debug)]
pub enum StreamError {
    /// HTTP error with optional status code (`None` = never got a response)
    Http {
        status: Option<u16>,
        message: String,
    },
    /// I/O error
    Io(std::io::Error),
    /// Response arrived but could not be decoded
    Decode(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Decode(m) => write!(f, "decode error: {m}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    /// Create HTTP error from reqwest error.
    ///
    /// The URL is stripped so API endpoints and keys do not leak into logs.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        if e.is_decode() {
            return Self::Decode(e.without_url().to_string());
        }
        Self::Http {
            status,
            message: e.without_url().to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            // No status: connect failure, reset, or timeout
            Self::Http { status: None, .. } => true,
            Self::Http {
                status: Some(s), ..
            } => matches!(*s, 408 | 425 | 429 | 500..=599),
            // Disk full is not retryable, timeout IS retryable
            Self::Io(e) => e.kind() != std::io::ErrorKind::StorageFull,
            Self::Decode(_) => false,
        }
    }

    /// HTTP status, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<StreamError> for CallError {
    fn from(e: StreamError) -> Self {
        if e.is_retryable() {
            CallError::Retryable(e.to_string())
        } else {
            CallError::Fatal(e.to_string())
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(8)
        .build()
        .expect("failed to build HTTP client")
});

/// Get shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Send a request and fail on non-2xx status.
async fn send(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, StreamError> {
    request
        .timeout(timeout)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(StreamError::from_reqwest)
}

/// Send a request and return the body as text.
pub fn send_text(request: reqwest::RequestBuilder, timeout: Duration) -> Result<String, StreamError> {
    SHARED_RUNTIME.handle().block_on(async {
        let response = send(request, timeout).await?;
        response.text().await.map_err(StreamError::from_reqwest)
    })
}

/// Send a request and decode the body as JSON.
pub fn send_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<serde_json::Value, StreamError> {
    let body = send_text(request, timeout)?;
    serde_json::from_str(&body).map_err(|e| StreamError::Decode(e.to_string()))
}

/// Send a request and collect the streamed body.
///
/// Unlike the whole-request `timeout`, a body that stops producing bytes for
/// [`READ_TIMEOUT`] fails early with a retryable `TimedOut`.
pub fn send_bytes(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Vec<u8>, StreamError> {
    SHARED_RUNTIME.handle().block_on(async {
        let response = send(request, timeout).await?;
        let mut body = Vec::with_capacity(
            response
                .content_length()
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0),
        );
        let mut stream = response.bytes_stream();
        loop {
            match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk.map_err(StreamError::from_reqwest)?),
                Ok(None) => break,
                Err(_) => {
                    return Err(StreamError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read timeout (no data)",
                    )));
                }
            }
        }
        Ok(body)
    })
}
