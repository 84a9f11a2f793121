//! Boxed body type and bounded request-body buffering.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use std::time::Duration;

/// Error type carried by every body in the proxy.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for all responses produced or forwarded by the proxy.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// A body holding the given bytes.
pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// An empty body.
pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Box a body received from hyper (client response or server request).
pub fn incoming(body: Incoming) -> Body {
    body.map_err(|e| Box::new(e) as BoxError).boxed_unsync()
}

/// Failure to buffer a request body within its bounds.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("request body exceeds the limit of {0} bytes")]
    TooLarge(usize),
    #[error("timed out after {0:?} while reading the request body")]
    TimedOut(Duration),
    #[error("failed to read request body: {0}")]
    Read(BoxError),
}

impl BufferError {
    /// Status code returned to the client for this failure.
    pub fn status(&self) -> hyper::StatusCode {
        match self {
            BufferError::TooLarge(_) => hyper::StatusCode::PAYLOAD_TOO_LARGE,
            BufferError::TimedOut(_) => hyper::StatusCode::REQUEST_TIMEOUT,
            BufferError::Read(_) => hyper::StatusCode::BAD_REQUEST,
        }
    }
}

/// Collect a body into memory, bounded by a byte count and a deadline.
pub async fn buffer_body<B>(body: B, limit: usize, timeout: Duration) -> Result<Bytes, BufferError>
where
    B: hyper::body::Body + Send,
    B::Error: Into<BoxError>,
{
    let limited = Limited::new(body, limit);
    match tokio::time::timeout(timeout, limited.collect()).await {
        Err(_) => Err(BufferError::TimedOut(timeout)),
        Ok(Err(err)) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(BufferError::TooLarge(limit))
        }
        Ok(Err(err)) => Err(BufferError::Read(err)),
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
    }
}
