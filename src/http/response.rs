//! Response builder used for locally generated responses.

use crate::http::body::{full, Body};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use tracing::warn;

/// A fully buffered response built by the proxy itself (error pages,
/// redirects, function results) before it is turned into a hyper response.
#[derive(Debug, Clone)]
pub struct DevResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl DevResponse {
    /// Create an empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Create a response from a numeric status, falling back to 500 when invalid.
    pub fn with_code(code: u16) -> Self {
        let status = StatusCode::from_u16(code).unwrap_or_else(|_| {
            warn!(
                "Invalid status code {}, falling back to 500 Internal Server Error",
                code
            );
            StatusCode::INTERNAL_SERVER_ERROR
        });
        Self::new(status)
    }

    /// Create a plain-text response.
    pub fn text(status: StatusCode, content: impl Into<String>) -> Self {
        Self::new(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(content.into())
    }

    /// Create an HTML response.
    pub fn html(status: StatusCode, content: impl Into<String>) -> Self {
        Self::new(status)
            .header("content-type", "text/html; charset=utf-8")
            .body(content.into())
    }

    /// Create a JSON response.
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status)
            .header("content-type", "application/json")
            .body(body))
    }

    /// Create a redirect to `location`.
    pub fn redirect(status: StatusCode, location: &str) -> Self {
        let mut response = Self::text(status, format!("Redirecting to {}", location));
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers.insert(LOCATION, value);
        }
        response
            .headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    /// Add a header, ignoring names or values that are not valid HTTP.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Set the response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get the body as text.
    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Convert into a hyper response with an explicit content length.
    pub fn into_response(self) -> Response<Body> {
        let mut headers = self.headers;
        if !headers.contains_key(CONTENT_TYPE) && !self.body.is_empty() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));

        let mut response = Response::new(full(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

impl From<DevResponse> for Response<Body> {
    fn from(response: DevResponse) -> Self {
        response.into_response()
    }
}
