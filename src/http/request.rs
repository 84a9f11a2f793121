//! Buffered request passed through the routing pipeline.

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, HOST};
use hyper::{HeaderMap, Method};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// An inbound request whose body has already been buffered.
///
/// The router rewrites `path` and `query` in place while it resolves rules, and
/// replays `body` to whichever upstream finally serves the request.
#[derive(Debug, Clone)]
pub struct DevRequest {
    /// HTTP method.
    pub method: Method,
    /// Raw (still percent-encoded) path.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Buffered body, `None` for GET/HEAD/OPTIONS.
    pub body: Option<Bytes>,
    /// Peer address of the client connection.
    pub remote_addr: SocketAddr,
    /// `http` or `https`, depending on the listener that accepted the connection.
    pub scheme: &'static str,
}

impl DevRequest {
    /// Create a request for the given method and URL (`/path?query`).
    pub fn new(method: Method, url: &str) -> Self {
        let mut request = Self {
            method,
            path: "/".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: None,
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            scheme: "http",
        };
        request.set_url(url);
        request
    }

    /// Build from the head of a hyper request.
    pub fn from_parts(
        parts: &http::request::Parts,
        body: Option<Bytes>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Self {
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            body,
            remote_addr,
            scheme,
        }
    }

    /// Add a header to the request.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Path plus query string.
    pub fn url(&self) -> String {
        format!("{}{}", self.path, self.search())
    }

    /// Replace path and query from a `/path?query` string.
    pub fn set_url(&mut self, url: &str) {
        match url.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = Some(query.to_string()).filter(|q| !q.is_empty());
            }
            None => {
                self.path = url.to_string();
                self.query = None;
            }
        }
        if self.path.is_empty() {
            self.path = "/".to_string();
        }
    }

    /// `?query` or the empty string.
    pub fn search(&self) -> String {
        self.query
            .as_deref()
            .map(|q| format!("?{}", q))
            .unwrap_or_default()
    }

    /// Percent-decoded path.
    pub fn decoded_path(&self) -> String {
        percent_decode_str(&self.path).decode_utf8_lossy().into_owned()
    }

    /// Get a header value as a string.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Set a header, ignoring names or values that are not valid HTTP.
    pub fn set_header(&mut self, key: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    /// Remove a header, returning its value.
    pub fn take_header(&mut self, key: &str) -> Option<String> {
        self.headers
            .remove(key)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    /// Host header, defaulting to `localhost`.
    pub fn host(&self) -> String {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string()
    }

    /// Lowercased media type of the body, without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    /// Whether the body is an HTML form submission.
    pub fn is_form_submission(&self) -> bool {
        matches!(
            self.content_type().as_deref(),
            Some("application/x-www-form-urlencoded") | Some("multipart/form-data")
        )
    }

    /// Whether the client prefers an HTML rendering.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false)
    }

    /// Parsed `Cookie` header.
    pub fn cookies(&self) -> HashMap<String, String> {
        let mut cookies = HashMap::new();
        for value in self.headers.get_all(COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            for pair in value.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    cookies.insert(
                        name.trim().to_string(),
                        percent_decode_str(value).decode_utf8_lossy().into_owned(),
                    );
                }
            }
        }
        cookies
    }

    /// Whether the client asked for a protocol upgrade (WebSocket).
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key(hyper::header::UPGRADE)
    }
}

impl Default for DevRequest {
    fn default() -> Self {
        Self::new(Method::GET, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_url_splits_query() {
        let mut req = DevRequest::new(Method::GET, "/a/b?x=1&y=2");
        assert_eq!(req.path, "/a/b");
        assert_eq!(req.query.as_deref(), Some("x=1&y=2"));
        assert_eq!(req.url(), "/a/b?x=1&y=2");

        req.set_url("/c?");
        assert_eq!(req.path, "/c");
        assert_eq!(req.search(), "");
    }

    #[test]
    fn test_cookies_and_content_type() {
        let req = DevRequest::new(Method::POST, "/")
            .header("cookie", "nf_jwt=abc.def; nf_lang=de")
            .header("content-type", "Multipart/Form-Data; boundary=xyz");
        let cookies = req.cookies();
        assert_eq!(cookies.get("nf_jwt").map(String::as_str), Some("abc.def"));
        assert_eq!(cookies.get("nf_lang").map(String::as_str), Some("de"));
        assert_eq!(req.content_type().as_deref(), Some("multipart/form-data"));
        assert!(req.is_form_submission());
    }

    #[test]
    fn test_decoded_path() {
        let req = DevRequest::new(Method::GET, "/caf%C3%A9/a%20b");
        assert_eq!(req.decoded_path(), "/café/a b");
    }
}
