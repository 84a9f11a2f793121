//! HTTP client for framework servers, the isolate and external origins.

use crate::http::{empty, full, incoming, Body, DevRequest};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

/// Failure to reach an upstream.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid upstream URL {0}")]
    InvalidUri(String),
    #[error("failed to build upstream request: {0}")]
    Request(#[from] http::Error),
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read upstream body: {0}")]
    Body(#[from] hyper::Error),
    #[error("upstream answered {0}")]
    Status(StatusCode),
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn target_uri(origin: &str, path_and_query: &str) -> Result<Uri, ProxyError> {
    let url = format!("{}{}", origin.trim_end_matches('/'), path_and_query);
    url.parse().map_err(|_| ProxyError::InvalidUri(url))
}

fn set_host(headers: &mut HeaderMap, uri: &Uri) {
    if let Some(value) = uri
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    {
        headers.insert(HOST, value);
    }
}

/// Shared upstream client for plain and TLS origins.
#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl Upstream {
    pub fn new() -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        }
    }

    /// Send `req` to `origin`, replaying its buffered body.
    ///
    /// `change_origin` rewrites the `Host` header to the upstream's.
    pub async fn forward(
        &self,
        req: &DevRequest,
        origin: &str,
        change_origin: bool,
    ) -> Result<Response<Incoming>, ProxyError> {
        let uri = target_uri(origin, &req.url())?;
        let mut headers = req.headers.clone();
        strip_hop_by_hop(&mut headers);
        if change_origin {
            set_host(&mut headers, &uri);
        }

        let body = match &req.body {
            Some(bytes) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                full(bytes.clone())
            }
            None => empty(),
        };

        let mut request = Request::builder()
            .method(req.method.clone())
            .uri(uri)
            .body(body)?;
        *request.headers_mut() = headers;

        debug!("Proxying {} {} to {}", req.method, req.url(), origin);
        Ok(self.client.request(request).await?)
    }

    /// Proxy a protocol upgrade (WebSocket) to `origin` and splice both
    /// connections together once the upstream switches protocols.
    pub async fn upgrade(
        &self,
        mut req: Request<Incoming>,
        origin: &str,
        path_and_query: &str,
        change_origin: bool,
    ) -> Result<Response<Body>, ProxyError> {
        let uri = target_uri(origin, path_and_query)?;
        let mut headers = req.headers().clone();
        headers.remove(TRANSFER_ENCODING);
        if change_origin {
            set_host(&mut headers, &uri);
        }
        let mut request = Request::builder()
            .method(req.method().clone())
            .uri(uri)
            .body(empty())?;
        *request.headers_mut() = headers;

        let client_upgrade = hyper::upgrade::on(&mut req);
        let mut response = self.client.request(request).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(response.map(incoming));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => {
                    let mut client = TokioIo::new(client);
                    let mut upstream = TokioIo::new(upstream);
                    if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        debug!("Upgraded connection closed: {}", err);
                    }
                }
                Err(err) => warn!("Protocol upgrade failed: {}", err),
            }
        });

        let (mut parts, _) = response.into_parts();
        if !parts.headers.contains_key(CONNECTION) {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        }
        Ok(Response::from_parts(parts, empty()))
    }

    /// GET `url` and buffer a successful response.
    pub async fn get_bytes(&self, url: &str) -> Result<Bytes, ProxyError> {
        let uri: Uri = url.parse().map_err(|_| ProxyError::InvalidUri(url.to_string()))?;
        let mut request = Request::builder().uri(uri.clone()).body(empty())?;
        set_host(request.headers_mut(), &uri);

        let response = self.client.request(request).await?;
        if !response.status().is_success() {
            return Err(ProxyError::Status(response.status()));
        }
        Ok(response.into_body().collect().await?.to_bytes())
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}

/// GET `url` with a one-off client.
pub async fn fetch_bytes(url: &str) -> Result<Bytes, ProxyError> {
    Upstream::new().get_bytes(url).await
}
