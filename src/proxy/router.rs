//! Per-request routing pipeline.
//!
//! Every request walks the same precedence as production: image transforms,
//! edge functions, functions, addon URLs, redirect and rewrite rules, and
//! finally the framework server (or the publish directory). Responses then
//! get the post-processing the CDN would apply: alternative-path retries,
//! ETags, custom headers and edge function crash pages.

use crate::edge_functions::EdgeFunctionsProxy;
use crate::functions::FunctionsServer;
use crate::http::{buffer_body, full, headers, incoming, Body, DevRequest, DevResponse};
use crate::proxy::error_page::{format_edge_error, render_error_template};
use crate::proxy::etag::{matches_etag, weak_etag, EtagPolicy};
use crate::proxy::header_rules::{HeaderRule, HeaderRules};
use crate::proxy::rewriter::{is_redirect_status, Match, Rewriter, RuleRequest};
use crate::proxy::static_files::{alternative_paths_for, get_static, StaticFiles};
use crate::proxy::upstream::Upstream;
use crate::runtime::{DevConfig, SiteInfo};
use futures::future::{BoxFuture, FutureExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{
    HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
    LOCATION, SERVER,
};
use hyper::{Method, Request, Response, StatusCode};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const EDGE_PROXY_ERROR: &str =
    "There was an error with an Edge Function. Please check the terminal for more details.";
const PROXY_ERROR: &str = "Could not proxy request.";

pub(crate) fn is_internal(url: &str) -> bool {
    url.starts_with("/.netlify/")
}

/// Where a request is finally served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// The in-process functions adapter.
    Functions,
    /// The in-process static file server.
    Static,
    /// An HTTP origin: the framework server, the isolate or an external URL.
    Origin { url: String, change_origin: bool },
}

/// Per-request state carried through the pipeline.
#[derive(Debug, Clone)]
pub(crate) struct ProxyOptions {
    pub target: Target,
    /// Rule applied when the target answers 404 or 403.
    pub rule: Option<Match>,
    /// The request was rewritten to a file in the publish directory.
    pub static_file: bool,
    /// Status forced by a rewrite rule.
    pub status: Option<StatusCode>,
    pub etag: EtagPolicy,
    /// The request goes to the edge function isolate.
    pub edge: bool,
}

impl ProxyOptions {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            rule: None,
            static_file: false,
            status: None,
            etag: EtagPolicy::Never,
            edge: false,
        }
    }

    pub fn to(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

/// Settings the router runs with.
#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    /// Publish directory.
    pub dist_dir: PathBuf,
    /// Origin of the framework dev server, if there is one.
    pub framework: Option<String>,
    /// Addon name to origin URL.
    pub addons: BTreeMap<String, String>,
    /// Origin of the image transformation service.
    pub image_proxy: Option<String>,
    pub jwt_role_path: String,
    /// Environment holding rule signing secrets.
    pub env: HashMap<String, String>,
    pub site: SiteInfo,
    /// Country forced by configuration.
    pub country: Option<String>,
    pub max_body_size: usize,
    pub body_timeout: Duration,
    pub headers: Vec<HeaderRule>,
}

impl RouterSettings {
    pub fn from_config(config: &DevConfig) -> Self {
        Self {
            dist_dir: config.dist_path(),
            framework: config.framework.as_ref().map(|framework| framework.origin()),
            addons: config.addons.clone(),
            image_proxy: config.image_proxy.clone(),
            jwt_role_path: config.jwt.role_path.clone(),
            env: config.env.clone(),
            site: config.site.clone(),
            country: config.geo.country.clone(),
            max_body_size: config.max_body_size,
            body_timeout: config.body_timeout(),
            headers: config.headers.clone(),
        }
    }
}

/// Routes requests to edge functions, functions, rules and the framework.
pub struct Router {
    pub(crate) settings: RouterSettings,
    pub(crate) rewriter: Arc<dyn Rewriter>,
    pub(crate) edge: Option<Arc<EdgeFunctionsProxy>>,
    pub(crate) functions: Option<Arc<FunctionsServer>>,
    pub(crate) static_files: StaticFiles,
    pub(crate) upstream: Upstream,
    header_rules: HeaderRules,
}

impl Router {
    pub fn new(
        settings: RouterSettings,
        rewriter: Arc<dyn Rewriter>,
        edge: Option<Arc<EdgeFunctionsProxy>>,
        functions: Option<Arc<FunctionsServer>>,
    ) -> Self {
        Self {
            header_rules: HeaderRules::new(&settings.headers),
            static_files: StaticFiles::new(settings.dist_dir.clone()),
            upstream: Upstream::new(),
            settings,
            rewriter,
            edge,
            functions,
        }
    }

    /// Serve a request accepted by one of the listeners.
    pub async fn serve(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Response<Body> {
        if req.headers().contains_key(hyper::header::UPGRADE) {
            return self.upgrade(req, remote_addr, scheme).await;
        }

        let (parts, body) = req.into_parts();
        let body = if matches!(parts.method, Method::GET | Method::HEAD | Method::OPTIONS) {
            None
        } else {
            match buffer_body(body, self.settings.max_body_size, self.settings.body_timeout).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!("Rejecting {} {}: {}", parts.method, parts.uri, err);
                    return DevResponse::text(err.status(), err.to_string()).into_response();
                }
            }
        };

        let req = DevRequest::from_parts(&parts, body, remote_addr, scheme);
        self.route(req).await
    }

    /// Run a buffered request through the pipeline.
    pub async fn route(&self, mut req: DevRequest) -> Response<Body> {
        if let Some(origin) = self.image_origin(&req) {
            return self.web(req, ProxyOptions::new(Target::Origin { url: origin, change_origin: true })).await;
        }

        if let Some(edge) = &self.edge {
            if let Some(origin) = edge.handle(&mut req).await {
                let mut opts = ProxyOptions::new(Target::Origin {
                    url: origin,
                    change_origin: false,
                });
                opts.edge = true;
                return self.web(req, opts).await;
            }
        }

        if let Some(functions) = &self.functions {
            let dist = self.settings.dist_dir.clone();
            let path = req.decoded_path();
            let has_static = || {
                let dist = dist.clone();
                let path = path.clone();
                async move { get_static(&path, &dist).await.is_some() }
            };
            let matched = functions
                .registry()
                .get_function_for_url_path(&req.url(), req.method.as_str(), &has_static)
                .await;
            if let Some(matched) = matched {
                if let Some(func) = &matched.function {
                    req.set_header(headers::FUNCTION_NAME, func.name());
                }
                if let Some(route) = &matched.route {
                    req.set_header(headers::FUNCTION_ROUTE, &route.pattern);
                }
                return self.web(req, ProxyOptions::new(Target::Functions)).await;
            }
        }

        if let Some(url) = self.addon_url(&req) {
            return self.proxy_external(req, &url).await;
        }

        let rule_request = RuleRequest::from_request(&req, self.settings.country.as_deref());
        if let Some(rule) = self.rewriter.rewrite(&rule_request).await {
            let mut opts = ProxyOptions::new(self.default_target());
            opts.etag = EtagPolicy::ExceptRedirects;
            return self.serve_redirect(req, Some(rule), opts, true).await;
        }

        let mut opts = ProxyOptions::new(self.default_target());
        opts.etag = EtagPolicy::Success;
        if req.method == Method::POST && !is_internal(&req.path) && req.is_form_submission() {
            if let Some(functions) = &self.functions {
                if functions.registry().form_handler().await.is_some() {
                    return self.web(req, opts.to(Target::Functions)).await;
                }
            }
        }
        self.web(req, opts).await
    }

    pub(crate) fn default_target(&self) -> Target {
        match &self.settings.framework {
            Some(url) => Target::Origin {
                url: url.clone(),
                change_origin: false,
            },
            None => Target::Static,
        }
    }

    pub(crate) fn has_framework(&self) -> bool {
        self.settings.framework.is_some()
    }

    pub(crate) fn image_origin(&self, req: &DevRequest) -> Option<String> {
        let origin = self.settings.image_proxy.as_ref()?;
        (req.path == "/.netlify/images" || req.path.starts_with("/.netlify/images/"))
            .then(|| origin.clone())
    }

    /// The external URL an `/.netlify/<addon>/<rest>` request maps to.
    pub(crate) fn addon_url(&self, req: &DevRequest) -> Option<String> {
        let url = req.url();
        let rest = url.strip_prefix("/.netlify/")?;
        let (addon, tail) = rest.split_once('/')?;
        let origin = self.settings.addons.get(addon)?;
        Some(format!("{}/{}", origin.trim_end_matches('/'), tail))
    }

    /// Reverse-proxy to an absolute URL, bypassing post-processing.
    pub(crate) async fn proxy_external(&self, mut req: DevRequest, url: &str) -> Response<Body> {
        let dest = match url::Url::parse(url) {
            Ok(dest) => dest,
            Err(err) => {
                warn!("Cannot proxy to {}: {}", url, err);
                return proxy_error(false);
            }
        };
        let origin = dest.origin().ascii_serialization();
        let mut path = dest.path().to_string();
        if let Some(query) = dest.query() {
            path.push('?');
            path.push_str(query);
        }
        req.set_url(&path);
        match self.upstream.forward(&req, &origin, true).await {
            Ok(response) => response.map(incoming),
            Err(err) => {
                error!("Error proxying to {}: {}", url, err);
                proxy_error(false)
            }
        }
    }

    /// Send `req` to its target and post-process the response.
    ///
    /// A 404 or 403 is retried on the CDN's alternative paths, then on the
    /// rule kept in `opts`; a redirect from a rewritten static file is
    /// followed.
    pub(crate) fn web<'a>(
        &'a self,
        mut req: DevRequest,
        mut opts: ProxyOptions,
    ) -> BoxFuture<'a, Response<Body>> {
        async move {
            let request_id = match req.get_header(headers::REQUEST_ID) {
                Some(id) => id.to_string(),
                None => uuid::Uuid::new_v4().to_string(),
            };
            req.set_header(headers::REQUEST_ID, &request_id);
            req.set_header("x-forwarded-for", &req.remote_addr.ip().to_string());

            let original_url = req.url();
            let search = req.search();
            let mut alternatives: VecDeque<String> = if opts.target == Target::Functions {
                VecDeque::new()
            } else {
                alternative_paths_for(&req.path)
                    .into_iter()
                    .map(|path| format!("{}{}", path, search))
                    .collect()
            };

            loop {
                let response = match self.dispatch(&req, &opts.target).await {
                    Ok(response) => response,
                    Err(err) => {
                        error!("Error proxying {}: {}", req.url(), err);
                        return proxy_error(opts.edge);
                    }
                };

                let status = response.status();
                if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
                    if let Some(alternative) = alternatives.pop_front() {
                        debug!("Retrying {} as {}", original_url, alternative);
                        req.set_url(&alternative);
                        continue;
                    }
                    if let Some(rule) = opts.rule.take() {
                        req.set_url(&original_url);
                        return self.serve_redirect(req, Some(rule), opts, false).await;
                    }
                }

                if opts.static_file && is_redirect_status(status.as_u16()) {
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    if let Some(location) = location {
                        req.set_url(&location);
                        opts.static_file = false;
                        return self.serve_redirect(req, None, opts, false).await;
                    }
                }

                return self.finish(&req, &opts, response, &request_id).await;
            }
        }
        .boxed()
    }

    async fn dispatch(
        &self,
        req: &DevRequest,
        target: &Target,
    ) -> Result<Response<Body>, crate::proxy::ProxyError> {
        match target {
            Target::Functions => match &self.functions {
                Some(functions) => Ok(functions.handle(req.clone()).await),
                None => Ok(DevResponse::text(StatusCode::NOT_FOUND, "Function not found...").into_response()),
            },
            Target::Static => Ok(self.static_files.serve(req).await),
            Target::Origin { url, change_origin } => Ok(self
                .upstream
                .forward(req, url, *change_origin)
                .await?
                .map(incoming)),
        }
    }

    fn apply_header_rules(&self, path: &str, headers: &mut hyper::HeaderMap) {
        for (name, value) in self.header_rules.for_path(path) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
    }

    async fn finish(
        &self,
        req: &DevRequest,
        opts: &ProxyOptions,
        response: Response<Body>,
        request_id: &str,
    ) -> Response<Body> {
        let (mut parts, body) = response.into_parts();
        parts.headers.insert(SERVER, HeaderValue::from_static("Netlify"));
        if let Ok(value) = HeaderValue::from_str(request_id) {
            parts.headers.insert(headers::REQUEST_ID, value);
        }
        let mut status = opts.status.unwrap_or(parts.status);

        // Streamed responses pass through untouched.
        if !parts.headers.contains_key(CONTENT_LENGTH) {
            self.apply_header_rules(&req.path, &mut parts.headers);
            parts.status = status;
            return Response::from_parts(parts, body);
        }

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!("Error reading response for {}: {}", req.url(), err);
                return proxy_error(opts.edge);
            }
        };

        if opts.etag.applies(status.as_u16()) {
            let etag = weak_etag(&bytes);
            if req
                .get_header(IF_NONE_MATCH.as_str())
                .map_or(false, |value| matches_etag(value, &etag))
            {
                status = StatusCode::NOT_MODIFIED;
            }
            if let Ok(value) = HeaderValue::from_str(&etag) {
                parts.headers.insert(ETAG, value);
            }
        }
        self.apply_header_rules(&req.path, &mut parts.headers);

        let uncaught = parts
            .headers
            .get(headers::UNCAUGHT_ERROR)
            .map_or(false, |value| value == "1");
        if opts.edge && uncaught {
            let accepts_html = req.accepts_html();
            let encoding = parts
                .headers
                .get(CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok());
            let formatted = format_edge_error(&bytes, encoding, accepts_html).unwrap_or_else(|err| {
                warn!("Could not read edge function error: {}", err);
                String::from_utf8_lossy(&bytes).into_owned()
            });
            let (content_type, body) = if accepts_html {
                ("text/html; charset=utf-8", render_error_template(&formatted, "edge function"))
            } else {
                ("text/plain; charset=utf-8", formatted)
            };
            parts.headers.remove(CONTENT_ENCODING);
            parts.headers.remove(ETAG);
            parts.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            parts.status = StatusCode::INTERNAL_SERVER_ERROR;
            return Response::from_parts(parts, full(body));
        }

        parts.status = status;
        if status == StatusCode::NOT_MODIFIED {
            parts.headers.remove(CONTENT_LENGTH);
            return Response::from_parts(parts, full(bytes::Bytes::new()));
        }
        Response::from_parts(parts, full(bytes))
    }

    /// Proxy a protocol upgrade to the rule's external origin or the framework.
    async fn upgrade(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Response<Body> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let mut candidate = DevRequest::new(req.method().clone(), &path_and_query);
        candidate.headers = req.headers().clone();
        candidate.remote_addr = remote_addr;
        candidate.scheme = scheme;

        let rule_request = RuleRequest::from_request(&candidate, self.settings.country.as_deref());
        let rule = self.rewriter.rewrite(&rule_request).await;
        let (origin, path, change_origin) = match rule {
            Some(rule) if !rule.force404 && rule.is_external() => {
                match crate::proxy::redirect::destination(&rule, &candidate) {
                    Some(dest) => (
                        dest.origin().ascii_serialization(),
                        crate::proxy::redirect::strip_origin(&dest),
                        true,
                    ),
                    None => return proxy_error(false),
                }
            }
            _ => match &self.settings.framework {
                Some(framework) => (framework.clone(), path_and_query, false),
                None => {
                    return DevResponse::text(StatusCode::NOT_FOUND, "Not Found").into_response();
                }
            },
        };

        match self.upstream.upgrade(req, &origin, &path, change_origin).await {
            Ok(response) => response,
            Err(err) => {
                error!("Error proxying upgrade to {}: {}", origin, err);
                proxy_error(false)
            }
        }
    }
}

/// Generic 500 for transport failures.
pub(crate) fn proxy_error(edge: bool) -> Response<Body> {
    let message = if edge { EDGE_PROXY_ERROR } else { PROXY_ERROR };
    DevResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", "text/plain")
        .body(message)
        .into_response()
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("settings", &self.settings)
            .field("edge", &self.edge.is_some())
            .field("functions", &self.functions.is_some())
            .finish()
    }
}
