//! Static files from the publish directory.

use crate::functions::default_function_name;
use crate::http::{Body, BoxError, DevRequest, DevResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HeaderValue, CACHE_CONTROL};
use hyper::{Request, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::debug;

const ASSET_EXTENSIONS: &[&str] = &[
    "html", "htm", "png", "jpg", "js", "css", "svg", "gif", "ico", "woff", "woff2",
];

fn has_asset_extension(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or(path);
    last.rsplit_once('.')
        .map_or(false, |(_, ext)| ASSET_EXTENSIONS.contains(&ext))
}

/// Other paths the CDN would try for `path` before giving up.
pub fn alternative_paths_for(path: &str) -> Vec<String> {
    if default_function_name(path).is_some() {
        return Vec::new();
    }

    let mut paths = Vec::new();
    if let Some(stem) = path.strip_suffix('/') {
        if !stem.is_empty() {
            paths.push(format!("{}.html", stem));
            paths.push(format!("{}.htm", stem));
        }
        paths.push(format!("{}index.html", path));
        paths.push(format!("{}index.htm", path));
    } else if !has_asset_extension(path) {
        for suffix in [".html", ".htm", "/index.html", "/index.htm"] {
            paths.push(format!("{}{}", path, suffix));
        }
    }
    paths
}

/// Join a URL path onto `root`, refusing anything that escapes it.
fn resolve(root: &Path, url_path: &str) -> Option<PathBuf> {
    let relative = Path::new(url_path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(relative))
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// The static file serving decoded `pathname`, trying its alternatives.
///
/// Returns the matched file as a URL path relative to `dist`.
pub async fn get_static(pathname: &str, dist: &Path) -> Option<String> {
    let candidates = std::iter::once(pathname.to_string()).chain(alternative_paths_for(pathname));
    for candidate in candidates {
        let Some(file) = resolve(dist, &candidate) else {
            continue;
        };
        if is_file(&file).await {
            let relative = file.strip_prefix(dist).ok()?;
            let url: Vec<String> = relative
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            return Some(format!("/{}", url.join("/")));
        }
    }
    None
}

/// Serves the publish directory when no framework server is running.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    dir: ServeDir,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // Directories 404 so the router retries the pretty-URL alternatives.
        let dir = ServeDir::new(&root).append_index_html_on_directories(false);
        Self { root, dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve the file at the request path, or 404.
    pub async fn serve(&self, req: &DevRequest) -> Response<Body> {
        let mut request = match Request::builder()
            .method(req.method.clone())
            .uri(req.url())
            .body(Empty::<Bytes>::new())
        {
            Ok(request) => request,
            Err(err) => {
                debug!("Cannot serve {} from the publish directory: {}", req.url(), err);
                return DevResponse::text(StatusCode::BAD_REQUEST, "Bad Request").into_response();
            }
        };
        *request.headers_mut() = req.headers.clone();

        let response = match self.dir.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let (mut parts, body) = response.into_parts();
        if parts.status.is_success() {
            parts.headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=0, must-revalidate"),
            );
        }
        Response::from_parts(parts, body.map_err(|err| Box::new(err) as BoxError).boxed_unsync())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;
    use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn test_alternative_paths() {
        assert_eq!(alternative_paths_for("/"), vec!["/index.html", "/index.htm"]);
        assert_eq!(
            alternative_paths_for("/docs/"),
            vec!["/docs.html", "/docs.htm", "/docs/index.html", "/docs/index.htm"]
        );
        assert_eq!(
            alternative_paths_for("/about"),
            vec!["/about.html", "/about.htm", "/about/index.html", "/about/index.htm"]
        );
        assert!(alternative_paths_for("/app.js").is_empty());
        assert!(alternative_paths_for("/.netlify/functions/hello").is_empty());
    }

    #[tokio::test]
    async fn test_get_static_uses_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("blog")).unwrap();
        std::fs::write(dir.path().join("blog/post-1.html"), "post").unwrap();
        std::fs::write(dir.path().join("index.html"), "home").unwrap();

        assert_eq!(get_static("/blog/post-1", dir.path()).await.as_deref(), Some("/blog/post-1.html"));
        assert_eq!(get_static("/", dir.path()).await.as_deref(), Some("/index.html"));
        assert_eq!(get_static("/missing", dir.path()).await, None);
        assert_eq!(get_static("/../etc/passwd", dir.path()).await, None);
    }

    #[tokio::test]
    async fn test_serve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();
        std::fs::write(dir.path().join("data.webmanifest"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        let files = StaticFiles::new(dir.path());

        let response = files.serve(&DevRequest::new(Method::GET, "/style.css")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/css");
        assert_eq!(response.headers()["content-length"], "6");
        assert_eq!(response.headers()["cache-control"], "public, max-age=0, must-revalidate");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"body{}");

        let head = files.serve(&DevRequest::new(Method::HEAD, "/style.css")).await;
        assert_eq!(head.status(), StatusCode::OK);
        assert!(head.into_body().collect().await.unwrap().to_bytes().is_empty());

        let manifest = files.serve(&DevRequest::new(Method::GET, "/data.webmanifest")).await;
        assert_ne!(manifest.headers()["content-type"], "application/octet-stream");

        let missing = files.serve(&DevRequest::new(Method::GET, "/nope.css")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let directory = files.serve(&DevRequest::new(Method::GET, "/docs")).await;
        assert_eq!(directory.status(), StatusCode::NOT_FOUND);

        let escape = files.serve(&DevRequest::new(Method::GET, "/%2E%2E/secret")).await;
        assert_eq!(escape.status(), StatusCode::NOT_FOUND);
    }
}
