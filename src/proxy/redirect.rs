//! Applying a matched redirect or rewrite rule.

use crate::functions::default_function_name;
use crate::http::{headers, Body, DevRequest, DevResponse};
use crate::proxy::error_page::render_404;
use crate::proxy::jwt::{check_roles, RoleCheck, JWT_COOKIE, NOT_FOUND_PATH};
use crate::proxy::rewriter::Match;
use crate::proxy::router::{is_internal, ProxyOptions, Router, Target};
use crate::proxy::sign::sign_redirect;
use crate::proxy::static_files::get_static;
use futures::future::{BoxFuture, FutureExt};
use hyper::{Method, Response, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::{error, info, warn};

const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%');

fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH).to_string()
}

/// Absolute destination of `rule` for `req`.
///
/// Relative destinations resolve against the request's origin. A
/// destination without a query inherits the request's.
pub(crate) fn destination(rule: &Match, req: &DevRequest) -> Option<url::Url> {
    let base = url::Url::parse(&format!("{}://{}/", req.scheme, req.host())).ok()?;
    let mut dest = base.join(&rule.to).ok()?;
    if dest.query().is_none() {
        if let Some(query) = req.query.as_deref().filter(|query| !query.is_empty()) {
            dest.set_query(Some(query));
        }
    }
    Some(dest)
}

/// Path, query and fragment of `url`.
pub(crate) fn strip_origin(url: &url::Url) -> String {
    let mut stripped = url.path().to_string();
    if let Some(query) = url.query() {
        stripped.push('?');
        stripped.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        stripped.push('#');
        stripped.push_str(fragment);
    }
    stripped
}

fn search_of(url: &url::Url) -> String {
    url.query().map(|query| format!("?{}", query)).unwrap_or_default()
}

impl Router {
    /// Serve `req` according to `rule`, or plainly when there is none.
    ///
    /// `match_functions` lets the rewritten destination resolve to a
    /// function route.
    pub(crate) fn serve_redirect<'a>(
        &'a self,
        mut req: DevRequest,
        rule: Option<Match>,
        mut opts: ProxyOptions,
        match_functions: bool,
    ) -> BoxFuture<'a, Response<Body>> {
        async move {
            let Some(rule) = rule else {
                return self.web(req, opts).await;
            };
            opts.rule = None;
            let original_path = req.path.clone();
            let original_search = req.search();

            if rule.force404 {
                let body = render_404(&self.settings.dist_dir).await;
                return DevResponse::html(StatusCode::NOT_FOUND, body).into_response();
            }

            for (name, value) in &rule.proxy_headers {
                req.set_header(name, value);
            }

            if let Some(variable) = &rule.signing_secret {
                match self.settings.env.get(variable) {
                    Some(secret) => match sign_redirect(
                        secret,
                        self.settings.site.id.as_deref(),
                        self.settings.site.url.as_deref(),
                    ) {
                        Ok(token) => req.set_header(headers::SIGNATURE, &token),
                        Err(err) => error!("Could not sign redirect: {}", err),
                    },
                    None => warn!(
                        "Could not sign redirect because environment variable {} is not set",
                        variable
                    ),
                }
            }

            if default_function_name(&req.path).is_some() {
                return self.web(req, opts.to(Target::Functions)).await;
            }
            if let Some(url) = self.addon_url(&req) {
                return self.proxy_external(req, &url).await;
            }

            if let Some(roles) = rule.jwt_roles() {
                let token = req.cookies().remove(JWT_COOKIE);
                let now = chrono::Utc::now().timestamp();
                match check_roles(token.as_deref(), roles, &self.settings.jwt_role_path, now) {
                    RoleCheck::Allowed => {}
                    RoleCheck::Denied => {
                        req.set_url(NOT_FOUND_PATH);
                        return self.web(req, opts).await;
                    }
                    RoleCheck::Invalid => {
                        return DevResponse::text(
                            StatusCode::BAD_REQUEST,
                            "Invalid JWT provided. Please see logs for more info.",
                        )
                        .into_response();
                    }
                }
            }

            let dist = self.settings.dist_dir.clone();
            let static_file = get_static(&req.decoded_path(), &dist).await;
            if let Some(file) = &static_file {
                let search = req.search();
                req.set_url(&format!("{}{}", encode_path(file), search));
                if !rule.force {
                    opts.static_file = true;
                    return self.web(req, opts).await;
                }
            }

            let Some(dest) = destination(&rule, &req) else {
                warn!("Invalid rule destination {}", rule.to);
                return self.web(req, opts).await;
            };
            let mut dest_url = strip_origin(&dest);

            if rule.is_external() {
                if rule.is_redirect() {
                    dest_url = dest.to_string();
                } else {
                    if !rule.is_hidden_proxy() {
                        info!("Proxying to {}", dest);
                    }
                    return self.proxy_external(req, dest.as_str()).await;
                }
            }

            if rule.is_redirect() {
                let status = rule
                    .status
                    .and_then(|status| StatusCode::from_u16(status).ok())
                    .unwrap_or(StatusCode::MOVED_PERMANENTLY);
                return DevResponse::redirect(status, &dest_url).into_response();
            }

            if req.method == Method::POST
                && !is_internal(&req.path)
                && !is_internal(&dest_url)
                && req.is_form_submission()
            {
                return self.web(req, opts.to(Target::Functions)).await;
            }

            let dest_path = percent_decode_str(dest.path()).decode_utf8_lossy().into_owned();
            let dest_static = get_static(&dest_path, &dist).await;
            let function_match = match (&self.functions, match_functions) {
                (Some(functions), true) => {
                    let found = dest_static.is_some();
                    let has_static = || async move { found };
                    functions
                        .registry()
                        .get_function_for_url_path(&dest_url, req.method.as_str(), &has_static)
                        .await
                }
                _ => None,
            };

            let rewrite = rule.force
                || (static_file.is_none()
                    && ((!self.has_framework() && dest_static.is_some())
                        || is_internal(&dest_url)
                        || function_match.is_some()));
            if rewrite {
                match &dest_static {
                    Some(file) => req.set_url(&format!("{}{}", encode_path(file), search_of(&dest))),
                    None => req.set_url(&dest_url),
                }
                opts.status = rule.status.and_then(|status| StatusCode::from_u16(status).ok());
                info!("Rewrote URL to {}", req.url());

                if let Some(matched) = &function_match {
                    if let Some(func) = &matched.function {
                        req.set_header(headers::FUNCTION_NAME, func.name());
                    }
                    if let Some(route) = &matched.route {
                        req.set_header(headers::FUNCTION_ROUTE, &route.pattern);
                    }
                    req.set_header(headers::ORIGINAL_PATHNAME, &original_path);
                    req.set_header(headers::ORIGINAL_SEARCH, &original_search);
                    return self.web(req, opts.to(Target::Functions)).await;
                }
            }

            if let Some(origin) = self.image_origin(&req) {
                return self
                    .web(req, opts.to(Target::Origin { url: origin, change_origin: true }))
                    .await;
            }
            if let Some(url) = self.addon_url(&req) {
                return self.proxy_external(req, &url).await;
            }

            if !rewrite && self.has_framework() {
                opts.rule = Some(rule.forced());
            }
            self.web(req, opts).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rewriter::{RuleRequest, Rewriter};
    use crate::proxy::router::RouterSettings;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    /// Matches the first rule whose `from` prefixes the request path.
    struct PrefixRules(Vec<Match>);

    #[async_trait]
    impl Rewriter for PrefixRules {
        async fn rewrite(&self, req: &RuleRequest) -> Option<Match> {
            self.0
                .iter()
                .find(|rule| req.path.starts_with(&rule.from))
                .cloned()
        }
    }

    fn router(dist: &std::path::Path, rules: Vec<Match>) -> Router {
        Router::new(
            RouterSettings {
                dist_dir: dist.to_path_buf(),
                jwt_role_path: "app_metadata.roles".to_string(),
                ..Default::default()
            },
            Arc::new(PrefixRules(rules)),
            None,
            None,
        )
    }

    async fn text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn token(roles: &[&str], exp_offset: i64) -> String {
        let claims = json!({
            "exp": chrono::Utc::now().timestamp() + exp_offset,
            "app_metadata": { "roles": roles },
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"local")).unwrap()
    }

    fn admin_rule() -> Match {
        let mut rule = Match::new("/admin", "/admin/secret.html").status(200).forced();
        rule.exceptions.insert("JWT".to_string(), "admin,:editor".to_string());
        rule
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("admin")).unwrap();
        std::fs::write(dir.path().join("admin/secret.html"), "secret").unwrap();
        std::fs::write(dir.path().join("page.html"), "page").unwrap();
        std::fs::write(dir.path().join("other.html"), "other").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_jwt_role_gate() {
        let dist = site();
        let router = router(dist.path(), vec![admin_rule()]);

        let anonymous = router.route(DevRequest::new(Method::GET, "/admin")).await;
        assert_eq!(anonymous.status(), StatusCode::NOT_FOUND);

        let expired = DevRequest::new(Method::GET, "/admin")
            .header("cookie", &format!("nf_jwt={}", token(&["admin"], -60)));
        assert_eq!(router.route(expired).await.status(), StatusCode::NOT_FOUND);

        let wrong_role = DevRequest::new(Method::GET, "/admin")
            .header("cookie", &format!("nf_jwt={}", token(&["viewer"], 3600)));
        assert_eq!(router.route(wrong_role).await.status(), StatusCode::NOT_FOUND);

        let editor = DevRequest::new(Method::GET, "/admin")
            .header("cookie", &format!("nf_jwt={}", token(&["editor"], 3600)));
        let response = router.route(editor).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "secret");

        let garbage = DevRequest::new(Method::GET, "/admin").header("cookie", "nf_jwt=garbage");
        let response = router.route(garbage).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(response).await, "Invalid JWT provided. Please see logs for more info.");
    }

    #[tokio::test]
    async fn test_static_file_shadows_unforced_rewrite() {
        let dist = site();
        let router = router(dist.path(), vec![Match::new("/page", "/other.html").status(200)]);

        let response = router.route(DevRequest::new(Method::GET, "/page")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "page");

        let forced = router_with_forced(dist.path());
        let response = forced.route(DevRequest::new(Method::GET, "/page")).await;
        assert_eq!(text(response).await, "other");
    }

    fn router_with_forced(dist: &std::path::Path) -> Router {
        router(dist, vec![Match::new("/page", "/other.html").status(200).forced()])
    }

    #[tokio::test]
    async fn test_rewrite_to_static_file_keeps_query_and_etag() {
        let dist = site();
        let router = router(dist.path(), vec![Match::new("/elsewhere", "/other.html").status(200)]);

        let response = router
            .route(DevRequest::new(Method::GET, "/elsewhere?x=1"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("etag"));
        assert_eq!(text(response).await, "other");
    }

    #[tokio::test]
    async fn test_redirects() {
        let dist = site();
        let router = router(
            dist.path(),
            vec![
                Match::new("/old", "/new").status(301),
                Match::new("/away", "https://example.com/landing").status(302),
            ],
        );

        let response = router.route(DevRequest::new(Method::GET, "/old?a=b")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()["location"], "/new?a=b");
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert!(response.headers().get("etag").is_none());

        let response = router.route(DevRequest::new(Method::GET, "/away")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "https://example.com/landing");
    }

    #[tokio::test]
    async fn test_force404_uses_custom_page() {
        let dist = site();
        std::fs::write(dist.path().join("404.html"), "custom missing").unwrap();
        let mut rule = Match::new("/gone", "/page.html").status(404);
        rule.force404 = true;
        let router = router(dist.path(), vec![rule]);

        let response = router.route(DevRequest::new(Method::GET, "/gone")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(text(response).await, "custom missing");
    }

    #[tokio::test]
    async fn test_rewrite_status_is_applied() {
        let dist = site();
        let router = router(dist.path(), vec![Match::new("/missing", "/other.html").status(404)]);

        let response = router.route(DevRequest::new(Method::GET, "/missing/thing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(text(response).await, "other");
    }

    #[test]
    fn test_destination_inherits_query() {
        let req = DevRequest::new(Method::GET, "/search?q=rust").header("host", "localhost:8888");
        let dest = destination(&Match::new("/search", "/results?page=1"), &req).unwrap();
        assert_eq!(strip_origin(&dest), "/results?page=1");
        let dest = destination(&Match::new("/search", "/results"), &req).unwrap();
        assert_eq!(strip_origin(&dest), "/results?q=rust");
        assert_eq!(dest.host_str(), Some("localhost"));
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("/my file#1.html"), "/my%20file%231.html");
        assert_eq!(encode_path("/ok/path.html"), "/ok/path.html");
    }
}
