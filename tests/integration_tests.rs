//! Integration tests for the dev proxy.

use edgedev::edge_functions::{BuildOutput, BundlerError, Declaration, EdgeBundler, EdgeFunction};
use edgedev::functions::{
    BuildResult, DirectoryLister, FunctionRoute, FunctionRuntime, FunctionSource, Invocation,
    InvocationError, InvocationEvent, LambdaResponse,
};
use edgedev::geo::{GeoError, GeoLookup, Geolocation};
use edgedev::http::{full, Body};
use edgedev::prelude::*;
use edgedev::runtime::GeoSettings;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Runtime answering every invocation with the function name and path.
#[derive(Default)]
struct EchoRuntime {
    routes: HashMap<String, Vec<FunctionRoute>>,
    events: Mutex<Vec<(String, InvocationEvent)>>,
}

#[async_trait]
impl FunctionRuntime for EchoRuntime {
    fn name(&self) -> &str {
        "js"
    }

    async fn build(&self, function: &FunctionSource) -> Result<BuildResult, InvocationError> {
        Ok(BuildResult {
            src_files: vec![function.main_file.clone()],
            routes: self.routes.get(&function.name).cloned().unwrap_or_default(),
            ..Default::default()
        })
    }

    async fn invoke(
        &self,
        function: &FunctionSource,
        invocation: Invocation,
    ) -> Result<Option<LambdaResponse>, InvocationError> {
        let body = format!("{} {}", function.name, invocation.event.path);
        self.events
            .lock()
            .push((function.name.clone(), invocation.event));
        Ok(Some(
            LambdaResponse::new(200)
                .header("content-type", "text/plain")
                .body(body),
        ))
    }
}

struct NoLookup;

#[async_trait]
impl GeoLookup for NoLookup {
    async fn lookup(&self) -> Result<Geolocation, GeoError> {
        Err(GeoError::Lookup("offline".to_string()))
    }
}

fn geo(project: &Path) -> Arc<GeoContext> {
    let settings = GeoSettings {
        mode: edgedev::geo::GeoMode::Mock,
        country: None,
    };
    Arc::new(GeoContext::new(
        GeoResolver::new(project, Box::new(NoLookup)),
        &settings,
        true,
    ))
}

struct Site {
    root: tempfile::TempDir,
}

impl Site {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("public")).unwrap();
        std::fs::create_dir_all(root.path().join("functions")).unwrap();
        std::fs::create_dir_all(root.path().join("edge")).unwrap();
        Self { root }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn file(&self, relative: &str, contents: &str) -> &Self {
        let path = self.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        self
    }

    fn config(&self) -> DevConfig {
        DevConfig::new()
            .host("127.0.0.1")
            .port(0)
            .project_dir(self.path())
            .dist_dir("public")
            .functions_dir("functions")
    }
}

async fn functions_server(
    config: &DevConfig,
    runtime: Arc<EchoRuntime>,
) -> (Arc<FunctionsRegistry>, Arc<FunctionsServer>) {
    let mut settings = FunctionsRegistrySettings::from_config(config);
    settings.watch = false;
    let registry = FunctionsRegistry::new(Arc::new(DirectoryLister), vec![runtime], settings);
    registry.scan().await.unwrap();
    let server = Arc::new(FunctionsServer::new(
        registry.clone(),
        AdapterSettings::from_config(config),
        geo(&config.project_dir),
    ));
    (registry, server)
}

async fn text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_function_invocation_through_router() {
    let site = Site::new();
    site.file("functions/hello.js", "export default () => {}");
    let config = site.config();
    let (_registry, functions) = functions_server(&config, Arc::new(EchoRuntime::default())).await;
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(NoRules),
        None,
        Some(functions),
    );

    let response = router
        .route(DevRequest::new(Method::GET, "/.netlify/functions/hello?name=x"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["server"], "Netlify");
    assert_eq!(text(response).await, "hello /.netlify/functions/hello");

    let missing = router
        .route(DevRequest::new(Method::GET, "/.netlify/functions/nope"))
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_custom_function_route() {
    let site = Site::new();
    site.file("functions/api.js", "export default () => {}");
    let config = site.config();
    let mut runtime = EchoRuntime::default();
    runtime
        .routes
        .insert("api".to_string(), vec![FunctionRoute::literal("/api/hello")]);
    let runtime = Arc::new(runtime);
    let (_registry, functions) = functions_server(&config, runtime.clone()).await;
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(NoRules),
        None,
        Some(functions),
    );

    let response = router.route(DevRequest::new(Method::GET, "/api/hello")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "api /api/hello");
    let events = runtime.events.lock();
    assert_eq!(events[0].1.route.as_deref(), Some("/api/hello"));
}

#[tokio::test]
async fn test_form_submission_goes_to_handler() {
    let site = Site::new();
    site.file("functions/submission-created.js", "export default () => {}");
    let config = site.config();
    let runtime = Arc::new(EchoRuntime::default());
    let (_registry, functions) = functions_server(&config, runtime.clone()).await;
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(NoRules),
        None,
        Some(functions),
    );

    let req = DevRequest::new(Method::POST, "/contact?ref=home")
        .header("content-type", "application/x-www-form-urlencoded")
        .body("name=Ada&email=ada%40example.com");
    let response = router.route(req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = runtime.events.lock();
    let (name, event) = &events[0];
    assert_eq!(name, "submission-created");
    let payload: serde_json::Value =
        serde_json::from_str(event.body.as_deref().unwrap_or_default()).unwrap();
    assert_eq!(payload["payload"]["email"], "ada@example.com");
    assert_eq!(event.path, "/contact");
    assert_eq!(event.query_string_parameters.get("ref").map(String::as_str), Some("home"));
}

/// Applies the rule whose `from` equals the request path.
struct ExactRules(Vec<Match>);

#[async_trait]
impl Rewriter for ExactRules {
    async fn rewrite(&self, req: &RuleRequest) -> Option<Match> {
        self.0.iter().find(|rule| rule.from == req.path).cloned()
    }
}

#[tokio::test]
async fn test_form_post_rewritten_to_function_by_rule() {
    let site = Site::new();
    site.file("functions/contact.js", "export default () => {}");
    site.file("functions/submission-created.js", "export default () => {}");
    let config = site.config();
    let runtime = Arc::new(EchoRuntime::default());
    let (_registry, functions) = functions_server(&config, runtime.clone()).await;
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(ExactRules(vec![
            Match::new("/contact", "/.netlify/functions/contact").status(200),
        ])),
        None,
        Some(functions),
    );

    let req = DevRequest::new(Method::POST, "/contact?ref=home")
        .header("content-type", "application/x-www-form-urlencoded")
        .body("name=Ada");
    let response = router.route(req).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "contact /contact");

    let events = runtime.events.lock();
    assert_eq!(events.len(), 1);
    let (name, event) = &events[0];
    assert_eq!(name, "contact");
    assert_eq!(event.query_string_parameters.get("ref").map(String::as_str), Some("home"));
}

#[tokio::test]
async fn test_rewrite_to_function_route_beats_static_file() {
    let site = Site::new();
    site.file("functions/api.js", "export default () => {}");
    site.file("functions/cached.js", "export default () => {}");
    site.file("public/api/docs.html", "static docs");
    site.file("public/api/cached.html", "static cached");
    let config = site.config();
    let mut runtime = EchoRuntime::default();
    runtime
        .routes
        .insert("api".to_string(), vec![FunctionRoute::literal("/api/docs")]);
    runtime.routes.insert(
        "cached".to_string(),
        vec![FunctionRoute::literal("/api/cached").prefer_static(true)],
    );
    let runtime = Arc::new(runtime);
    let (_registry, functions) = functions_server(&config, runtime.clone()).await;
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(ExactRules(vec![
            Match::new("/docs/page", "/api/docs").status(200),
            Match::new("/cached/page", "/api/cached").status(200),
        ])),
        None,
        Some(functions),
    );

    let response = router.route(DevRequest::new(Method::GET, "/docs/page?v=2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "api /docs/page");
    {
        let events = runtime.events.lock();
        assert_eq!(events[0].1.route.as_deref(), Some("/api/docs"));
        assert_eq!(events[0].1.query_string_parameters.get("v").map(String::as_str), Some("2"));
    }

    let response = router.route(DevRequest::new(Method::GET, "/cached/page")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "static cached");
    assert_eq!(runtime.events.lock().len(), 1);
}

#[tokio::test]
async fn test_forced_rewrite_over_static_file_reports_request_path() {
    let site = Site::new();
    site.file("functions/api.js", "export default () => {}");
    site.file("public/docs/page.html", "static page");
    let config = site.config();
    let mut runtime = EchoRuntime::default();
    runtime
        .routes
        .insert("api".to_string(), vec![FunctionRoute::literal("/api/docs")]);
    let runtime = Arc::new(runtime);
    let (_registry, functions) = functions_server(&config, runtime.clone()).await;
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(ExactRules(vec![
            Match::new("/docs/page", "/api/docs").status(200).forced(),
        ])),
        None,
        Some(functions),
    );

    let response = router.route(DevRequest::new(Method::GET, "/docs/page?tab=1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "api /docs/page");
    let events = runtime.events.lock();
    assert_eq!(events[0].1.query_string_parameters.get("tab").map(String::as_str), Some("1"));
}

/// Fake framework server: serves `/modern` and `/shadowed`, 404 otherwise.
async fn framework() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_string();
                    let (status, body) = match path.as_str() {
                        "/modern" | "/shadowed" => (StatusCode::OK, format!("framework {}", path)),
                        _ => (StatusCode::NOT_FOUND, "missing".to_string()),
                    };
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .header("content-length", body.len())
                            .body(full(body))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_rule_applied_when_framework_misses() {
    let site = Site::new();
    site.file("functions/hello.js", "export default () => {}");
    let config = site.config();
    let runtime = Arc::new(EchoRuntime::default());
    let (_registry, functions) = functions_server(&config, runtime.clone()).await;
    let mut settings = RouterSettings::from_config(&config);
    settings.framework = Some(framework().await);
    let router = Router::new(
        settings,
        Arc::new(ExactRules(vec![
            Match::new("/legacy", "/modern").status(200),
            Match::new("/shadowed", "/modern").status(200),
        ])),
        None,
        Some(functions),
    );

    let response = router.route(DevRequest::new(Method::GET, "/legacy")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "framework /modern");

    let response = router.route(DevRequest::new(Method::GET, "/shadowed")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "framework /shadowed");

    let response = router.route(DevRequest::new(Method::GET, "/elsewhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(runtime.events.lock().is_empty());
}

struct OneEdgeFunction;

#[async_trait]
impl EdgeBundler for OneEdgeFunction {
    async fn find(&self, directories: &[PathBuf]) -> Result<Vec<EdgeFunction>, BundlerError> {
        Ok(directories
            .iter()
            .map(|dir| EdgeFunction::new("greet", dir.join("greet.ts")))
            .collect())
    }

    async fn build(
        &self,
        _functions: &[EdgeFunction],
        _env: &HashMap<String, String>,
    ) -> Result<BuildOutput, BundlerError> {
        Ok(BuildOutput {
            success: true,
            ..Default::default()
        })
    }
}

/// Fake isolate: echoes the routed functions, or crashes on `/crash`.
async fn isolate() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    if req.uri().path() == "/crash" {
                        let body = r#"{"error":{"name":"TypeError","message":"boom","stack":"at greet (greet.ts:1)"}}"#;
                        let response = Response::builder()
                            .header("x-nf-uncaught-error", "1")
                            .header("content-length", body.len())
                            .body(full(body))
                            .unwrap();
                        return Ok::<_, Infallible>(response);
                    }
                    let functions = req
                        .headers()
                        .get("x-nf-edge-functions")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = format!("edge {}", functions);
                    Ok(Response::builder()
                        .header("content-length", body.len())
                        .body(full(body))
                        .unwrap())
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

async fn edge_router(site: &Site) -> Router {
    let mut config = site.config();
    config.edge_functions.directories = vec![PathBuf::from("edge")];
    config.edge_functions.declarations = vec![
        Declaration::new("greet", "/greet"),
        Declaration::new("greet", "/crash"),
    ];
    config.edge_functions.isolate_port = isolate().await;

    let registry = EdgeFunctionsRegistry::new(
        Arc::new(OneEdgeFunction),
        EdgeRegistrySettings::from_config(&config),
    );
    let proxy = EdgeFunctionsProxy::new(
        registry,
        EdgeProxySettings::from_config(&config),
        geo(site.path()),
    );
    Router::new(
        RouterSettings::from_config(&config),
        Arc::new(NoRules),
        Some(Arc::new(proxy)),
        None,
    )
}

#[tokio::test]
async fn test_edge_function_routing() {
    let site = Site::new();
    site.file("public/other.html", "static");
    let router = edge_router(&site).await;

    let response = router.route(DevRequest::new(Method::GET, "/greet")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "edge greet");

    let response = router.route(DevRequest::new(Method::GET, "/other.html")).await;
    assert_eq!(text(response).await, "static");
}

#[tokio::test]
async fn test_edge_function_crash_is_rendered() {
    let site = Site::new();
    let router = edge_router(&site).await;

    let response = router.route(DevRequest::new(Method::GET, "/crash")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(text(response).await, "TypeError: boom\n at greet (greet.ts:1)");

    let html = DevRequest::new(Method::GET, "/crash").header("accept", "text/html");
    let response = router.route(html).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text(response).await.contains("This edge function has crashed"));
}

/// Redirects `/old/*` to `/new/*`.
struct MovedRules;

#[async_trait]
impl Rewriter for MovedRules {
    async fn rewrite(&self, req: &RuleRequest) -> Option<Match> {
        let rest = req.path.strip_prefix("/old/")?;
        Some(Match::new("/old/*", format!("/new/{}", rest)).status(301))
    }
}

#[tokio::test]
async fn test_dev_server_end_to_end() {
    let site = Site::new();
    site.file("public/index.html", "home");
    let config = site.config();
    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(MovedRules),
        None,
        None,
    );
    let bound = DevServer::new(config, router).bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(bound.serve(async {
        let _ = stopped.await;
    }));

    let body = edgedev::proxy::fetch_bytes(&format!("http://{}/", addr)).await.unwrap();
    assert_eq!(&body[..], b"home");

    let client = edgedev::proxy::Upstream::new();
    let req = DevRequest::new(Method::GET, "/old/page").header("host", &addr.to_string());
    let response = client
        .forward(&req, &format!("http://{}", addr), false)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()["location"], "/new/page");

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}
