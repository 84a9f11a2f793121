//! Edge functions registry: discovery, coalesced builds, route manifest and live reload.

use crate::edge_functions::bundler::{BuildOutput, BundlerError, EdgeBundler, EdgeFunction};
use crate::edge_functions::coalesce::BuildCoalescer;
use crate::edge_functions::declaration::{merge_declarations, Declaration, FunctionConfig, Tier};
use crate::edge_functions::graph::dependency_index;
use crate::edge_functions::manifest::{generate_manifest, FunctionManifestConfig, Manifest, RouteMatch, RouteSummary};
use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::runtime::DevConfig;
use crate::watch::{spawn_batch_consumer, ChangeBatch, DebouncedWatcher, WatchError, DEFAULT_DEBOUNCE};
use hyper::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MISSING_PATH_WARNING: &str =
    "Edge function is not accessible because it does not have a path configured.";
const PATHS_TYPO_WARNING: &str = "Unknown 'paths' configuration property. Did you mean 'path'?";

/// Static settings of the registry.
#[derive(Debug, Clone, Default)]
pub struct EdgeRegistrySettings {
    /// Project root, watched for changes.
    pub project_dir: PathBuf,
    /// User function directories.
    pub directories: Vec<PathBuf>,
    /// Framework/integration function directories.
    pub internal_directories: Vec<PathBuf>,
    /// Declarations from the configuration file.
    pub declarations: Vec<Declaration>,
    /// Configuration file re-read on change.
    pub config_path: Option<PathBuf>,
    /// Deploy-time manifest produced by frameworks.
    pub deploy_manifest: Option<PathBuf>,
    /// Directory excluded from watching (build output).
    pub serve_dir: Option<PathBuf>,
    /// Environment handed to the bundler.
    pub env: HashMap<String, String>,
}

impl EdgeRegistrySettings {
    pub fn from_config(config: &DevConfig) -> Self {
        let edge = &config.edge_functions;
        Self {
            project_dir: config.project_dir.clone(),
            directories: edge.directories.iter().map(|d| config.resolve(d)).collect(),
            internal_directories: edge
                .internal_directories
                .iter()
                .map(|d| config.resolve(d))
                .collect(),
            declarations: edge.declarations.clone(),
            config_path: edge.config_path.as_ref().map(|p| config.resolve(p)),
            deploy_manifest: edge.deploy_manifest.as_ref().map(|p| config.resolve(p)),
            serve_dir: Some(config.project_dir.join(".netlify")),
            env: config.env.clone(),
        }
    }
}

/// Metadata the isolate needs to run the matched functions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvocationMetadata {
    pub function_config: BTreeMap<String, FunctionManifestConfig>,
    pub req_routes: Vec<usize>,
    pub routes: Vec<RouteSummary>,
}

/// A matched request.
#[derive(Debug, Clone, Default)]
pub struct EdgeMatch {
    pub function_names: Vec<String>,
    pub metadata: InvocationMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct DeployManifest {
    #[serde(default)]
    functions: Vec<Declaration>,
}

#[derive(Default)]
struct EdgeState {
    functions: Vec<EdgeFunction>,
    config_declarations: Vec<Declaration>,
    manifest: Manifest,
    function_paths: HashMap<PathBuf, String>,
    dependency_paths: HashMap<PathBuf, BTreeSet<String>>,
    warnings: HashMap<String, Vec<String>>,
    build_error: Option<String>,
}

#[derive(Default)]
struct Watchers {
    watchers: Vec<DebouncedWatcher>,
    consumers: Vec<JoinHandle<()>>,
}

/// Owns edge function discovery, builds and routing.
///
/// The manifest always reflects the last successful build. A failed build
/// keeps the previous manifest and records a sticky error until a later build
/// succeeds.
pub struct EdgeFunctionsRegistry {
    bundler: Arc<dyn EdgeBundler>,
    settings: EdgeRegistrySettings,
    state: RwLock<EdgeState>,
    coalescer: BuildCoalescer<(), BundlerError>,
    initialized: OnceCell<Result<(), BundlerError>>,
    events: EventBus,
    watchers: parking_lot::Mutex<Watchers>,
}

impl EdgeFunctionsRegistry {
    /// Create a registry. Nothing is scanned until [`initialize`](Self::initialize).
    pub fn new(bundler: Arc<dyn EdgeBundler>, settings: EdgeRegistrySettings) -> Arc<Self> {
        let state = EdgeState {
            config_declarations: settings.declarations.clone(),
            ..Default::default()
        };
        Arc::new(Self {
            bundler,
            settings,
            state: RwLock::new(state),
            coalescer: BuildCoalescer::new(),
            initialized: OnceCell::new(),
            events: EventBus::new("edge function"),
            watchers: parking_lot::Mutex::new(Watchers::default()),
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Scan and build once. Later calls return the first outcome.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), BundlerError> {
        self.initialized
            .get_or_init(|| async {
                if let Err(err) = self.scan().await {
                    self.events.emit(
                        LifecycleEvent::new(EventKind::BuildError).message(err.to_string()),
                    );
                    return Err(err);
                }
                let result = self.build().await;
                match &result {
                    Ok(()) => {
                        let state = self.state.read().await;
                        for function in &state.functions {
                            self.events.emit(
                                LifecycleEvent::new(EventKind::Loaded)
                                    .subject(function.name.clone())
                                    .warnings(state.warnings.get(&function.name).cloned().unwrap_or_default()),
                            );
                        }
                    }
                    Err(err) => self.events.emit(
                        LifecycleEvent::new(EventKind::BuildError).message(err.to_string()),
                    ),
                }
                result
            })
            .await
            .clone()
    }

    /// Build the current function set, coalescing with any build in flight.
    pub async fn build(self: &Arc<Self>) -> Result<(), BundlerError> {
        let this = Arc::clone(self);
        self.coalescer
            .trigger(move || {
                let this = this.clone();
                async move { this.run_build().await }
            })
            .await
    }

    /// Whether the last build failed.
    pub async fn has_build_error(&self) -> bool {
        self.state.read().await.build_error.is_some()
    }

    /// Names of the currently known functions.
    pub async fn function_names(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .functions
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }

    /// Look a function up by name.
    pub async fn function_by_name(&self, name: &str) -> Option<EdgeFunction> {
        self.state
            .read()
            .await
            .functions
            .iter()
            .find(|f| f.name == name)
            .cloned()
    }

    /// Look a function up by its entry file.
    pub async fn function_by_path(&self, path: &Path) -> Option<EdgeFunction> {
        let state = self.state.read().await;
        let name = state.function_paths.get(path)?;
        state.functions.iter().find(|f| &f.name == name).cloned()
    }

    /// Functions importing `path`, directly or transitively.
    pub async fn dependents_of(&self, path: &Path) -> BTreeSet<String> {
        self.state
            .read()
            .await
            .dependency_paths
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Warnings produced for a function by the last successful build.
    pub async fn warnings_for(&self, name: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .warnings
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Match a request against the manifest of the last successful build.
    pub async fn match_url_path(&self, path: &str, method: &Method, headers: &HeaderMap) -> Option<EdgeMatch> {
        let state = self.state.read().await;
        let RouteMatch {
            function_names,
            route_indexes,
        } = state.manifest.match_request(path, method, headers);
        if function_names.is_empty() {
            return None;
        }

        let function_config = function_names
            .iter()
            .filter_map(|name| {
                state
                    .manifest
                    .function_config
                    .get(name)
                    .map(|config| (name.clone(), config.clone()))
            })
            .collect();

        Some(EdgeMatch {
            function_names,
            metadata: InvocationMetadata {
                function_config,
                req_routes: route_indexes,
                routes: state.manifest.route_summaries(),
            },
        })
    }

    /// Replace the configuration-file declarations and rebuild if anything changed.
    pub async fn update_config_declarations(self: &Arc<Self>, declarations: Vec<Declaration>) {
        {
            let mut state = self.state.write().await;
            if state.config_declarations == declarations {
                return;
            }
            state.config_declarations = declarations;
        }
        info!("Reloading edge functions after configuration change");
        self.reload(None).await;
    }

    /// Rescan the function directories, rebuilding when functions were added or deleted.
    ///
    /// Returns `true` when the set of functions changed.
    pub async fn check_for_added_or_deleted(self: &Arc<Self>) -> bool {
        let (added, deleted) = match self.scan().await {
            Ok(diff) => diff,
            Err(err) => {
                self.events
                    .emit(LifecycleEvent::new(EventKind::BuildError).message(err.to_string()));
                return false;
            }
        };
        if added.is_empty() && deleted.is_empty() {
            return false;
        }

        match self.build().await {
            Ok(()) => {
                for function in &deleted {
                    self.events
                        .emit(LifecycleEvent::new(EventKind::Removed).subject(function.name.clone()));
                }
                for function in &added {
                    let warnings = self.warnings_for(&function.name).await;
                    self.events.emit(
                        LifecycleEvent::new(EventKind::Loaded)
                            .subject(function.name.clone())
                            .warnings(warnings),
                    );
                }
            }
            Err(err) => self
                .events
                .emit(LifecycleEvent::new(EventKind::BuildError).message(err.to_string())),
        }
        true
    }

    /// React to changed files: rebuild when one of them is a function entry or
    /// dependency, or unconditionally when the last build failed.
    pub async fn handle_file_change(self: &Arc<Self>, paths: &[PathBuf]) {
        let (affected, retry) = {
            let state = self.state.read().await;
            let mut affected = BTreeSet::new();
            for path in paths {
                if let Some(name) = state.function_paths.get(path) {
                    affected.insert(name.clone());
                }
                if let Some(names) = state.dependency_paths.get(path) {
                    affected.extend(names.iter().cloned());
                }
            }
            (affected, state.build_error.is_some())
        };

        if affected.is_empty() && !retry {
            debug!("Ignoring change to files outside the edge function graph");
            return;
        }
        self.reload(Some(affected)).await;
    }

    async fn reload(self: &Arc<Self>, affected: Option<BTreeSet<String>>) {
        let names: Vec<String> = match affected {
            Some(names) if !names.is_empty() => names.into_iter().collect(),
            _ => Vec::new(),
        };
        let emit_all = |kind: EventKind| {
            if names.is_empty() {
                self.events.emit(LifecycleEvent::new(kind));
            }
            for name in &names {
                self.events.emit(LifecycleEvent::new(kind).subject(name.clone()));
            }
        };

        emit_all(EventKind::Reloading);
        match self.build().await {
            Ok(()) => emit_all(EventKind::Reloaded),
            Err(err) => self
                .events
                .emit(LifecycleEvent::new(EventKind::BuildError).message(err.to_string())),
        }
    }

    /// Watch the configuration file and the project directory.
    pub fn watch(self: &Arc<Self>) -> Result<(), WatchError> {
        let mut watchers = self.watchers.lock();

        if let Some(config_path) = self.settings.config_path.clone() {
            let (mut watcher, rx) = DebouncedWatcher::new(DEFAULT_DEBOUNCE, Vec::new())?;
            watcher.watch(&config_path, false)?;
            let this = Arc::clone(self);
            watchers.consumers.push(spawn_batch_consumer(rx, move |_batch| {
                let this = this.clone();
                async move { this.reload_config_file().await }
            }));
            watchers.watchers.push(watcher);
        }

        let ignored = self.settings.serve_dir.iter().cloned().collect();
        let (mut watcher, rx) = DebouncedWatcher::new(DEFAULT_DEBOUNCE, ignored)?;
        watcher.watch(&self.settings.project_dir, true)?;
        let this = Arc::clone(self);
        watchers
            .consumers
            .push(spawn_batch_consumer(rx, move |batch: ChangeBatch| {
                let this = this.clone();
                async move {
                    if !this.check_for_added_or_deleted().await {
                        this.handle_file_change(&batch).await;
                    }
                }
            }));
        watchers.watchers.push(watcher);
        Ok(())
    }

    /// Stop all watchers.
    pub fn close(&self) {
        let mut watchers = self.watchers.lock();
        for consumer in watchers.consumers.drain(..) {
            consumer.abort();
        }
        watchers.watchers.clear();
    }

    async fn reload_config_file(self: &Arc<Self>) {
        let Some(path) = &self.settings.config_path else {
            return;
        };
        match DevConfig::from_file(path) {
            Ok(config) => {
                self.update_config_declarations(config.edge_functions.declarations)
                    .await
            }
            Err(err) => warn!("Could not reload edge function declarations: {}", err),
        }
    }

    /// Find functions on disk and diff against the known set by (name, path).
    async fn scan(&self) -> Result<(Vec<EdgeFunction>, Vec<EdgeFunction>), BundlerError> {
        let mut functions = Vec::new();
        for mut function in self.bundler.find(&self.settings.internal_directories).await? {
            function.tier = Tier::Internal;
            functions.push(function);
        }
        functions.extend(self.bundler.find(&self.settings.directories).await?);

        let mut state = self.state.write().await;
        let key = |f: &EdgeFunction| (f.name.clone(), f.path.clone());
        let old: HashSet<_> = state.functions.iter().map(key).collect();
        let new: HashSet<_> = functions.iter().map(key).collect();

        let added = functions
            .iter()
            .filter(|f| !old.contains(&key(f)))
            .cloned()
            .collect();
        let deleted = state
            .functions
            .iter()
            .filter(|f| !new.contains(&key(f)))
            .cloned()
            .collect();

        state.functions = functions;
        Ok((added, deleted))
    }

    async fn read_deploy_declarations(&self) -> Vec<Declaration> {
        let Some(path) = &self.settings.deploy_manifest else {
            return Vec::new();
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<DeployManifest>(&bytes) {
                Ok(manifest) => manifest.functions,
                Err(err) => {
                    warn!("Ignoring invalid deploy manifest {}: {}", path.display(), err);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    async fn run_build(&self) -> Result<(), BundlerError> {
        let (functions, config_declarations) = {
            let state = self.state.read().await;
            (state.functions.clone(), state.config_declarations.clone())
        };

        if functions.is_empty() {
            let mut state = self.state.write().await;
            state.manifest = Manifest::default();
            state.function_paths.clear();
            state.dependency_paths.clear();
            state.warnings.clear();
            state.build_error = None;
            return Ok(());
        }

        let mut env = self.settings.env.clone();
        env.insert("DENO_REGION".to_string(), "local".to_string());

        let output = match self.bundler.build(&functions, &env).await {
            Ok(output) if output.success => output,
            Ok(_) => {
                return self
                    .fail_build(BundlerError::Build("Edge functions build failed".to_string()))
                    .await
            }
            Err(err) => return self.fail_build(err).await,
        };

        let deploy_declarations = self.read_deploy_declarations().await;
        self.apply_build(functions, &config_declarations, &deploy_declarations, output)
            .await;
        Ok(())
    }

    async fn fail_build(&self, err: BundlerError) -> Result<(), BundlerError> {
        self.state.write().await.build_error = Some(err.to_string());
        Err(err)
    }

    async fn apply_build(
        &self,
        functions: Vec<EdgeFunction>,
        config_declarations: &[Declaration],
        deploy_declarations: &[Declaration],
        output: BuildOutput,
    ) {
        let (internal_configs, user_configs): (HashMap<String, FunctionConfig>, HashMap<String, FunctionConfig>) = output
            .function_configs
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .partition(|(name, _)| {
                functions
                    .iter()
                    .any(|f| &f.name == name && f.tier == Tier::Internal)
            });

        let declarations = merge_declarations(
            config_declarations,
            &user_configs,
            &internal_configs,
            deploy_declarations,
        );
        let (manifest, unrouted) =
            generate_manifest(&functions, &declarations, &output.function_configs);

        let mut warnings: HashMap<String, Vec<String>> = HashMap::new();
        for name in unrouted {
            warnings
                .entry(name)
                .or_default()
                .push(MISSING_PATH_WARNING.to_string());
        }
        for (name, config) in &output.function_configs {
            if config.paths.is_some() {
                warnings
                    .entry(name.clone())
                    .or_default()
                    .push(PATHS_TYPO_WARNING.to_string());
            }
        }

        let dependency_paths = output
            .graph
            .as_ref()
            .map(|graph| dependency_index(graph, &functions))
            .unwrap_or_default();
        let function_paths = functions
            .iter()
            .map(|f| (f.path.clone(), f.name.clone()))
            .collect();

        let mut state = self.state.write().await;
        state.manifest = manifest;
        state.function_paths = function_paths;
        state.dependency_paths = dependency_paths;
        state.warnings = warnings;
        state.build_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge_functions::graph::ModuleGraph;
    use async_trait::async_trait;
    use hyper::header::HeaderValue;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bundler serving a mutable in-memory function list.
    #[derive(Default)]
    struct FakeBundler {
        functions: Mutex<Vec<EdgeFunction>>,
        configs: Mutex<HashMap<String, FunctionConfig>>,
        graph: Mutex<Option<ModuleGraph>>,
        fail: Mutex<bool>,
        builds: AtomicUsize,
    }

    #[async_trait]
    impl EdgeBundler for FakeBundler {
        async fn find(&self, directories: &[PathBuf]) -> Result<Vec<EdgeFunction>, BundlerError> {
            Ok(self
                .functions
                .lock()
                .iter()
                .filter(|f| directories.iter().any(|d| f.path.starts_with(d)))
                .cloned()
                .collect())
        }

        async fn build(
            &self,
            _functions: &[EdgeFunction],
            env: &HashMap<String, String>,
        ) -> Result<BuildOutput, BundlerError> {
            assert_eq!(env.get("DENO_REGION").map(String::as_str), Some("local"));
            self.builds.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock() {
                return Err(BundlerError::Build("syntax error".to_string()));
            }
            Ok(BuildOutput {
                success: true,
                function_configs: self.configs.lock().clone(),
                graph: self.graph.lock().clone(),
            })
        }
    }

    fn settings(declarations: Vec<Declaration>) -> EdgeRegistrySettings {
        EdgeRegistrySettings {
            project_dir: PathBuf::from("/site"),
            directories: vec![PathBuf::from("/site/edge")],
            internal_directories: vec![PathBuf::from("/site/.netlify/edge")],
            declarations,
            ..Default::default()
        }
    }

    fn bundler_with(functions: &[(&str, &str)]) -> Arc<FakeBundler> {
        let bundler = FakeBundler::default();
        *bundler.functions.lock() = functions
            .iter()
            .map(|(name, path)| EdgeFunction::new(*name, *path))
            .collect();
        Arc::new(bundler)
    }

    #[tokio::test]
    async fn test_initialize_builds_manifest() {
        let bundler = bundler_with(&[("geo", "/site/edge/geo.ts"), ("lonely", "/site/edge/lonely.ts")]);
        let registry = EdgeFunctionsRegistry::new(
            bundler.clone(),
            settings(vec![Declaration::new("geo", "/geo/*")]),
        );

        registry.initialize().await.unwrap();
        registry.initialize().await.unwrap();
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 1);

        let matched = registry
            .match_url_path("/geo/berlin", &Method::GET, &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(matched.function_names, vec!["geo"]);
        assert_eq!(matched.metadata.req_routes, vec![0]);
        assert!(registry
            .match_url_path("/other", &Method::GET, &HeaderMap::new())
            .await
            .is_none());

        assert_eq!(registry.warnings_for("lonely").await, vec![MISSING_PATH_WARNING]);
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_manifest() {
        let bundler = bundler_with(&[("geo", "/site/edge/geo.ts")]);
        let registry = EdgeFunctionsRegistry::new(
            bundler.clone(),
            settings(vec![Declaration::new("geo", "/geo")]),
        );
        registry.initialize().await.unwrap();

        *bundler.fail.lock() = true;
        assert!(registry.build().await.is_err());
        assert!(registry.has_build_error().await);
        assert!(registry
            .match_url_path("/geo", &Method::GET, &HeaderMap::new())
            .await
            .is_some());

        *bundler.fail.lock() = false;
        registry.build().await.unwrap();
        assert!(!registry.has_build_error().await);
    }

    #[tokio::test]
    async fn test_file_change_rebuilds_only_for_dependencies() {
        let bundler = bundler_with(&[("geo", "/site/edge/geo.ts")]);
        *bundler.graph.lock() = Some(ModuleGraph::from_edges([
            ("file:///site/edge/geo.ts", vec!["file:///site/lib/util.ts"]),
            ("file:///site/lib/util.ts", vec![]),
        ]));
        let registry = EdgeFunctionsRegistry::new(
            bundler.clone(),
            settings(vec![Declaration::new("geo", "/geo")]),
        );
        registry.initialize().await.unwrap();
        let mut events = registry.subscribe();

        registry
            .handle_file_change(&[PathBuf::from("/site/README.md")])
            .await;
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 1);

        registry
            .handle_file_change(&[PathBuf::from("/site/lib/util.ts")])
            .await;
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 2);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Reloading);
        let reloaded = events.recv().await.unwrap();
        assert_eq!(reloaded.kind, EventKind::Reloaded);
        assert_eq!(reloaded.subject.as_deref(), Some("geo"));

        // After a failure any change retries.
        *bundler.fail.lock() = true;
        registry
            .handle_file_change(&[PathBuf::from("/site/edge/geo.ts")])
            .await;
        *bundler.fail.lock() = false;
        registry
            .handle_file_change(&[PathBuf::from("/site/README.md")])
            .await;
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 4);
        assert!(!registry.has_build_error().await);
    }

    #[tokio::test]
    async fn test_added_and_deleted_functions() {
        let bundler = bundler_with(&[("a", "/site/edge/a.ts")]);
        let registry = EdgeFunctionsRegistry::new(bundler.clone(), settings(Vec::new()));
        registry.initialize().await.unwrap();
        let mut events = registry.subscribe();

        assert!(!registry.check_for_added_or_deleted().await);

        *bundler.functions.lock() = vec![EdgeFunction::new("b", "/site/edge/b.ts")];
        assert!(registry.check_for_added_or_deleted().await);

        let removed = events.recv().await.unwrap();
        assert_eq!((removed.kind, removed.subject.as_deref()), (EventKind::Removed, Some("a")));
        let loaded = events.recv().await.unwrap();
        assert_eq!((loaded.kind, loaded.subject.as_deref()), (EventKind::Loaded, Some("b")));
        assert_eq!(loaded.warnings, vec![MISSING_PATH_WARNING]);
    }

    #[tokio::test]
    async fn test_empty_function_set_skips_bundler() {
        let bundler = bundler_with(&[]);
        let registry = EdgeFunctionsRegistry::new(bundler.clone(), settings(Vec::new()));
        registry.initialize().await.unwrap();
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_in_source_config_and_header_predicates() {
        let bundler = bundler_with(&[("beta", "/site/edge/beta.ts"), ("ssr", "/site/.netlify/edge/ssr.ts")]);
        bundler.configs.lock().insert(
            "beta".to_string(),
            serde_json::from_str(r#"{"path": "/*", "header": {"x-beta": true}, "paths": ["/x"]}"#).unwrap(),
        );
        bundler.configs.lock().insert(
            "ssr".to_string(),
            serde_json::from_str(r#"{"path": "/*", "excludedPath": "/assets/*"}"#).unwrap(),
        );
        let registry = EdgeFunctionsRegistry::new(bundler, settings(Vec::new()));
        registry.initialize().await.unwrap();

        let plain = registry
            .match_url_path("/page", &Method::GET, &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(plain.function_names, vec!["ssr"]);

        let mut headers = HeaderMap::new();
        headers.insert("x-beta", HeaderValue::from_static("1"));
        let beta = registry
            .match_url_path("/page", &Method::GET, &headers)
            .await
            .unwrap();
        assert_eq!(beta.function_names, vec!["beta", "ssr"]);

        assert!(registry
            .match_url_path("/assets/app.js", &Method::GET, &HeaderMap::new())
            .await
            .is_none());
        assert_eq!(registry.warnings_for("beta").await, vec![PATHS_TYPO_WARNING]);
    }

    #[tokio::test]
    async fn test_config_declaration_update_rebuilds() {
        let bundler = bundler_with(&[("geo", "/site/edge/geo.ts")]);
        let registry = EdgeFunctionsRegistry::new(bundler.clone(), settings(Vec::new()));
        registry.initialize().await.unwrap();
        assert!(registry
            .match_url_path("/geo", &Method::GET, &HeaderMap::new())
            .await
            .is_none());

        registry
            .update_config_declarations(vec![Declaration::new("geo", "/geo")])
            .await;
        assert!(registry
            .match_url_path("/geo", &Method::GET, &HeaderMap::new())
            .await
            .is_some());

        registry
            .update_config_declarations(vec![Declaration::new("geo", "/geo")])
            .await;
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 2);
        assert_eq!(
            registry.function_by_path(Path::new("/site/edge/geo.ts")).await.map(|f| f.name),
            Some("geo".to_string())
        );
    }
}
