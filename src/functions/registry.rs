//! Registry of local functions.
//!
//! Scans the function directories, keeps one [`LocalFunction`] per name and
//! rebuilds functions when their sources change.

use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::functions::function::{LocalFunction, SrcFilesDiff};
use crate::functions::manifest::PackagingManifest;
use crate::functions::packaging::{unzip_function, FunctionLister, PackagingError};
use crate::functions::route::FunctionRoute;
use crate::functions::runtime::{BuildResult, FunctionRuntime};
use crate::runtime::{BlobsContext, DevConfig, FunctionsSettings};
use crate::watch::{spawn_batch_consumer, DebouncedWatcher, DEFAULT_DEBOUNCE};
use futures::future::{join_all, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Entry point written by the packager into zipped functions.
const ZIP_ENTRY_POINT: &str = "___netlify-entry-point.mjs";

const FORM_HANDLERS: [&str; 2] = ["submission-created", "submission-created-background"];

/// Name of the function addressed by a `/.netlify/functions/<name>` or
/// `/.netlify/builders/<name>` path.
pub fn default_function_name(path: &str) -> Option<&str> {
    let rest = path
        .strip_prefix("/.netlify/functions/")
        .or_else(|| path.strip_prefix("/.netlify/builders/"))?;
    let name = rest.split('/').next().unwrap_or_default();
    (!name.is_empty()).then_some(name)
}

/// Settings the registry runs with.
#[derive(Debug, Clone, Default)]
pub struct FunctionsRegistrySettings {
    pub project_dir: PathBuf,
    pub functions: FunctionsSettings,
    pub blobs: Option<BlobsContext>,
    pub debug: bool,
    /// Watch directories and sources for changes.
    pub watch: bool,
}

impl FunctionsRegistrySettings {
    pub fn from_config(config: &DevConfig) -> Self {
        Self {
            project_dir: config.project_dir.clone(),
            functions: config.functions.clone(),
            blobs: config.blobs.clone(),
            debug: config.debug,
            watch: true,
        }
    }
}

/// Result of resolving a URL to a function.
///
/// `function` is `None` when the URL names a function that does not exist.
#[derive(Clone)]
pub struct FunctionMatch {
    pub function: Option<Arc<LocalFunction>>,
    pub route: Option<FunctionRoute>,
}

/// Names added and removed by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

struct Watched {
    watcher: DebouncedWatcher,
    consumer: JoinHandle<()>,
}

impl Watched {
    fn stop(self) {
        self.consumer.abort();
        drop(self.watcher);
    }
}

/// Registry of the functions found in the function directories.
pub struct FunctionsRegistry {
    lister: Arc<dyn FunctionLister>,
    runtimes: HashMap<String, Arc<dyn FunctionRuntime>>,
    settings: FunctionsRegistrySettings,
    manifest: OnceCell<Option<PackagingManifest>>,
    functions: RwLock<IndexMap<String, Arc<LocalFunction>>>,
    function_watchers: Mutex<HashMap<String, Watched>>,
    directory_watchers: Mutex<HashMap<PathBuf, Watched>>,
    scan_lock: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl FunctionsRegistry {
    pub fn new(
        lister: Arc<dyn FunctionLister>,
        runtimes: Vec<Arc<dyn FunctionRuntime>>,
        settings: FunctionsRegistrySettings,
    ) -> Arc<Self> {
        let runtimes = runtimes
            .into_iter()
            .map(|runtime| (runtime.name().to_string(), runtime))
            .collect();
        Arc::new(Self {
            lister,
            runtimes,
            settings,
            manifest: OnceCell::new(),
            functions: RwLock::new(IndexMap::new()),
            function_watchers: Mutex::new(HashMap::new()),
            directory_watchers: Mutex::new(HashMap::new()),
            scan_lock: tokio::sync::Mutex::new(()),
            events: EventBus::new("function"),
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Where files uploaded through forms are stored.
    pub fn uploads_dir(&self) -> PathBuf {
        self.settings.project_dir.join(".netlify").join("form-uploads")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.settings.project_dir.join(path)
        }
    }

    /// Function directories, lowest precedence first.
    pub fn directories(&self) -> Vec<PathBuf> {
        let functions = &self.settings.functions;
        functions
            .internal_directory
            .iter()
            .chain(functions.directories.iter())
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| self.resolve(dir))
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<LocalFunction>> {
        self.functions.read().await.get(name).cloned()
    }

    /// Registered function names, in registration order.
    pub async fn names(&self) -> Vec<String> {
        self.functions.read().await.keys().cloned().collect()
    }

    async fn is_current(&self, func: &Arc<LocalFunction>) -> bool {
        self.get(func.name())
            .await
            .map_or(false, |current| Arc::ptr_eq(&current, func))
    }

    /// The form submission handler, if one exists.
    pub async fn form_handler(&self) -> Option<Arc<LocalFunction>> {
        let functions = self.functions.read().await;
        let handlers: Vec<_> = FORM_HANDLERS
            .iter()
            .filter_map(|name| functions.get(*name).cloned())
            .collect();
        if handlers.len() > 1 {
            warn!(
                "Detected both {} and {} functions, only {} will be used for form submissions",
                FORM_HANDLERS[0], FORM_HANDLERS[1], FORM_HANDLERS[0]
            );
        }
        handlers.into_iter().next()
    }

    /// Resolve a URL to a function.
    ///
    /// Default `/.netlify/functions/<name>` URLs resolve by name; other paths
    /// are matched against the custom routes of every function in
    /// registration order. `has_static` reports whether a static file exists
    /// at the path, for routes that yield to static files.
    pub async fn get_function_for_url_path<F, Fut>(
        &self,
        url: &str,
        method: &str,
        has_static: &F,
    ) -> Option<FunctionMatch>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let path = url.split('?').next().unwrap_or(url);

        if let Some(name) = default_function_name(path) {
            let Some(func) = self.get(name).await else {
                return Some(FunctionMatch {
                    function: None,
                    route: None,
                });
            };
            let routes = func.routes().await;
            if routes.is_empty() {
                return Some(FunctionMatch {
                    function: Some(func),
                    route: None,
                });
            }
            let patterns: Vec<_> = routes.iter().map(|r| r.pattern.as_str()).collect();
            warn!(
                "Function {} cannot be invoked on {}, because the function has the following URL paths defined: {}",
                name,
                path,
                patterns.join(", ")
            );
            return None;
        }

        let functions: Vec<_> = self.functions.read().await.values().cloned().collect();
        for func in functions {
            if let Some(route) = func.match_url_path(path, method, has_static).await {
                return Some(FunctionMatch {
                    function: Some(func),
                    route: Some(route),
                });
            }
        }
        None
    }

    /// Scan the function directories and reconcile the registered set.
    ///
    /// Functions whose `(name, main file)` disappeared are removed; new
    /// names are registered and built. When a name exists in several
    /// directories the one in the later directory wins.
    pub async fn scan(self: &Arc<Self>) -> Result<ScanSummary, PackagingError> {
        let _scanning = self.scan_lock.lock().await;

        let directories = self.directories();
        if directories.is_empty() {
            return Ok(ScanSummary::default());
        }
        for dir in &directories {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!("Could not create functions directory {}: {}", dir.display(), err);
            }
        }

        let descriptors = match self
            .lister
            .list_functions(&directories, &self.settings.functions)
            .await
        {
            Ok(descriptors) => descriptors,
            Err(err) => {
                self.events
                    .emit(LifecycleEvent::new(EventKind::BuildError).message(err.to_string()));
                return Err(err);
            }
        };

        let deleted: Vec<String> = self
            .functions
            .read()
            .await
            .values()
            .filter(|func| {
                !descriptors
                    .iter()
                    .any(|d| d.name == func.name() && &d.main_file == func.main_file())
            })
            .map(|func| func.name().to_string())
            .collect();
        for name in &deleted {
            self.unregister(name).await;
        }
        let deleted_names: HashSet<&String> = deleted.iter().collect();

        let mut added = Vec::new();
        let mut registrations = Vec::new();
        for descriptor in descriptors.iter().rev() {
            if self.functions.read().await.contains_key(&descriptor.name) {
                continue;
            }
            let Some(runtime) = self.runtimes.get(&descriptor.runtime) else {
                debug!(
                    "Skipping function {}: no runtime for {}",
                    descriptor.name, descriptor.runtime
                );
                continue;
            };
            let func = Arc::new(LocalFunction::new(
                descriptor,
                runtime.clone(),
                &self.settings.functions,
                self.settings.blobs.clone(),
            ));
            self.functions
                .write()
                .await
                .insert(descriptor.name.clone(), func.clone());
            if deleted_names.contains(&descriptor.name) {
                debug!("Function {} was renamed", descriptor.name);
            }
            added.push(descriptor.name.clone());
            registrations.push(Arc::clone(self).register(func));
        }
        join_all(registrations).await;

        let removed: Vec<String> = deleted
            .iter()
            .filter(|name| !added.contains(name))
            .cloned()
            .collect();
        for name in &removed {
            self.events
                .emit(LifecycleEvent::new(EventKind::Removed).subject(name.as_str()));
        }

        if self.settings.watch {
            for dir in &directories {
                self.watch_directory(dir);
            }
        }

        Ok(ScanSummary { added, removed })
    }

    /// Remove a function and stop watching its sources.
    pub async fn unregister(&self, name: &str) -> Option<Arc<LocalFunction>> {
        let removed = self.functions.write().await.shift_remove(name);
        if let Some(watched) = self.function_watchers.lock().remove(name) {
            watched.stop();
        }
        removed
    }

    /// Stop every watcher.
    pub fn close(&self) {
        for (_, watched) in self.function_watchers.lock().drain() {
            watched.stop();
        }
        for (_, watched) in self.directory_watchers.lock().drain() {
            watched.stop();
        }
    }

    async fn manifest(&self) -> Option<&PackagingManifest> {
        self.manifest
            .get_or_init(|| async {
                let path = self.resolve(self.settings.functions.manifest.as_ref()?);
                match PackagingManifest::load(&path).await {
                    Ok(manifest) => Some(manifest),
                    Err(err) => {
                        warn!("{}", err);
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    async fn register(self: Arc<Self>, func: Arc<LocalFunction>) {
        if !func.has_valid_name() {
            warn!(
                "Function name '{}' is invalid. It should consist only of alphanumeric characters, hyphen & underscores.",
                func.name()
            );
        }

        if func.extension() == ".zip" {
            self.register_archive(func).await;
            return;
        }
        self.build_and_watch(func, true).await;
    }

    async fn register_archive(&self, func: Arc<LocalFunction>) {
        let target = self
            .settings
            .project_dir
            .join(".netlify")
            .join("functions-serve")
            .join(".unzipped")
            .join(func.name());
        if let Err(err) = unzip_function(func.main_file(), &target).await {
            self.events.emit(
                LifecycleEvent::new(EventKind::BuildError)
                    .subject(func.name())
                    .message(err.to_string()),
            );
            return;
        }
        if self.settings.debug {
            self.events
                .emit(LifecycleEvent::new(EventKind::Extracted).subject(func.name()));
        }

        let entry = self.manifest().await.and_then(|m| m.function(func.name()));
        let entry_point = target.join(ZIP_ENTRY_POINT);
        let main_file = if entry_point.exists() {
            entry_point
        } else {
            target.join(format!("{}.js", func.name()))
        };
        func.set_build(BuildResult {
            main_file: Some(main_file),
            routes: entry.map(|e| e.routes.clone()).unwrap_or_default(),
            schedule: entry.and_then(|e| e.schedule.clone()),
            runtime_api_version: entry.map_or(1, |e| e.build_data.runtime_api_version),
            ..Default::default()
        })
        .await;
        self.events
            .emit(LifecycleEvent::new(EventKind::Loaded).subject(func.name()));
    }

    fn build_and_watch(self: Arc<Self>, func: Arc<LocalFunction>, first_load: bool) -> BoxFuture<'static, ()> {
        async move {
            if !first_load {
                self.events
                    .emit(LifecycleEvent::new(EventKind::Reloading).subject(func.name()));
            }

            match func.build().await {
                Err(err) => self.events.emit(
                    LifecycleEvent::new(EventKind::BuildError)
                        .subject(func.name())
                        .message(err.error_message),
                ),
                Ok(diff) => {
                    let kind = if first_load {
                        EventKind::Loaded
                    } else {
                        EventKind::Reloaded
                    };
                    self.events.emit(LifecycleEvent::new(kind).subject(func.name()));
                    if self.settings.watch {
                        self.watch_sources(&func, diff);
                    }
                }
            }
        }
        .boxed()
    }

    fn watch_sources(self: &Arc<Self>, func: &Arc<LocalFunction>, diff: SrcFilesDiff) {
        let mut watchers = self.function_watchers.lock();

        if let Some(watched) = watchers.get_mut(func.name()) {
            for path in &diff.deleted {
                watched.watcher.unwatch(path);
            }
            for path in &diff.added {
                if let Err(err) = watched.watcher.watch(path, false) {
                    warn!("{}", err);
                }
            }
            return;
        }
        if diff.added.is_empty() {
            return;
        }

        let (mut watcher, rx) = match DebouncedWatcher::new(DEFAULT_DEBOUNCE, Vec::new()) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("Could not watch function {}: {}", func.name(), err);
                return;
            }
        };
        for path in diff.added.iter().chain(diff.included_files.iter()) {
            if let Err(err) = watcher.watch(path, false) {
                warn!("{}", err);
            }
        }

        let this = Arc::clone(self);
        let watched_func = Arc::clone(func);
        let consumer = spawn_batch_consumer(rx, move |_batch| {
            let this = this.clone();
            let func = watched_func.clone();
            async move {
                if this.is_current(&func).await {
                    this.build_and_watch(func, false).await;
                }
            }
        });
        watchers.insert(func.name().to_string(), Watched { watcher, consumer });
    }

    fn watch_directory(self: &Arc<Self>, dir: &Path) {
        let mut watchers = self.directory_watchers.lock();
        if watchers.contains_key(dir) {
            return;
        }

        let (mut watcher, rx) = match DebouncedWatcher::new(DEFAULT_DEBOUNCE, Vec::new()) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("Could not watch {}: {}", dir.display(), err);
                return;
            }
        };
        if let Err(err) = watcher.watch(dir, false) {
            warn!("{}", err);
            return;
        }

        let this = Arc::clone(self);
        let consumer = spawn_batch_consumer(rx, move |_batch| this.clone().rescan());
        info!("Watching functions directory {}", dir.display());
        watchers.insert(dir.to_path_buf(), Watched { watcher, consumer });
    }

    fn rescan(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if let Err(err) = self.scan().await {
                debug!("Functions rescan failed: {}", err);
            }
        }
        .boxed()
    }
}
