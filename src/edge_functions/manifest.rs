//! Route manifest compiled from declarations, and request matching against it.

use crate::edge_functions::bundler::EdgeFunction;
use crate::edge_functions::declaration::{Declaration, FunctionConfig, HeaderMatch};
use hyper::{HeaderMap, Method};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Header condition attached to a route.
#[derive(Debug, Clone)]
pub enum HeaderPredicate {
    Exists,
    Missing,
    Matches(Regex),
}

impl HeaderPredicate {
    fn accepts(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (HeaderPredicate::Exists, value) => value.is_some(),
            (HeaderPredicate::Missing, value) => value.is_none(),
            (HeaderPredicate::Matches(regex), Some(value)) => regex.is_match(value),
            (HeaderPredicate::Matches(_), None) => false,
        }
    }
}

/// A compiled route.
#[derive(Debug, Clone)]
pub struct Route {
    /// Function this route invokes.
    pub function: String,
    /// Declared path, when the route came from one.
    pub path: Option<String>,
    /// Regular expression matched against the request path.
    pub pattern: Regex,
    pub excluded_patterns: Vec<Regex>,
    /// Uppercase methods; empty allows all.
    pub methods: Vec<String>,
    pub headers: Vec<(String, HeaderPredicate)>,
}

impl Route {
    fn matches(&self, path: &str, method: &Method, headers: &HeaderMap) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == method.as_str()) {
            return false;
        }
        if !self.pattern.is_match(path) {
            return false;
        }
        if self.excluded_patterns.iter().any(|p| p.is_match(path)) {
            return false;
        }
        self.headers.iter().all(|(name, predicate)| {
            predicate.accepts(headers.get(name.as_str()).and_then(|v| v.to_str().ok()))
        })
    }
}

/// Per-function settings forwarded to the isolate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionManifestConfig {
    #[serde(skip)]
    pub excluded: Vec<Regex>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

/// Compiled routes for the last successful build.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub routes: Vec<Route>,
    /// Routes that run after the cache (`cache = "manual"`).
    pub post_cache_routes: Vec<Route>,
    pub function_config: BTreeMap<String, FunctionManifestConfig>,
}

/// Route entry in the invocation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub pattern: String,
}

/// Result of matching a request against the manifest.
#[derive(Debug, Clone, Default)]
pub struct RouteMatch {
    /// Matching functions in route order, without duplicates.
    pub function_names: Vec<String>,
    /// Indexes into [`Manifest::all_routes`] of every matching route.
    pub route_indexes: Vec<usize>,
}

impl RouteMatch {
    pub fn is_empty(&self) -> bool {
        self.function_names.is_empty()
    }
}

impl Manifest {
    /// Regular and post-cache routes, in matching order.
    pub fn all_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().chain(self.post_cache_routes.iter())
    }

    /// Match a request path against the routes in declaration order.
    pub fn match_request(&self, path: &str, method: &Method, headers: &HeaderMap) -> RouteMatch {
        let mut result = RouteMatch::default();
        for (index, route) in self.all_routes().enumerate() {
            if !route.matches(path, method, headers) {
                continue;
            }
            let excluded_by_function = self
                .function_config
                .get(&route.function)
                .map(|config| config.excluded.iter().any(|p| p.is_match(path)))
                .unwrap_or(false);
            if excluded_by_function {
                continue;
            }
            if !result.function_names.contains(&route.function) {
                result.function_names.push(route.function.clone());
            }
            result.route_indexes.push(index);
        }
        result
    }

    /// Route summaries sent to the isolate alongside matched indexes.
    pub fn route_summaries(&self) -> Vec<RouteSummary> {
        self.all_routes()
            .map(|route| RouteSummary {
                function: route.function.clone(),
                path: route.path.clone(),
                pattern: route.pattern.as_str().to_string(),
            })
            .collect()
    }
}

/// Convert a URL path with `*` wildcards and `:param` segments into an anchored regex source.
pub fn path_to_regex(path: &str) -> String {
    let trimmed = if path.len() > 1 { path.trim_end_matches('/') } else { "" };
    let mut source = String::from("^");
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => source.push_str(".*"),
            ':' if chars.peek().map_or(false, |n| n.is_ascii_alphabetic() || *n == '_') => {
                while chars
                    .peek()
                    .map_or(false, |n| n.is_ascii_alphanumeric() || *n == '_')
                {
                    chars.next();
                }
                source.push_str("([^/]+?)");
            }
            c => source.push_str(&regex::escape(&c.to_string())),
        }
    }
    source.push_str("/?$");
    source
}

fn compile(source: &str, function: &str) -> Option<Regex> {
    match Regex::new(source) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("Invalid route pattern '{}' for edge function {}: {}", source, function, err);
            None
        }
    }
}

fn compile_route(declaration: &Declaration) -> Option<Route> {
    let function = &declaration.function;
    let pattern = match (&declaration.path, &declaration.pattern) {
        (Some(path), _) => compile(&path_to_regex(path), function)?,
        (None, Some(pattern)) => compile(pattern, function)?,
        (None, None) => return None,
    };

    let excluded_patterns = declaration
        .excluded_path
        .iter()
        .map(|p| path_to_regex(p))
        .chain(declaration.excluded_pattern.iter().cloned())
        .filter_map(|source| compile(&source, function))
        .collect();

    let headers = declaration
        .header
        .iter()
        .filter_map(|(name, matcher)| {
            let predicate = match matcher {
                HeaderMatch::Present(true) => HeaderPredicate::Exists,
                HeaderMatch::Present(false) => HeaderPredicate::Missing,
                HeaderMatch::Pattern(source) => HeaderPredicate::Matches(compile(source, function)?),
            };
            Some((name.to_ascii_lowercase(), predicate))
        })
        .collect();

    Some(Route {
        function: function.clone(),
        path: declaration.path.clone(),
        pattern,
        excluded_patterns,
        methods: declaration.method.iter().map(|m| m.to_ascii_uppercase()).collect(),
        headers,
    })
}

/// Compile merged declarations into a manifest.
///
/// Declarations naming unknown functions are skipped. Returns the manifest and
/// the names of functions left without any route.
pub fn generate_manifest(
    functions: &[EdgeFunction],
    declarations: &[Declaration],
    configs: &HashMap<String, FunctionConfig>,
) -> (Manifest, Vec<String>) {
    let mut manifest = Manifest::default();

    for declaration in declarations {
        if !functions.iter().any(|f| f.name == declaration.function) {
            continue;
        }
        let Some(route) = compile_route(declaration) else {
            continue;
        };
        if declaration.cache.as_deref() == Some("manual") {
            manifest.post_cache_routes.push(route);
        } else {
            manifest.routes.push(route);
        }
    }

    for function in functions {
        let Some(config) = configs.get(&function.name) else {
            continue;
        };
        let excluded_patterns: Vec<String> = if config.path.is_empty() {
            Vec::new()
        } else {
            config
                .excluded_path
                .iter()
                .map(|p| path_to_regex(p))
                .chain(config.excluded_pattern.iter().cloned())
                .collect()
        };
        manifest.function_config.insert(
            function.name.clone(),
            FunctionManifestConfig {
                excluded: excluded_patterns
                    .iter()
                    .filter_map(|source| compile(source, &function.name))
                    .collect(),
                excluded_patterns,
                name: config.name.clone(),
                generator: config.generator.clone(),
                on_error: config.on_error.clone(),
            },
        );
    }

    let unrouted = functions
        .iter()
        .filter(|f| !manifest.all_routes().any(|r| r.function == f.name))
        .map(|f| f.name.clone())
        .collect();

    (manifest, unrouted)
}
