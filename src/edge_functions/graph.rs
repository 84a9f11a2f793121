//! Module graph reported by the bundler, inverted into a file -> functions index.

use crate::edge_functions::bundler::EdgeFunction;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::rc::Rc;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleGraph {
    #[serde(default)]
    pub modules: Vec<GraphModule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphModule {
    pub specifier: String,
    #[serde(default)]
    pub dependencies: Vec<GraphDependency>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphDependency {
    pub code: Option<GraphSpecifier>,
    #[serde(rename = "type")]
    pub types: Option<GraphSpecifier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphSpecifier {
    pub specifier: String,
}

impl ModuleGraph {
    /// Builds a graph from `(module, direct dependencies)` pairs.
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, Vec<&'a str>)>) -> Self {
        let modules = edges
            .into_iter()
            .map(|(specifier, deps)| GraphModule {
                specifier: specifier.to_string(),
                dependencies: deps
                    .into_iter()
                    .map(|dep| GraphDependency {
                        code: Some(GraphSpecifier {
                            specifier: dep.to_string(),
                        }),
                        types: None,
                    })
                    .collect(),
            })
            .collect();
        Self { modules }
    }
}

fn local_path(specifier: &str) -> Option<PathBuf> {
    if !specifier.starts_with("file://") {
        return None;
    }
    Url::parse(specifier).ok()?.to_file_path().ok()
}

struct Walker<'g> {
    edges: HashMap<&'g str, Vec<&'g str>>,
    memo: HashMap<&'g str, Rc<BTreeSet<PathBuf>>>,
    /// Modules on the current path, with their depth.
    visiting: HashMap<&'g str, usize>,
}

impl<'g> Walker<'g> {
    fn new(graph: &'g ModuleGraph) -> Self {
        let edges = graph
            .modules
            .iter()
            .map(|module| {
                let deps = module
                    .dependencies
                    .iter()
                    .filter_map(|dep| dep.code.as_ref().or(dep.types.as_ref()))
                    .map(|s| s.specifier.as_str())
                    .filter(|s| s.starts_with("file://"))
                    .collect();
                (module.specifier.as_str(), deps)
            })
            .collect();
        Self {
            edges,
            memo: HashMap::new(),
            visiting: HashMap::new(),
        }
    }

    /// Local files transitively imported by `specifier`.
    fn local_dependencies(&mut self, specifier: &'g str) -> Rc<BTreeSet<PathBuf>> {
        self.visit(specifier, 0).0
    }

    /// Returns the files reached and the shallowest module still on the path
    /// that the visit ran into. A set is only complete, and memoized, when
    /// that module is not above `depth`.
    fn visit(&mut self, specifier: &'g str, depth: usize) -> (Rc<BTreeSet<PathBuf>>, usize) {
        if let Some(done) = self.memo.get(specifier) {
            return (done.clone(), usize::MAX);
        }
        if let Some(&open) = self.visiting.get(specifier) {
            return (Rc::new(BTreeSet::new()), open);
        }
        self.visiting.insert(specifier, depth);

        let mut files = BTreeSet::new();
        let mut low = usize::MAX;
        let deps = self.edges.get(specifier).cloned().unwrap_or_default();
        for dep in deps {
            if let Some(path) = local_path(dep) {
                files.insert(path);
            }
            let (reached, reached_low) = self.visit(dep, depth + 1);
            files.extend(reached.iter().cloned());
            low = low.min(reached_low);
        }

        self.visiting.remove(specifier);
        let files = Rc::new(files);
        if low >= depth {
            self.memo.insert(specifier, files.clone());
        }
        (files, low)
    }
}

/// Map every local dependency file to the functions that import it.
pub fn dependency_index(
    graph: &ModuleGraph,
    functions: &[EdgeFunction],
) -> HashMap<PathBuf, BTreeSet<String>> {
    let mut walker = Walker::new(graph);
    let mut index: HashMap<PathBuf, BTreeSet<String>> = HashMap::new();

    for function in functions {
        let Ok(entry) = Url::from_file_path(&function.path) else {
            continue;
        };
        let Some(module) = graph.modules.iter().find(|m| m.specifier == entry.as_str()) else {
            continue;
        };
        for path in walker.local_dependencies(module.specifier.as_str()).iter() {
            if path != &function.path {
                index
                    .entry(path.clone())
                    .or_default()
                    .insert(function.name.clone());
            }
        }
    }
    index
}
