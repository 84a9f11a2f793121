//! Edge functions: declarations, route manifest, builds and the isolate proxy.

mod bundler;
mod coalesce;
mod declaration;
mod graph;
mod manifest;
mod proxy;
mod registry;

pub use bundler::{find_entries, BuildOutput, BundlerError, EdgeBundler, EdgeFunction, ProcessBundler};
pub use coalesce::{BuildCoalescer, SharedBuild};
pub use declaration::{merge_declarations, Declaration, FunctionConfig, HeaderMatch, Tier};
pub use graph::{dependency_index, ModuleGraph};
pub use manifest::{generate_manifest, path_to_regex, Manifest, Route, RouteMatch, RouteSummary};
pub use proxy::{EdgeFunctionsProxy, EdgeProxySettings};
pub use registry::{EdgeFunctionsRegistry, EdgeMatch, EdgeRegistrySettings, InvocationMetadata};
