//! Serverless functions: discovery, builds, invocation and the HTTP adapter.

mod background;
mod event;
mod form;
mod function;
mod manifest;
mod packaging;
mod registry;
mod route;
mod runtime;
mod scheduled;
mod server;
mod synchronous;
#[cfg(test)]
mod test_support;

pub use event::{ClientContext, InvocationError, InvocationEvent, LambdaBody, LambdaResponse};
pub use form::{rewrite_form_submission, FormError};
pub use function::{is_valid_name, parse_schedule, LocalFunction, SrcFilesDiff};
pub use manifest::{ManifestBuildData, ManifestFunction, PackagingManifest};
pub use packaging::{
    unzip_function, DirectoryLister, FunctionDescriptor, FunctionLister, PackagingError, JS_RUNTIME,
};
pub use registry::{
    default_function_name, FunctionMatch, FunctionsRegistry, FunctionsRegistrySettings, ScanSummary,
};
pub use route::{FunctionRoute, RouteMethod};
pub use runtime::{BuildResult, FunctionRuntime, FunctionSource, Invocation, ProcessRuntime};
pub use scheduled::CLOCKWORK_USER_AGENT;
pub use server::{should_base64_encode, AdapterSettings, FunctionsServer, UNLINKED_SITE_ID};
