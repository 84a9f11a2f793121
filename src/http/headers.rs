//! Header names exchanged between the router, the isolate and the functions adapter.

pub const ACCOUNT_INFO: &str = "x-nf-account-info";
pub const BLOBS_INFO: &str = "x-nf-blobs-info";
pub const DEBUG_LOGGING: &str = "x-nf-debug-logging";
pub const DEPLOY_CONTEXT: &str = "x-nf-deploy-context";
pub const DEPLOY_ID: &str = "x-nf-deploy-id";
pub const EDGE_FUNCTIONS: &str = "x-nf-edge-functions";
pub const EDGE_FUNCTIONS_METADATA: &str = "x-nf-edge-functions-metadata";
pub const FEATURE_FLAGS: &str = "x-nf-feature-flags";
pub const FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const GEO: &str = "x-nf-geo";
pub const CLIENT_CONNECTION_IP: &str = "x-nf-client-connection-ip";
pub const PASSTHROUGH: &str = "x-nf-passthrough";
pub const PASSTHROUGH_HOST: &str = "x-nf-passthrough-host";
pub const PASSTHROUGH_PROTO: &str = "x-nf-passthrough-proto";
pub const SITE_INFO: &str = "x-nf-site-info";

pub const REQUEST_ID: &str = "x-nf-request-id";
pub const UNCAUGHT_ERROR: &str = "x-nf-uncaught-error";
pub const HIDDEN_PROXY: &str = "x-nf-hidden-proxy";
pub const SIGNATURE: &str = "x-nf-sign";

/// Private side-channel from the router to the functions adapter.
pub const FUNCTION_NAME: &str = "x-nf-function-name";
pub const FUNCTION_ROUTE: &str = "x-nf-function-route";

pub const ORIGINAL_PATHNAME: &str = "x-netlify-original-pathname";
pub const ORIGINAL_SEARCH: &str = "x-netlify-original-search";

pub const ACCOUNT_ID: &str = "x-nf-account-id";
pub const SITE_ID: &str = "x-nf-site-id";
pub const CLIENT_IP: &str = "client-ip";
pub const EVENT: &str = "x-nf-event";

pub const LANGUAGE: &str = "x-language";
pub const COUNTRY: &str = "x-country";
