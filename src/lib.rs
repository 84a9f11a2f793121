//! # edgedev - local edge/CDN emulation for site development
//!
//! edgedev sits in front of a framework dev server (or a static publish
//! directory) and reproduces what the production edge does with a request:
//! edge functions, serverless functions, redirect and rewrite rules, custom
//! headers and the CDN's pretty-URL file lookups.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         DevServer (listeners)                       │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Router                                 │
//! │  images → edge functions → functions → addons → rules → framework   │
//! │  ┌───────────────┐  ┌─────────────────┐  ┌───────────────────────┐  │
//! │  │ Edge Functions│  │    Functions    │  │  Static files / ETag  │  │
//! │  │   Registry    │  │ Registry+Adapter│  │  header rules, 404s   │  │
//! │  └───────┬───────┘  └────────┬────────┘  └───────────────────────┘  │
//! └──────────┼───────────────────┼──────────────────────────────────────┘
//!            ▼                   ▼
//!     isolate process     function runtimes
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use edgedev::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DevError> {
//!     let config = DevConfig::new().port(8888).dist_dir("public");
//!     let router = Router::new(RouterSettings::from_config(&config), Arc::new(NoRules), None, None);
//!     DevServer::new(config, router).run().await
//! }
//! ```
//!
//! ## Registries
//!
//! Both registries scan their directories on start, watch them, and
//! publish lifecycle events (loaded, reloaded, removed, build errors) on a
//! broadcast channel obtained with `subscribe()`.

pub mod edge_functions;
pub mod error;
pub mod events;
pub mod functions;
pub mod geo;
pub mod http;
pub mod proxy;
pub mod runtime;
pub mod watch;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::edge_functions::{EdgeFunctionsProxy, EdgeFunctionsRegistry, EdgeProxySettings, EdgeRegistrySettings};
    pub use crate::error::DevError;
    pub use crate::events::{EventKind, LifecycleEvent};
    pub use crate::functions::{AdapterSettings, FunctionsRegistry, FunctionsRegistrySettings, FunctionsServer};
    pub use crate::geo::{GeoContext, GeoResolver, HttpGeoLookup};
    pub use crate::http::{DevRequest, DevResponse};
    pub use crate::proxy::{Match, NoRules, Rewriter, Router, RouterSettings, RuleRequest};
    pub use crate::runtime::{DevConfig, DevServer};
    pub use async_trait::async_trait;
}

pub use error::DevError;
pub use proxy::{Router, RouterSettings};
pub use runtime::{DevConfig, DevServer};
