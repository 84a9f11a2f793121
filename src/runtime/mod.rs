//! Configuration and listeners of the dev server.

mod config;
mod server;
mod tls;

pub use config::{
    BlobsContext, ConfigError, DevConfig, EdgeFunctionsSettings, FrameworkConfig, FunctionSettings,
    FunctionsSettings, GeoSettings, JwtSettings, SiteInfo, TlsConfig,
};
pub use server::{BoundServer, DevServer};
