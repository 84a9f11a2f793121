//! Crate-level error type.

use crate::edge_functions::BundlerError;
use crate::functions::PackagingError;
use crate::proxy::ProxyError;
use crate::runtime::ConfigError;
use crate::watch::WatchError;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors that stop the dev server from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum DevError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept connection on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load TLS material from {path}: {message}")]
    Tls { path: PathBuf, message: String },
    #[error("framework server on port {port} did not start within {seconds}s")]
    FrameworkTimeout { port: u16, seconds: u64 },
    #[error(transparent)]
    Bundler(#[from] BundlerError),
    #[error(transparent)]
    Packaging(#[from] PackagingError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

pub type Result<T, E = DevError> = std::result::Result<T, E>;
