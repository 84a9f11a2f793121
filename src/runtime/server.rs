//! Listeners of the dev server.

use crate::edge_functions::EdgeFunctionsRegistry;
use crate::error::DevError;
use crate::functions::FunctionsRegistry;
use crate::proxy::Router;
use crate::runtime::{tls, DevConfig};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const FRAMEWORK_POLL: Duration = Duration::from_millis(100);
const FRAMEWORK_WARNING: Duration = Duration::from_secs(30);

/// The dev server: a primary listener (plain or TLS) and, with TLS, a plain
/// listener the isolate passes requests back through.
pub struct DevServer {
    config: DevConfig,
    router: Arc<Router>,
    functions: Option<Arc<FunctionsRegistry>>,
    edge_functions: Option<Arc<EdgeFunctionsRegistry>>,
}

impl DevServer {
    pub fn new(config: DevConfig, router: Router) -> Self {
        Self {
            config,
            router: Arc::new(router),
            functions: None,
            edge_functions: None,
        }
    }

    /// Scan and watch this functions registry while serving.
    pub fn with_functions(mut self, registry: Arc<FunctionsRegistry>) -> Self {
        self.functions = Some(registry);
        self
    }

    /// Build and watch this edge functions registry while serving.
    pub fn with_edge_functions(mut self, registry: Arc<EdgeFunctionsRegistry>) -> Self {
        self.edge_functions = Some(registry);
        self
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Wait for the framework server, then bind every listener.
    pub async fn bind(self) -> Result<BoundServer, DevError> {
        if let Some(framework) = &self.config.framework {
            wait_for_port(&framework.host, framework.port, self.config.framework_timeout()).await?;
        }

        let tls = self.config.tls.as_ref().map(tls::acceptor).transpose()?;
        let primary = bind(&self.config.bind_addr()).await?;
        let secondary = match (&tls, self.config.secondary_port) {
            (Some(_), Some(port)) => Some(bind(&format!("{}:{}", self.config.host, port)).await?),
            _ => None,
        };

        Ok(BoundServer {
            server: self,
            primary,
            secondary,
            tls,
        })
    }

    /// Serve until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<(), DevError> {
        self.bind().await?.serve(shutdown_signal()).await
    }
}

/// A dev server whose listeners are bound.
pub struct BoundServer {
    server: DevServer,
    primary: TcpListener,
    secondary: Option<TcpListener>,
    tls: Option<TlsAcceptor>,
}

impl BoundServer {
    /// Address of the primary listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.primary.local_addr().ok()
    }

    /// Address of the plain pass-back listener, when there is one.
    pub fn secondary_addr(&self) -> Option<SocketAddr> {
        self.secondary.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn start_registries(&self) -> Result<(), DevError> {
        if let Some(functions) = &self.server.functions {
            let summary = functions.scan().await?;
            info!("Loaded {} functions", summary.added.len());
        }
        if let Some(edge) = &self.server.edge_functions {
            // Build errors are reported through the registry and retried on change.
            if let Err(err) = edge.initialize().await {
                warn!("Edge functions build failed: {}", err);
            }
            if let Err(err) = edge.watch() {
                warn!("Could not watch edge functions: {}", err);
            }
        }
        Ok(())
    }

    fn close_registries(&self) {
        if let Some(functions) = &self.server.functions {
            functions.close();
        }
        if let Some(edge) = &self.server.edge_functions {
            edge.close();
        }
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), DevError>
    where
        F: Future<Output = ()>,
    {
        self.start_registries().await?;

        let router = self.server.router.clone();
        let scheme = self.server.config.scheme();
        if let Some(addr) = self.local_addr() {
            info!("Server now ready on {}://{}", scheme, addr);
        }
        if let Some(addr) = self.secondary_addr() {
            info!("Plain HTTP pass-back listener on http://{}", addr);
        }

        let primary = accept_loop(&self.primary, self.tls.clone(), router.clone(), scheme);
        let secondary = async {
            match &self.secondary {
                Some(listener) => accept_loop(listener, None, router.clone(), "http").await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            result = primary => result,
            result = secondary => result,
            _ = shutdown => {
                info!("Shutting down");
                Ok(())
            }
        };
        self.close_registries();
        result
    }
}

async fn bind(addr: &str) -> Result<TcpListener, DevError> {
    TcpListener::bind(addr).await.map_err(|source| DevError::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn accept_loop(
    listener: &TcpListener,
    tls: Option<TlsAcceptor>,
    router: Arc<Router>,
    scheme: &'static str,
) -> Result<(), DevError> {
    let local = listener.local_addr().map_err(|source| DevError::Bind {
        addr: "listener".to_string(),
        source,
    })?;
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) if is_transient(&source) => {
                warn!("Error accepting connection on {}: {}", local, source);
                continue;
            }
            Err(source) => return Err(DevError::Accept { addr: local, source }),
        };
        let router = router.clone();
        let tls = tls.clone();

        tokio::task::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, router, remote_addr, scheme).await,
                    Err(err) => debug!("TLS handshake with {} failed: {}", remote_addr, err),
                },
                None => serve_connection(stream, router, remote_addr, scheme).await,
            }
        });
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(24) // EMFILE
}

async fn serve_connection<S>(stream: S, router: Arc<Router>, remote_addr: SocketAddr, scheme: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.serve(req, remote_addr, scheme).await) }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("Error serving connection from {}: {:?}", remote_addr, err);
    }
}

/// Poll until something listens on `host:port`.
async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> Result<(), DevError> {
    let started = Instant::now();
    let mut warned = false;
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            debug!("Framework server is listening on port {}", port);
            return Ok(());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(DevError::FrameworkTimeout {
                port,
                seconds: timeout.as_secs(),
            });
        }
        if !warned && elapsed >= FRAMEWORK_WARNING {
            warn!("Still waiting for server on port {} to be available", port);
            warned = true;
        }
        tokio::time::sleep(FRAMEWORK_POLL).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{fetch_bytes, NoRules, RouterSettings};
    use crate::runtime::FrameworkConfig;
    use tokio::sync::oneshot;

    fn static_server(dist: &std::path::Path) -> DevServer {
        let config = DevConfig::new().host("127.0.0.1").port(0);
        let router = Router::new(
            RouterSettings {
                dist_dir: dist.to_path_buf(),
                ..Default::default()
            },
            Arc::new(NoRules),
            None,
            None,
        );
        DevServer::new(config, router)
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "hello").unwrap();
        let bound = static_server(dir.path()).bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        assert!(bound.secondary_addr().is_none());

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(bound.serve(async {
            let _ = stopped.await;
        }));

        let body = fetch_bytes(&format!("http://{}/", addr)).await.unwrap();
        assert_eq!(&body[..], b"hello");

        stop.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_framework_timeout() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let mut server = static_server(std::path::Path::new("."));
        server.config.framework = Some(FrameworkConfig {
            host: "127.0.0.1".to_string(),
            port,
        });
        server.config.framework_timeout = 0;

        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, DevError::FrameworkTimeout { .. }));
    }

    #[tokio::test]
    async fn test_waits_for_framework() {
        let framework = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = framework.local_addr().unwrap().port();
        assert!(wait_for_port("127.0.0.1", port, Duration::from_secs(1)).await.is_ok());
    }
}
