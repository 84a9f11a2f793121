//! TLS acceptor for the primary listener.

use crate::error::DevError;
use crate::runtime::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

fn tls_error(path: &Path, message: impl ToString) -> DevError {
    DevError::Tls {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, DevError> {
    let file = File::open(path).map_err(|err| tls_error(path, err))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| tls_error(path, err))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, DevError> {
    let file = File::open(path).map_err(|err| tls_error(path, err))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| tls_error(path, err))?
        .ok_or_else(|| tls_error(path, "no private key found"))
}

/// Build an acceptor from PEM certificate and key files.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, DevError> {
    let certs = load_certs(&config.cert)?;
    let key = load_key(&config.key)?;
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| tls_error(&config.cert, err))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
