//! TLS acceptor setup
//!
//! Loads the server certificate chain, key and optional client CA from PEM
//! files. With a CA configured, client certificates are verified against it
//! and either required or optional.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::ServerTlsConfig;

#[derive(Debug)]
pub enum TlsError {
    Io(std::io::Error),
    CertificateError(String),
    PrivateKeyError(String),
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    let certs = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("{}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("{}: {}", path, e)))
}

fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .map_err(|e| TlsError::CertificateError(format!("invalid CA certificate: {}", e)))?;
    }
    Ok(root_store)
}

/// Build the acceptor shared by the TLS and WSS listeners
pub fn load_tls_config(config: &ServerTlsConfig) -> Result<TlsAcceptor, TlsError> {
    if config.require_client_cert && config.ca_cert.is_none() {
        return Err(TlsError::ConfigError(
            "ca_cert is required when require_client_cert is set".to_string(),
        ));
    }

    let certs = load_certs(&config.cert)?;
    let key = load_private_key(&config.key)?;

    let builder = match &config.ca_cert {
        Some(ca_path) => {
            let roots = Arc::new(load_ca_certs(ca_path)?);
            let verifier = if config.require_client_cert {
                WebPkiClientVerifier::builder(roots).build()
            } else {
                WebPkiClientVerifier::builder(roots)
                    .allow_unauthenticated()
                    .build()
            }
            .map_err(|e| TlsError::ConfigError(format!("client verifier: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigError(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
