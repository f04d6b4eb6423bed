//! Client-side TLS for `https` origins on the forward path.
//!
//! The bridge never terminates TLS from its own clients. This only wraps an
//! already-dialed upstream stream so `GET https://...` requests can be sent.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::dialer::BoxedStream;
use crate::error::ProxyError;

#[derive(Clone)]
pub struct OriginTls {
    connector: TlsConnector,
}

impl OriginTls {
    /// Trusts the platform roots, or the bundled Mozilla roots when the platform has none.
    pub fn new() -> Self {
        Self::with_roots(platform_roots())
    }

    /// Trusts only the certificates in the PEM file at `path`.
    pub fn from_ca_file(path: &Path) -> Result<Self, ProxyError> {
        let mut roots = RootCertStore::empty();
        add_pem_certs(&mut roots, path)?;
        Ok(Self::with_roots(roots))
    }

    /// Platform roots plus the configured `origin_ca_file`, if any.
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let mut roots = platform_roots();
        if let Some(path) = &config.origin_ca_file {
            add_pem_certs(&mut roots, Path::new(path))?;
        }
        Ok(Self::with_roots(roots))
    }

    fn with_roots(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Runs the TLS handshake for `host` over `stream`.
    ///
    /// `host` is a URI host, so a bracketed IPv6 literal is accepted.
    pub async fn connect(&self, host: &str, stream: BoxedStream) -> Result<BoxedStream, ProxyError> {
        let name = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| ProxyError::Tls(format!("invalid server name '{}': {}", name, e)))?;

        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", name, e)))?;
        Ok(Box::new(tls_stream))
    }
}

impl Default for OriginTls {
    fn default() -> Self {
        Self::new()
    }
}

fn platform_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for cert in native_certs.certs {
        let _ = roots.add(cert);
    }
    if !native_certs.errors.is_empty() {
        warn!(
            "Loading platform certificates reported {} issues; continuing with {} roots",
            native_certs.errors.len(),
            roots.len()
        );
    }

    if roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}

fn add_pem_certs(roots: &mut RootCertStore, path: &Path) -> Result<(), ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Config(format!("Failed to open CA file {}: {}", path.display(), e)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read CA file {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Config(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| ProxyError::Config(format!("Bad certificate in {}: {}", path.display(), e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::duplex;

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    #[test]
    fn test_ca_file_loads() {
        assert!(OriginTls::from_ca_file(&fixture("ca.pem")).is_ok());

        let mut config = Config::default();
        config.origin_ca_file = Some(fixture("ca.pem").display().to_string());
        assert!(OriginTls::from_config(&config).is_ok());
    }

    #[test]
    fn test_ca_file_errors() {
        let missing = OriginTls::from_ca_file(Path::new("/nonexistent/ca.pem"));
        assert!(matches!(missing, Err(ProxyError::Config(_))));

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        writeln!(empty, "not a certificate").unwrap();
        let err = OriginTls::from_ca_file(empty.path()).err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let tls = OriginTls::from_ca_file(&fixture("ca.pem")).unwrap();
        let (client, _server) = duplex(64);
        let err = tls.connect("bad name!", Box::new(client)).await.err().unwrap();
        assert!(matches!(err, ProxyError::Tls(_)));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_tls_error() {
        let tls = OriginTls::from_ca_file(&fixture("ca.pem")).unwrap();
        let (client, server) = duplex(1024);
        drop(server);
        let err = tls.connect("localhost", Box::new(client)).await.err().unwrap();
        assert!(err.to_string().contains("handshake with localhost failed"));
    }
}
