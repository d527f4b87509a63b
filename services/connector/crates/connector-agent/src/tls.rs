//! Mutual-TLS client configuration from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::AgentError;

fn open(path: &Path, what: &str) -> Result<BufReader<File>, AgentError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        AgentError::Connection(format!("failed to open {what} {}: {e}", path.display()))
    })
}

fn load_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>, AgentError> {
    let certs = rustls_pemfile::certs(&mut open(path, what)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Connection(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(AgentError::Connection(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, AgentError> {
    rustls_pemfile::private_key(&mut open(path, "device key")?)
        .map_err(|e| AgentError::Connection(format!("failed to parse device key: {e}")))?
        .ok_or_else(|| {
            AgentError::Connection(format!("no private key found in {}", path.display()))
        })
}

/// Client config presenting the device certificate and trusting `ca`.
///
/// # Errors
///
/// Returns `AgentError::Connection` when any file is missing, unparsable or
/// the key does not match the certificate.
pub fn client_config(
    ca: &Path,
    cert: &Path,
    key: &Path,
) -> Result<rustls::ClientConfig, AgentError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca, "CA bundle")? {
        roots
            .add(cert)
            .map_err(|e| AgentError::Connection(format!("failed to add CA cert: {e}")))?;
    }
    let chain = load_certs(cert, "device certificate")?;
    let key = load_key(key)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| AgentError::Connection(format!("invalid client certificate: {e}")))?;

    tracing::debug!(ca = %ca.display(), cert = %cert.display(), "mTLS client config ready");
    Ok(config)
}
