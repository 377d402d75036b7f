//! TLS wrapping, negotiated before any framing happens.

use std::path::Path;
use thiserror::Error;
use tokio_native_tls::{native_tls, TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read identity {path}: {source}")]
    ReadIdentity {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Native(#[from] native_tls::Error),
}

/// How the bundled client treats the server certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientTls {
    /// Plain TCP.
    #[default]
    Disabled,
    /// TLS with full certificate and hostname verification.
    Verified,
    /// TLS that accepts any certificate. Development only.
    InsecureDevOnly,
}

/// Build a server-side acceptor from a PKCS#12 identity bundle.
pub fn acceptor_from_pkcs12(path: &Path, password: &str) -> Result<TlsAcceptor, TlsError> {
    let der = std::fs::read(path).map_err(|source| TlsError::ReadIdentity {
        path: path.display().to_string(),
        source,
    })?;
    let identity = native_tls::Identity::from_pkcs12(&der, password)?;
    let acceptor = native_tls::TlsAcceptor::builder(identity)
        .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
        .build()?;
    Ok(TlsAcceptor::from(acceptor))
}

/// Build a client connector, or `None` when TLS is disabled.
pub fn connector(mode: &ClientTls) -> Result<Option<TlsConnector>, TlsError> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    match mode {
        ClientTls::Disabled => return Ok(None),
        ClientTls::Verified => {}
        ClientTls::InsecureDevOnly => {
            tracing::warn!("TLS certificate verification is DISABLED; never use this in production");
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
    }
    Ok(Some(TlsConnector::from(builder.build()?)))
}
