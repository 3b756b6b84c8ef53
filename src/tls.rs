//! TLS server contexts built from PEM material

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;

/// A ready-to-use server configuration for one hostname
pub type TlsContext = Arc<rustls::ServerConfig>;

/// ALPN protocols advertised by every context
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("no certificates found")]
    NoCertificates,

    #[error("no private key found")]
    NoPrivateKey,

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("failed to generate self-signed certificate: {0}")]
    SelfSigned(String),
}

/// Build a server context from a PEM certificate chain and private key
pub fn build_tls_context(certificate_pem: &str, key_pem: &str) -> Result<TlsContext, TlsError> {
    let certs = parse_certs(certificate_pem)?;
    let key = parse_key(key_pem)?;
    context_from_der(certs, key)
}

/// Load a context from PEM files on disk
pub fn load_tls_context(cert_path: &str, key_path: &str) -> anyhow::Result<TlsContext> {
    let certificate = std::fs::read_to_string(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", cert_path, e))?;
    let key = std::fs::read_to_string(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", key_path, e))?;

    build_tls_context(&certificate, &key)
        .map_err(|e| anyhow::anyhow!("Invalid TLS material in {} / {}: {}", cert_path, key_path, e))
}

/// Generate a throwaway self-signed context for localhost
pub fn self_signed_context() -> Result<TlsContext, TlsError> {
    let (certificate, key) =
        self_signed_pem(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
    build_tls_context(&certificate, &key)
}

/// Generate a self-signed certificate and key, PEM encoded
pub fn self_signed_pem(subject_alt_names: Vec<String>) -> Result<(String, String), TlsError> {
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| TlsError::SelfSigned(e.to_string()))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())?.ok_or(TlsError::NoPrivateKey)
}

fn context_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsContext, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}
