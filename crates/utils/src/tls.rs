use std::{fs::File, io::BufReader, path::Path};

use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::ServerSessionMemoryCache,
    ServerConfig,
};
use rustls_pemfile::certs;
use thiserror::Error;

/// Errors raised while loading the STARTTLS certificate.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("No certificate found in {0}")]
    NoCertificate(String),

    #[error("Invalid private key in {path}: {source}")]
    Key {
        path: String,
        source: rustls::pki_types::pem::Error,
    },

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Loads the certificate chain and private key used for STARTTLS.
pub fn load_tls_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let (cert_chain, key) = load_chain_and_key(cert_path, key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    // session resumption across relay connections
    config.session_storage = ServerSessionMemoryCache::new(256);
    Ok(config)
}

fn load_chain_and_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let io_error = |path: &Path| {
        let path = path.display().to_string();
        move |source| TlsError::Io { path, source }
    };

    let cert_file = File::open(cert_path).map_err(io_error(cert_path))?;
    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(cert_path))?;
    if cert_chain.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.display().to_string()));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|source| TlsError::Key {
        path: key_path.display().to_string(),
        source,
    })?;

    Ok((cert_chain, key))
}
