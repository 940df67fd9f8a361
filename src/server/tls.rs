// src/server/tls.rs

//! TLS acceptor setup and the off-loop handshake of TCP clients.

use super::stream::AnyStream;
use crate::config::TlsConfig;
use crate::connection::ClientConnection;
use crate::core::FlomError;
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{debug, info};

/// Upper bound on a single handshake, so a stalled peer cannot pin a permit.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the TLS acceptor if TLS is enabled in the configuration.
pub fn setup_tls(config: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }
    info!("TLS is enabled. Loading certificate and key.");
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match &config.ca_path {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| anyhow!("Invalid CA certificate in '{}': {}", ca_path, e))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| anyhow!("Failed to build client verifier: {}", e))?;
            info!("Client certificates are required (CA bundle '{}').", ca_path);
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Runs the server side of the handshake and wraps the result as a client.
pub async fn handshake(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    addr: SocketAddr,
    permit: OwnedSemaphorePermit,
) -> Result<ClientConnection, FlomError> {
    let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| FlomError::TlsHandshake(format!("{addr}: timed out")))?
        .map_err(|e| FlomError::TlsHandshake(format!("{addr}: {e}")))?;
    debug!("TLS handshake with {} completed", addr);
    Ok(ClientConnection::new(
        AnyStream::Tls(Box::new(tls_stream)),
        addr.to_string(),
        Some(permit),
    ))
}
