//! TLS client configuration using rustls with the ring provider.

use super::ConnectError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Force TLS even on a plain `mqtt://` URL
    #[serde(default)]
    pub enabled: bool,
    /// PEM bundle of trusted CAs; the webpki roots are used when absent
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Name to verify the broker certificate against (defaults to the host)
    #[serde(default)]
    pub server_name: Option<String>,
}

pub fn build_client_config(options: &TlsOptions) -> Result<ClientConfig, ConnectError> {
    let mut roots = RootCertStore::empty();
    match &options.ca_file {
        Some(path) => {
            let file = File::open(path).map_err(|e| {
                ConnectError::Tls(format!("Failed to open CA file {}: {e}", path.display()))
            })?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(file))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConnectError::Tls(format!("Failed to parse CA file: {e}")))?;
            if certs.is_empty() {
                return Err(ConnectError::Tls(format!(
                    "No certificates found in {}",
                    path.display()
                )));
            }
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| ConnectError::Tls(format!("Failed to add CA certificate: {e}")))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Runs the TLS handshake over an established TCP stream.
pub async fn handshake(
    stream: TcpStream,
    host: &str,
    options: &TlsOptions,
) -> Result<TlsStream<TcpStream>, ConnectError> {
    let config = build_client_config(options)?;
    let name = options.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ConnectError::Tls(format!("Invalid server name: {name}")))?;

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnectError::Tls(e.to_string()))
}
