//! TCP (and TCP+TLS) transport built on tokio streams

use super::tls::{self, TlsOptions};
use super::{BrokerAddress, ConnectError, Connector, ReadStatus, Transport};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// Adapts any tokio byte stream into a [`Transport`].
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<ReadStatus> {
        if buf.capacity() - buf.len() < READ_CHUNK {
            buf.reserve(READ_CHUNK);
        }
        // read_buf is cancel-safe
        match self.stream.read_buf(buf).await? {
            0 => Ok(ReadStatus::Closed),
            n => Ok(ReadStatus::Data(n)),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(target: "mqtt_client", error = %e, "Transport shutdown failed");
        }
    }
}

/// Opens plain TCP connections, upgrading to TLS when requested.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    async fn connect_tcp(address: &BrokerAddress) -> Result<TcpStream, ConnectError> {
        let target = format!("{}:{}", address.host, address.port);
        let candidates: Vec<_> = lookup_host(&target)
            .await
            .map_err(|e| ConnectError::Dns {
                host: address.host.clone(),
                detail: e.to_string(),
            })?
            .collect();
        if candidates.is_empty() {
            return Err(ConnectError::Dns {
                host: address.host.clone(),
                detail: "no addresses returned".to_string(),
            });
        }

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(target: "mqtt_client", error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(target: "mqtt_client", addr = %candidate, error = %e, "TCP connect failed");
                    last_error = Some(e);
                }
            }
        }
        Err(ConnectError::Tcp {
            addr: target,
            detail: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(
        &self,
        address: &BrokerAddress,
        tls_options: Option<&TlsOptions>,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let stream = Self::connect_tcp(address).await?;
        let wants_tls = address.tls || tls_options.is_some_and(|options| options.enabled);
        if !wants_tls {
            return Ok(Box::new(StreamTransport::new(stream)));
        }

        let default_options = TlsOptions::default();
        let options = tls_options.unwrap_or(&default_options);
        let stream = tls::handshake(stream, &address.host, options).await?;
        Ok(Box::new(StreamTransport::new(stream)))
    }
}
