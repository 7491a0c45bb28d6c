//! QUIC transport, backed by `quinn`. Stream multiplexing is native: each
//! mesh stream maps directly onto one QUIC bidirectional stream.

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;

use super::{MeshStream, PeerConnection, TransportDialer, TransportListener, TransportType};
use crate::error::TransportError;

pub struct QuicPeerConnection {
    connection: quinn::Connection,
}

#[async_trait]
impl PeerConnection for QuicPeerConnection {
    async fn open_stream(&self) -> Result<Box<dyn MeshStream>, TransportError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(tokio::io::join(recv, send)))
    }

    async fn accept_stream(&self) -> Result<Box<dyn MeshStream>, TransportError> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|_| TransportError::ConnectionLost)?;
        Ok(Box::new(tokio::io::join(recv, send)))
    }

    fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Quic
    }

    async fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
    }
}

pub struct QuicListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

#[async_trait]
impl TransportListener for QuicListener {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::ConnectionLost)?;
        let connection = incoming
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(QuicPeerConnection { connection }))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Binds a QUIC endpoint for listening, given an already-built TLS server
/// config (certificate loading happens outside this crate).
pub async fn bind(
    addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
) -> Result<QuicListener, TransportError> {
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from((*tls_config).clone())
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    let endpoint = Endpoint::server(server_config, addr)?;
    let local_addr = endpoint.local_addr()?;
    Ok(QuicListener { endpoint, local_addr })
}

pub struct QuicDialer {
    client_config: ClientConfig,
    bind_addr: SocketAddr,
}

impl QuicDialer {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, bind_addr: SocketAddr) -> Result<Self, TransportError> {
        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from((*tls_config).clone())
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Self {
            client_config: ClientConfig::new(Arc::new(quic_crypto)),
            bind_addr,
        })
    }
}

#[async_trait]
impl TransportDialer for QuicDialer {
    async fn dial(&self, addr: SocketAddr, server_name: &str) -> Result<Box<dyn PeerConnection>, TransportError> {
        let mut endpoint = Endpoint::client(self.bind_addr)?;
        endpoint.set_default_client_config(self.client_config.clone());
        let connection = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::Handshake(e.to_string()))?
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(QuicPeerConnection { connection }))
    }
}
