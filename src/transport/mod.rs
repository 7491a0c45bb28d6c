//! Pluggable stream transports. The concrete set is closed (QUIC, WSS, H2)
//! so each is modeled as a capability trait object behind one tagged enum
//! rather than an open plugin registry.

pub mod h2;
pub mod quic;
pub mod wss;

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Quic,
    Wss,
    H2,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportType::Quic => "quic",
            TransportType::Wss => "wss",
            TransportType::H2 => "h2",
        };
        write!(f, "{}", s)
    }
}

/// One multiplexed byte stream over a peer connection.
pub trait MeshStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MeshStream for T {}

/// A single authenticated connection to a remote peer, capable of opening
/// and accepting multiple independent byte streams.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn open_stream(&self) -> Result<Box<dyn MeshStream>, TransportError>;
    async fn accept_stream(&self) -> Result<Box<dyn MeshStream>, TransportError>;
    fn remote_addr(&self) -> SocketAddr;
    fn transport_type(&self) -> TransportType;
    async fn close(&self);
}

/// Accepts inbound peer connections on one bound address.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError>;
    fn local_addr(&self) -> SocketAddr;
}

/// Dials outbound peer connections of one transport kind.
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr, server_name: &str) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// TLS + ALPN configuration shared by all three transports. Certificate
/// loading and chain verification happen outside this crate; callers hand in
/// already-built `rustls` configs.
#[derive(Clone)]
pub struct TransportTlsConfig {
    pub server_config: Option<std::sync::Arc<rustls::ServerConfig>>,
    pub client_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    pub alpn: Vec<u8>,
}
