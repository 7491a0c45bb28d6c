//! Muti Metroo: encrypted overlay mesh-routing agent
//!
//! Muti Metroo forwards TCP, UDP, and ICMP traffic between untrusted peers
//! over authenticated, end-to-end encrypted streams. Streams are
//! multiplexed onto one of three pluggable secure transports (QUIC,
//! WebSocket-over-TLS, HTTP/2-over-TLS) and can cross multiple transit
//! agents before reaching an exit agent that actually opens the
//! destination socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   mesh link   ┌──────────┐   mesh link   ┌──────────┐
//! │  ingress │──────────────▶│  transit │──────────────▶│   exit   │──▶ destination
//! │  agent   │  (E2E stream) │  agent   │  (E2E stream) │  agent   │
//! └──────────┘               └──────────┘               └──────────┘
//! ```
//!
//! A transit agent only ever forwards opaque, already-encrypted frames; the
//! stream's AEAD session key is shared exclusively between the ingress and
//! exit ends, established by an ephemeral X25519 handshake carried inside
//! the `STREAM_OPEN` / `STREAM_OPEN_ACK` frames (see [`e2e`]).
//!
//! This crate provides the agent core and its supporting subsystems. It
//! deliberately does not provide a SOCKS5 front-end, CLI argument parsing,
//! or TLS certificate provisioning from files — those are external
//! collaborators that construct an [`agent::AgentCore`] and drive it.

pub mod agent;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod datagram;
pub mod e2e;
pub mod error;
pub mod flooder;
pub mod icmp;
pub mod identity;
pub mod json_logger;
pub mod peer;
pub mod relay;
pub mod routing;
pub mod stream_manager;
pub mod tls;
pub mod transport;

pub use agent::AgentCore;
pub use config::AgentConfig;
pub use error::AgentError;
pub use identity::{AgentId, AgentIdentity};
