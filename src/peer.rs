//! Peer manager: handshake, registry, stream-ID allocation, keepalive/RTT,
//! write serialization, and reconnect-with-backoff over one underlying
//! mesh link per peer (a single transport-level stream carrying the entire
//! `Frame` protocol, multiplexed internally by `Frame::stream_id`).

use bytes::BytesMut;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};

use crate::codec::{Frame, FrameType};
use crate::error::TransportError;
use crate::identity::AgentId;
use crate::json_logger::JsonLogger;
use crate::routing::PeerSummary;
use crate::transport::{MeshStream, PeerConnection, TransportType};

const MAX_MALFORMED_FRAMES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    KeepaliveTimeout,
    TransportError,
    TooManyMalformedFrames,
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped * jitter_factor).max(0.0))
    }
}

/// One live connection to a remote agent.
pub struct Peer {
    pub remote_id: AgentId,
    pub remote_display_name: RwLock<String>,
    pub transport_type: TransportType,
    pub is_dialer: bool,
    next_stream_id: AtomicU64,
    write_tx: mpsc::UnboundedSender<Frame>,
    pub rtt: RwLock<Duration>,
    last_keepalive_sent: RwLock<Instant>,
    last_keepalive_ack: RwLock<Instant>,
    malformed_count: AtomicU64,
}

impl Peer {
    pub fn allocate_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::SeqCst).max(1)
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.write_tx.send(frame).map_err(|_| TransportError::ConnectionLost)
    }
}

type FrameCallback = Arc<dyn Fn(AgentId, Frame) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(AgentId, DisconnectReason) + Send + Sync>;

pub struct PeerManager {
    local_id: AgentId,
    peers: DashMap<AgentId, Arc<Peer>>,
    on_frame: FrameCallback,
    on_disconnect: DisconnectCallback,
    keepalive_interval: Duration,
}

impl PeerManager {
    pub fn new(
        local_id: AgentId,
        keepalive_interval: Duration,
        on_frame: FrameCallback,
        on_disconnect: DisconnectCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            peers: DashMap::new(),
            on_frame,
            on_disconnect,
            keepalive_interval,
        })
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn peer_ids(&self) -> Vec<AgentId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Snapshots every live peer as a `PeerSummary`, for sealing into a
    /// `NodeInfo` advertisement.
    pub async fn summaries(&self) -> Vec<PeerSummary> {
        let mut out = Vec::with_capacity(self.peers.len());
        for entry in self.peers.iter() {
            let peer = entry.value();
            let rtt = *peer.rtt.read().await;
            out.push(PeerSummary {
                peer_id: peer.remote_id,
                transport: peer.transport_type.to_string(),
                rtt_ms: rtt.as_millis().min(u32::MAX as u128) as u32,
                is_dialer: peer.is_dialer,
            });
        }
        out
    }

    /// Registers a freshly-handshaked connection. If a connection to the
    /// same remote already exists, the tie is broken deterministically: the
    /// side whose local id compares less-than the remote id keeps its
    /// accepted connection; on a further tie the acceptor wins.
    pub fn register(
        self: &Arc<Self>,
        remote_id: AgentId,
        display_name: String,
        transport_type: TransportType,
        is_dialer: bool,
        link: Box<dyn MeshStream>,
    ) -> Option<Arc<Peer>> {
        if let Some(existing) = self.peers.get(&remote_id) {
            let local_wins_as_dialer = self.local_id < remote_id;
            let keep_new = if local_wins_as_dialer {
                is_dialer
            } else {
                !is_dialer
            };
            if !keep_new {
                log::debug!("dropping duplicate connection to {}", remote_id);
                return None;
            }
            let old = existing.clone();
            drop(existing);
            self.peers.remove(&remote_id);
            (self.on_disconnect)(remote_id, DisconnectReason::Superseded);
            let _ = old;
        }

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer {
            remote_id,
            remote_display_name: RwLock::new(display_name),
            transport_type,
            is_dialer,
            next_stream_id: AtomicU64::new(1),
            write_tx,
            rtt: RwLock::new(Duration::from_millis(100)),
            last_keepalive_sent: RwLock::new(Instant::now()),
            last_keepalive_ack: RwLock::new(Instant::now()),
            malformed_count: AtomicU64::new(0),
        });

        self.peers.insert(remote_id, peer.clone());
        self.spawn_io(peer.clone(), link, write_rx);
        self.spawn_keepalive(peer.clone());
        JsonLogger::peer_connected("peer", &remote_id.to_string(), transport_type.to_string().as_str(), is_dialer);
        Some(peer)
    }

    fn spawn_io(self: &Arc<Self>, peer: Arc<Peer>, link: Box<dyn MeshStream>, mut write_rx: mpsc::UnboundedReceiver<Frame>) {
        let (mut read_half, mut write_half) = tokio::io::split(link);

        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                let mut buf = BytesMut::new();
                frame.encode(&mut buf);
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            let mut tmp = [0u8; 16384];
            loop {
                match Frame::try_decode(&mut buf) {
                    Ok(Some(frame)) => {
                        manager.dispatch(&peer, frame).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("malformed frame from {}: {}", peer.remote_id, e);
                        if peer.malformed_count.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_MALFORMED_FRAMES as u64 {
                            manager.disconnect(&peer.remote_id, DisconnectReason::TooManyMalformedFrames);
                            return;
                        }
                        buf.clear();
                        continue;
                    }
                }
                match read_half.read(&mut tmp).await {
                    Ok(0) | Err(_) => {
                        manager.disconnect(&peer.remote_id, DisconnectReason::TransportError);
                        return;
                    }
                    Ok(n) => buf.extend_from_slice(&tmp[..n]),
                }
            }
        });
    }

    async fn dispatch(&self, peer: &Arc<Peer>, frame: Frame) {
        match frame.frame_type {
            FrameType::Keepalive => {
                let _ = peer.send(Frame::new(FrameType::KeepaliveAck, 0, frame.payload).unwrap());
            }
            FrameType::KeepaliveAck => {
                let sent_at = *peer.last_keepalive_sent.read().await;
                let sample = Instant::now().saturating_duration_since(sent_at);
                let mut rtt = peer.rtt.write().await;
                let prev = rtt.as_secs_f64();
                let updated = prev * (1.0 - 0.125) + sample.as_secs_f64() * 0.125;
                *rtt = Duration::from_secs_f64(updated.max(0.0));
                *peer.last_keepalive_ack.write().await = Instant::now();
            }
            _ => (self.on_frame)(peer.remote_id, frame),
        }
    }

    fn spawn_keepalive(self: &Arc<Self>, peer: Arc<Peer>) {
        let manager = self.clone();
        let interval = self.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if manager.peers.get(&peer.remote_id).is_none() {
                    return;
                }
                let timeout = interval * 3;
                let last_ack = *peer.last_keepalive_ack.read().await;
                if Instant::now().saturating_duration_since(last_ack) > timeout {
                    manager.disconnect(&peer.remote_id, DisconnectReason::KeepaliveTimeout);
                    return;
                }
                *peer.last_keepalive_sent.write().await = Instant::now();
                if peer
                    .send(Frame::new(FrameType::Keepalive, 0, Vec::new()).unwrap())
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    pub fn disconnect(&self, remote_id: &AgentId, reason: DisconnectReason) {
        if self.peers.remove(remote_id).is_some() {
            JsonLogger::peer_disconnected("peer", &remote_id.to_string(), &format!("{:?}", reason));
            (self.on_disconnect)(*remote_id, reason);
        }
    }
}

/// Exchanges `{version, agent_id, display_name}` over a freshly-opened link.
/// Fixed-size wire shape: `version(u8) | agent_id(32) | name_len(u8) | name`.
pub async fn handshake(
    mut link: Box<dyn MeshStream>,
    local_id: AgentId,
    local_display_name: &str,
    expected_remote: Option<AgentId>,
) -> Result<(AgentId, String, Box<dyn MeshStream>), TransportError> {
    const VERSION: u8 = 1;
    let mut out = BytesMut::new();
    out.extend_from_slice(&[VERSION]);
    out.extend_from_slice(&local_id.0);
    let name_bytes = local_display_name.as_bytes();
    out.extend_from_slice(&[name_bytes.len().min(255) as u8]);
    out.extend_from_slice(&name_bytes[..name_bytes.len().min(255)]);
    link.write_all(&out).await?;

    let mut header = [0u8; 34];
    link.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(TransportError::Handshake(format!("unsupported version {}", header[0])));
    }
    let mut remote_id = [0u8; 32];
    remote_id.copy_from_slice(&header[1..33]);
    let remote_id = AgentId(remote_id);
    let name_len = header[33] as usize;
    let mut name_buf = vec![0u8; name_len];
    link.read_exact(&mut name_buf).await?;
    let remote_display_name = String::from_utf8_lossy(&name_buf).to_string();

    if let Some(expected) = expected_remote {
        if expected != remote_id {
            return Err(TransportError::Handshake("remote agent id mismatch".into()));
        }
    }

    Ok((remote_id, remote_display_name, link))
}

pub async fn dial_and_register(
    manager: &Arc<PeerManager>,
    conn: Box<dyn PeerConnection>,
    local_id: AgentId,
    local_display_name: &str,
    expected_remote: Option<AgentId>,
) -> Result<Arc<Peer>, TransportError> {
    let transport_type = conn.transport_type();
    let link = conn.open_stream().await?;
    let (remote_id, display_name, link) = handshake(link, local_id, local_display_name, expected_remote).await?;
    manager
        .register(remote_id, display_name, transport_type, true, link)
        .ok_or_else(|| TransportError::Handshake("superseded by a better-ranked existing connection".into()))
}

pub async fn accept_and_register(
    manager: &Arc<PeerManager>,
    conn: Box<dyn PeerConnection>,
    local_id: AgentId,
    local_display_name: &str,
) -> Result<Arc<Peer>, TransportError> {
    let transport_type = conn.transport_type();
    let link = conn.accept_stream().await?;
    let (remote_id, display_name, link) = handshake(link, local_id, local_display_name, None).await?;
    manager
        .register(remote_id, display_name, transport_type, false, link)
        .ok_or_else(|| TransportError::Handshake("superseded by a better-ranked existing connection".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }
}
