//! Agent core: owns every subsystem (peers, routing, flooding, streams,
//! relay table, datagram sessions) and is the single place frames arriving
//! from any peer are dispatched from. Nothing outside this module decides
//! transit-vs-terminal.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};

use crate::codec::{
    encode_peer_summaries, Frame, FrameType, NodeInfoAdvertiseBody, OpenAckBody, OpenBody, OpenErrBody,
    RouteAdvertiseBody, RouteKind, RouteWithdrawBody, WireAddr, FIN_WRITE,
};
use crate::config::AgentConfig;
use crate::crypto::{seal_box, SessionKey};
use crate::datagram::{GetOrCreateOutcome, IcmpSessions, UdpIngressAssociation};
use crate::e2e;
use crate::error::{AgentError, OpenErrorCode, StreamError};
use crate::flooder::{Flooder, LocalCidrRoute, LocalDomainRoute, LocalTunnelRoute};
use crate::icmp::IcmpSocket;
use crate::identity::{AgentId, AgentIdentity};
use crate::json_logger::JsonLogger;
use crate::peer::{DisconnectReason, PeerManager};
use crate::relay::{RelayEntry, RelayTable, SharedRelayTable};
use crate::routing::{Advertisement, NodeInfo, Route, RoutingTable};
use crate::stream_manager::StreamManager;
use x25519_dalek::PublicKey;

/// Hop budget for agent-originated opens. Generous enough for any realistic
/// mesh diameter while still bounding a misconfigured routing loop.
const ORIGINATION_TTL: u8 = 32;
/// How long an originated open waits for its `*_OPEN_ACK`/`*_OPEN_ERR` before
/// giving up.
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Which of the three forwarded protocols a frame belongs to, and the four
/// frame types that make up its open/close handshake. Transit forwarding of
/// data/close/reset frames never needs this — only opening a new leg does.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Proto {
    Tcp,
    Udp,
    Icmp,
}

impl Proto {
    fn open_ack(self) -> FrameType {
        match self {
            Proto::Tcp => FrameType::StreamOpenAck,
            Proto::Udp => FrameType::UdpOpenAck,
            Proto::Icmp => FrameType::IcmpOpenAck,
        }
    }

    fn open_err(self) -> FrameType {
        match self {
            Proto::Tcp => FrameType::StreamOpenErr,
            Proto::Udp => FrameType::UdpOpenErr,
            Proto::Icmp => FrameType::IcmpOpenErr,
        }
    }

    fn data(self) -> FrameType {
        match self {
            Proto::Tcp => FrameType::StreamData,
            Proto::Udp => FrameType::UdpDatagram,
            Proto::Icmp => FrameType::IcmpEcho,
        }
    }

    fn open(self) -> FrameType {
        match self {
            Proto::Tcp => FrameType::StreamOpen,
            Proto::Udp => FrameType::UdpOpen,
            Proto::Icmp => FrameType::IcmpOpen,
        }
    }
}

/// Maps a locally-known stream to the single peer and wire stream id it
/// faces, for both roles a non-transit agent can play: the ingress side of a
/// stream it originated, and the exit side of a stream it terminates.
/// Transit hops never use this — they use `RelayTable` instead, which has
/// two faces per entry rather than one.
struct EdgeTable {
    by_local: DashMap<u64, (AgentId, u64, Proto)>,
    by_peer: DashMap<(AgentId, u64), u64>,
    next_local: AtomicU64,
}

impl EdgeTable {
    fn new() -> Self {
        Self {
            by_local: DashMap::new(),
            by_peer: DashMap::new(),
            next_local: AtomicU64::new(1),
        }
    }

    fn bind(&self, peer: AgentId, peer_stream_id: u64, proto: Proto) -> u64 {
        let local = self.next_local.fetch_add(1, Ordering::SeqCst);
        self.by_local.insert(local, (peer, peer_stream_id, proto));
        self.by_peer.insert((peer, peer_stream_id), local);
        local
    }

    /// Binds using a caller-chosen local id rather than minting one. Used on
    /// the initiating side, where the local id must match the stream id
    /// already handed out by `StreamManager`/the datagram association tables.
    fn bind_at(&self, peer: AgentId, peer_stream_id: u64, proto: Proto, local: u64) {
        self.by_local.insert(local, (peer, peer_stream_id, proto));
        self.by_peer.insert((peer, peer_stream_id), local);
    }

    fn peer_for(&self, local: u64) -> Option<(AgentId, u64, Proto)> {
        self.by_local.get(&local).map(|e| *e)
    }

    fn local_for(&self, peer: AgentId, peer_stream_id: u64) -> Option<u64> {
        self.by_peer.get(&(peer, peer_stream_id)).map(|e| *e)
    }

    fn remove_local(&self, local: u64) {
        if let Some((_, (peer, id, _))) = self.by_local.remove(&local) {
            self.by_peer.remove(&(peer, id));
        }
    }

    /// Removes every local id facing `peer`, returning them so the caller
    /// can tear down whatever local resource (socket, stream) each one
    /// owns. A full scan, same shape as `RelayTable::remove_all_for_peer`.
    fn remove_all_for_peer(&self, peer: AgentId) -> Vec<u64> {
        let locals: Vec<u64> = self.by_local.iter().filter(|e| e.value().0 == peer).map(|e| *e.key()).collect();
        for &local in &locals {
            self.remove_local(local);
        }
        locals
    }
}

struct IcmpExitSession {
    local_id: u64,
    dest: Ipv4Addr,
    identifier: u16,
    session_key: Arc<SessionKey>,
}

fn proto_of(frame_type: FrameType) -> Proto {
    match frame_type {
        FrameType::StreamOpen
        | FrameType::StreamOpenAck
        | FrameType::StreamOpenErr
        | FrameType::StreamData
        | FrameType::StreamClose
        | FrameType::StreamReset => Proto::Tcp,
        FrameType::UdpOpen | FrameType::UdpOpenAck | FrameType::UdpOpenErr | FrameType::UdpDatagram | FrameType::UdpClose => Proto::Udp,
        _ => Proto::Icmp,
    }
}

/// Parses a base64-encoded X25519 public key from `management_public_key`.
/// Malformed configuration is logged and treated as "unset" rather than
/// failing agent startup.
fn parse_management_public_key(encoded: &str) -> Option<PublicKey> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let bytes = match STANDARD.decode(encoded) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("management_public_key is not valid base64: {}", e);
            return None;
        }
    };
    if bytes.len() != 32 {
        log::warn!("management_public_key must decode to 32 bytes, got {}", bytes.len());
        return None;
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Some(PublicKey::from(arr))
}

pub struct AgentCore {
    pub identity: AgentIdentity,
    pub config: AgentConfig,
    pub peers: Arc<PeerManager>,
    pub routing: RwLock<RoutingTable>,
    pub flooder: Flooder,
    pub streams: StreamManager,
    pub relay: SharedRelayTable,
    edges: EdgeTable,
    udp_sockets: DashMap<u64, Arc<UdpSocket>>,
    icmp_socket: std::sync::Mutex<Option<Arc<IcmpSocket>>>,
    icmp_sessions: DashMap<(Ipv4Addr, u16), IcmpExitSession>,
    node_info_sequence: std::sync::atomic::AtomicU32,
    start_time: std::time::Instant,
    frame_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(AgentId, Frame)>>>,
    disconnect_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(AgentId, DisconnectReason)>>>,
    // Ingress-origination bookkeeping: associations this agent opened on
    // behalf of a local caller (a SOCKS5 front-end or similar), keyed the
    // opposite way from the exit-side tables above.
    udp_associations: DashMap<u64, Arc<UdpIngressAssociation>>,
    udp_base_counter: AtomicU64,
    udp_dest_streams: DashMap<u64, (u64, IpAddr)>,
    udp_deliveries: DashMap<u64, mpsc::UnboundedSender<(IpAddr, Vec<u8>)>>,
    icmp_ingress: IcmpSessions,
    icmp_dest_streams: DashMap<u64, (Ipv4Addr, u16)>,
    icmp_deliveries: DashMap<(Ipv4Addr, u16), mpsc::UnboundedSender<Vec<u8>>>,
    management_public_key: Option<PublicKey>,
    /// Fan-out of every disconnect, independent of `disconnect_loop`'s own
    /// single-consumer channel, so other callers (the persistent dialer) can
    /// learn when a specific peer goes away without racing a timer against
    /// its actual connection lifetime.
    disconnect_broadcast: tokio::sync::broadcast::Sender<(AgentId, DisconnectReason)>,
}

impl AgentCore {
    pub fn new(config: AgentConfig, identity: AgentIdentity) -> Arc<Self> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let (disconnect_broadcast, _) = tokio::sync::broadcast::channel(64);
        let local_id = identity.id;
        let broadcast_tx = disconnect_broadcast.clone();
        let peers = PeerManager::new(
            local_id,
            config.peer.keepalive_interval,
            Arc::new(move |remote, frame| {
                let _ = frame_tx.send((remote, frame));
            }),
            Arc::new(move |remote, reason| {
                let _ = disconnect_tx.send((remote, reason));
                let _ = broadcast_tx.send((remote, reason));
            }),
        );
        let local_cidr = config
            .local_routes
            .cidrs
            .iter()
            .filter_map(|c| c.parse::<ipnet::IpNet>().ok())
            .map(|net| LocalCidrRoute { net, metric: 1 })
            .collect();
        let local_domains = config
            .local_routes
            .domains
            .iter()
            .map(|pattern| LocalDomainRoute {
                pattern: pattern.clone(),
                metric: 1,
            })
            .collect();
        let local_tunnels = config
            .local_routes
            .tunnels
            .iter()
            .map(|key| LocalTunnelRoute {
                key: key.clone(),
                metric: 1,
            })
            .collect();
        let management_public_key = config
            .management_public_key
            .as_deref()
            .and_then(parse_management_public_key);
        Arc::new(Self {
            routing: RwLock::new(RoutingTable::new(local_id)),
            flooder: Flooder::with_local_routes(local_id, local_cidr, local_domains, local_tunnels),
            streams: StreamManager::new(),
            relay: Arc::new(RelayTable::new()),
            edges: EdgeTable::new(),
            udp_sockets: DashMap::new(),
            icmp_socket: std::sync::Mutex::new(None),
            icmp_sessions: DashMap::new(),
            node_info_sequence: std::sync::atomic::AtomicU32::new(1),
            start_time: std::time::Instant::now(),
            frame_rx: std::sync::Mutex::new(Some(frame_rx)),
            disconnect_rx: std::sync::Mutex::new(Some(disconnect_rx)),
            udp_associations: DashMap::new(),
            udp_base_counter: AtomicU64::new(1),
            udp_dest_streams: DashMap::new(),
            udp_deliveries: DashMap::new(),
            icmp_ingress: IcmpSessions::new(1),
            icmp_dest_streams: DashMap::new(),
            icmp_deliveries: DashMap::new(),
            management_public_key,
            disconnect_broadcast,
            identity,
            config,
            peers,
        })
    }

    /// Subscribes to peer disconnect events. Used by the persistent dialer
    /// to wait for a specific peer's actual disconnect instead of racing a
    /// backoff timer against a still-live connection.
    pub fn subscribe_disconnects(&self) -> tokio::sync::broadcast::Receiver<(AgentId, DisconnectReason)> {
        self.disconnect_broadcast.subscribe()
    }

    /// Spawns the background loops: frame dispatch, disconnect cleanup,
    /// periodic flooding, and stale-route/idle-association eviction. Must be
    /// called exactly once.
    pub fn run(self: &Arc<Self>) {
        let frame_rx = self
            .frame_rx
            .lock()
            .unwrap()
            .take()
            .expect("AgentCore::run called more than once");
        let disconnect_rx = self
            .disconnect_rx
            .lock()
            .unwrap()
            .take()
            .expect("AgentCore::run called more than once");

        let core = self.clone();
        tokio::spawn(async move { core.frame_dispatch_loop(frame_rx).await });

        let core = self.clone();
        tokio::spawn(async move { core.disconnect_loop(disconnect_rx).await });

        let core = self.clone();
        let interval = self.config.flooding.interval;
        tokio::spawn(async move { core.flood_loop(interval).await });

        let core = self.clone();
        let route_ttl = self.config.flooding.route_ttl;
        let node_info_ttl = self.config.flooding.node_info_ttl;
        tokio::spawn(async move { core.cleanup_loop(route_ttl, node_info_ttl).await });
    }

    /// Looks up the next hop and remaining path toward `addr`, the way a
    /// transit hop reads them back off an `OpenBody` it forwards: `path[0]`
    /// is the peer directly reachable from here, so it becomes the frame's
    /// destination and is excluded from `remaining_path`.
    async fn next_hop_for(&self, ip: IpAddr) -> Result<(AgentId, AgentId, Vec<AgentId>), AgentError> {
        let routing = self.routing.read().await;
        let route = routing.lookup(ip).ok_or_else(|| {
            StreamError::Refused {
                code: OpenErrorCode::NoRoute,
                message: "no route to destination".to_string(),
            }
        })?;
        if route.path.is_empty() {
            return Err(StreamError::Refused {
                code: OpenErrorCode::NoRoute,
                message: "route has an empty path".to_string(),
            }
            .into());
        }
        Ok((route.next_hop, route.origin, route.path[1..].to_vec()))
    }

    async fn next_hop_for_wire_addr(&self, addr: &WireAddr) -> Result<(AgentId, AgentId, Vec<AgentId>), AgentError> {
        match addr {
            WireAddr::V4(ip) => self.next_hop_for(IpAddr::V4(*ip)).await,
            WireAddr::V6(ip) => self.next_hop_for(IpAddr::V6(*ip)).await,
            WireAddr::Domain(name) => {
                let routing = self.routing.read().await;
                let route = routing.lookup_domain(name).ok_or_else(|| StreamError::Refused {
                    code: OpenErrorCode::NoRoute,
                    message: "no route to destination".to_string(),
                })?;
                if route.path.is_empty() {
                    return Err(StreamError::Refused {
                        code: OpenErrorCode::NoRoute,
                        message: "route has an empty path".to_string(),
                    }
                    .into());
                }
                Ok((route.next_hop, route.origin, route.path[1..].to_vec()))
            }
        }
    }

    /// Opens a TCP stream to `addr:port` through the mesh and pumps bytes
    /// between it and `client` until either side closes. This is the entry
    /// point an external front-end (SOCKS5, a dashboard, anything that has
    /// already accepted a client connection and resolved its target) calls
    /// to originate a stream; everything upstream of "I have a socket and a
    /// destination" is this crate's concern, everything downstream of it
    /// is not.
    pub async fn open_tcp_stream(self: &Arc<Self>, client: TcpStream, addr: WireAddr, port: u16) -> Result<(), AgentError> {
        let (next_hop, _origin, remaining_path) = self.next_hop_for_wire_addr(&addr).await?;
        let peer = self.peers.get(&next_hop).ok_or_else(|| StreamError::Refused {
            code: OpenErrorCode::NoRoute,
            message: "next hop not connected".to_string(),
        })?;

        let local_stream_id = peer.allocate_stream_id();
        let (request_id, result_rx, ephemeral_pub) = self.streams.begin_open(next_hop, local_stream_id);
        let open = OpenBody {
            request_id,
            addr,
            port,
            ttl: ORIGINATION_TTL,
            remaining_path,
            ephemeral_pub,
        };
        peer.send(Frame::new(FrameType::StreamOpen, local_stream_id, open.encode())?)?;

        let success = match tokio::time::timeout(OPEN_TIMEOUT, result_rx).await {
            Ok(Ok(Ok(success))) => success,
            Ok(Ok(Err(e))) => return Err(e.into()),
            _ => {
                self.streams.cancel(request_id);
                return Err(StreamError::Timeout.into());
            }
        };

        JsonLogger::stream_opened("agent", "tcp", &next_hop.to_string(), local_stream_id);
        let session_key = success.session_key;
        let mut read_rx = success.read_rx;
        let (mut read_half, mut write_half) = client.into_split();

        let core = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16384];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        if let Ok(sealed) = session_key.seal(&[]) {
                            if let Some(peer) = core.peers.get(&next_hop) {
                                if let Ok(frame) = Frame::new(FrameType::StreamData, local_stream_id, sealed) {
                                    let _ = peer.send(frame.with_flags(FIN_WRITE));
                                }
                            }
                        }
                        core.close_local_stream(local_stream_id);
                        return;
                    }
                    Ok(n) => {
                        let Ok(sealed) = session_key.seal(&buf[..n]) else { return };
                        let Some(peer) = core.peers.get(&next_hop) else { return };
                        let Ok(frame) = Frame::new(FrameType::StreamData, local_stream_id, sealed) else { return };
                        if peer.send(frame).is_err() {
                            return;
                        }
                    }
                }
            }
        });
        tokio::spawn(async move {
            while let Some((plaintext, fin)) = read_rx.recv().await {
                if !plaintext.is_empty() && write_half.write_all(&plaintext).await.is_err() {
                    break;
                }
                if fin {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        });
        Ok(())
    }

    /// Starts a new UDP association for a front-end to multiplex many
    /// destinations behind, mirroring a single SOCKS5 UDP association.
    /// Returns the association id to pass to [`Self::send_udp_datagram`] and
    /// a channel of decrypted `(source, payload)` replies.
    pub fn open_udp_association(&self) -> (u64, mpsc::UnboundedReceiver<(IpAddr, Vec<u8>)>) {
        let base_stream_id = self.udp_base_counter.fetch_add(1, Ordering::SeqCst);
        let stream_id_base = base_stream_id.wrapping_mul(1_000_000).wrapping_add(1);
        self.udp_associations
            .insert(base_stream_id, Arc::new(UdpIngressAssociation::new(base_stream_id, stream_id_base)));
        let (tx, rx) = mpsc::unbounded_channel();
        self.udp_deliveries.insert(base_stream_id, tx);
        (base_stream_id, rx)
    }

    pub fn close_udp_association(&self, base_stream_id: u64) {
        self.udp_associations.remove(&base_stream_id);
        self.udp_deliveries.remove(&base_stream_id);
    }

    /// Sends one UDP datagram to `dest` under `base_stream_id`, opening a new
    /// per-destination leg through the mesh on first use and reusing it for
    /// subsequent datagrams to the same destination.
    pub async fn send_udp_datagram(self: &Arc<Self>, base_stream_id: u64, dest: SocketAddr, payload: &[u8]) -> Result<(), AgentError> {
        if !self.config.datagram.udp_enabled {
            return Err(StreamError::Refused {
                code: OpenErrorCode::UdpDisabled,
                message: "udp forwarding disabled".to_string(),
            }
            .into());
        }
        let ingress = self
            .udp_associations
            .get(&base_stream_id)
            .map(|e| e.clone())
            .ok_or(StreamError::UnknownStream(base_stream_id))?;

        let (next_hop, origin, remaining_path) = self.next_hop_for(dest.ip()).await?;
        let outcome = ingress.get_or_create(dest.ip(), next_hop, origin, rand::random());
        let dest_assoc = match outcome {
            GetOrCreateOutcome::Existing(assoc) => assoc,
            GetOrCreateOutcome::Created { assoc: dest_assoc, result_tx } => {
                let local_stream_id = dest_assoc.stream_id();
                self.udp_dest_streams.insert(local_stream_id, (base_stream_id, dest.ip()));

                let resolved = match self.peers.get(&next_hop) {
                    Some(peer) => {
                        let (request_id, result_rx, ephemeral_pub) = self.streams.begin_open(next_hop, local_stream_id);
                        let open = OpenBody {
                            request_id,
                            addr: dest.ip().into(),
                            port: dest.port(),
                            ttl: ORIGINATION_TTL,
                            remaining_path,
                            ephemeral_pub,
                        };
                        let sent = Frame::new(FrameType::UdpOpen, local_stream_id, open.encode())
                            .map_err(AgentError::from)
                            .and_then(|f| peer.send(f).map_err(AgentError::from));
                        match sent {
                            Ok(()) => match tokio::time::timeout(OPEN_TIMEOUT, result_rx).await {
                                Ok(Ok(Ok(success))) => Ok(success.session_key),
                                Ok(Ok(Err(e))) => Err(e),
                                _ => {
                                    self.streams.cancel(request_id);
                                    Err(StreamError::Timeout)
                                }
                            },
                            Err(_) => Err(StreamError::Refused {
                                code: OpenErrorCode::NoRoute,
                                message: "failed to send udp open".to_string(),
                            }),
                        }
                    }
                    None => Err(StreamError::Refused {
                        code: OpenErrorCode::NoRoute,
                        message: "next hop not connected".to_string(),
                    }),
                };
                if resolved.is_err() {
                    ingress.remove(dest.ip());
                    self.udp_dest_streams.remove(&local_stream_id);
                }
                let _ = result_tx.send(resolved);
                dest_assoc
            }
        };

        let session_key = dest_assoc.session_key().await?;
        dest_assoc.touch().await;
        let sealed = session_key.seal(payload)?;
        let peer = self
            .peers
            .get(&dest_assoc.next_hop())
            .ok_or(StreamError::UnknownStream(dest_assoc.stream_id()))?;
        peer.send(Frame::new(FrameType::UdpDatagram, dest_assoc.stream_id(), sealed)?)?;
        Ok(())
    }

    /// Registers interest in ICMP echo replies from `dest`/`identifier` and
    /// returns the channel they arrive on. Call before the first
    /// [`Self::send_icmp_echo`] for that pair.
    pub fn open_icmp_channel(&self, dest: Ipv4Addr, identifier: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.icmp_deliveries.insert((dest, identifier), tx);
        rx
    }

    pub async fn send_icmp_echo(self: &Arc<Self>, dest: Ipv4Addr, identifier: u16, payload: &[u8]) -> Result<(), AgentError> {
        let (next_hop, origin, remaining_path) = self.next_hop_for(IpAddr::V4(dest)).await?;
        let outcome = self.icmp_ingress.get_or_create(IpAddr::V4(dest), identifier, next_hop, origin, rand::random());
        let session = match outcome {
            GetOrCreateOutcome::Existing(session) => session,
            GetOrCreateOutcome::Created { assoc: session, result_tx } => {
                let local_stream_id = session.stream_id();
                self.icmp_dest_streams.insert(local_stream_id, (dest, identifier));

                let resolved = match self.peers.get(&next_hop) {
                    Some(peer) => {
                        let (request_id, result_rx, ephemeral_pub) = self.streams.begin_open(next_hop, local_stream_id);
                        let open = OpenBody {
                            request_id,
                            addr: WireAddr::V4(dest),
                            port: identifier,
                            ttl: ORIGINATION_TTL,
                            remaining_path,
                            ephemeral_pub,
                        };
                        let sent = Frame::new(FrameType::IcmpOpen, local_stream_id, open.encode())
                            .map_err(AgentError::from)
                            .and_then(|f| peer.send(f).map_err(AgentError::from));
                        match sent {
                            Ok(()) => match tokio::time::timeout(OPEN_TIMEOUT, result_rx).await {
                                Ok(Ok(Ok(success))) => Ok(success.session_key),
                                Ok(Ok(Err(e))) => Err(e),
                                _ => {
                                    self.streams.cancel(request_id);
                                    Err(StreamError::Timeout)
                                }
                            },
                            Err(_) => Err(StreamError::Refused {
                                code: OpenErrorCode::NoRoute,
                                message: "failed to send icmp open".to_string(),
                            }),
                        }
                    }
                    None => Err(StreamError::Refused {
                        code: OpenErrorCode::NoRoute,
                        message: "next hop not connected".to_string(),
                    }),
                };
                if resolved.is_err() {
                    self.icmp_ingress.remove(IpAddr::V4(dest), identifier);
                    self.icmp_dest_streams.remove(&local_stream_id);
                }
                let _ = result_tx.send(resolved);
                session
            }
        };

        let session_key = session.session_key().await?;
        session.touch().await;
        let sealed = session_key.seal(payload)?;
        let peer = self.peers.get(&session.next_hop()).ok_or(StreamError::UnknownStream(session.stream_id()))?;
        peer.send(Frame::new(FrameType::IcmpEcho, session.stream_id(), sealed)?)?;
        Ok(())
    }

    async fn frame_dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(AgentId, Frame)>) {
        while let Some((remote, frame)) = rx.recv().await {
            if let Err(err) = self.handle_frame(remote, frame).await {
                log::warn!("error handling frame from {}: {}", remote, err);
            }
        }
    }

    async fn disconnect_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(AgentId, DisconnectReason)>) {
        while let Some((peer, reason)) = rx.recv().await {
            self.handle_peer_disconnect(peer, reason).await;
        }
    }

    /// All cleanup that hangs off one peer's death: transit relay entries,
    /// this agent's own pending/live streams through that peer, and any
    /// UDP/ICMP association still routed through it.
    async fn handle_peer_disconnect(self: &Arc<Self>, peer: AgentId, reason: DisconnectReason) {
        log::info!("peer {} disconnected: {:?}", peer, reason);
        for entry in self.relay.remove_all_for_peer(peer) {
            let (other_peer, other_stream_id) = if entry.upstream_peer == peer {
                (entry.downstream_peer, entry.downstream_stream_id)
            } else {
                (entry.upstream_peer, entry.upstream_stream_id)
            };
            if let Some(p) = self.peers.get(&other_peer) {
                if let Ok(f) = Frame::new(FrameType::StreamReset, other_stream_id, Vec::new()) {
                    let _ = p.send(f);
                }
            }
        }

        self.streams.fail_all_for_peer(peer);
        for local_id in self.edges.remove_all_for_peer(peer) {
            self.close_local_stream(local_id);
        }

        for entry in self.udp_associations.iter() {
            for (_, assoc) in entry.value().remove_all_for_peer(peer) {
                self.udp_dest_streams.remove(&assoc.stream_id());
            }
        }
        for (_, assoc) in self.icmp_ingress.remove_all_for_peer(peer) {
            self.icmp_dest_streams.remove(&assoc.stream_id());
        }
    }

    async fn flood_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.flood_local_routes().await;
            self.flood_node_info().await;
        }
    }

    async fn flood_local_routes(&self) {
        for (net, route) in self.flooder.build_local_cidr_advertisements() {
            let advert = Advertisement {
                origin: route.origin,
                sequence: route.sequence,
                path: route.path.clone(),
                seen_by: vec![],
            };
            let body = RouteAdvertiseBody {
                kind: RouteKind::Cidr(net),
                origin: route.origin,
                sequence: route.sequence,
                metric: route.metric,
                path: route.path,
                seen_by: vec![],
            };
            self.broadcast_advertisement(&advert, body, None);
        }
        for (pattern, route) in self.flooder.build_local_domain_advertisements() {
            let advert = Advertisement {
                origin: route.origin,
                sequence: route.sequence,
                path: route.path.clone(),
                seen_by: vec![],
            };
            let body = RouteAdvertiseBody {
                kind: RouteKind::Domain(pattern),
                origin: route.origin,
                sequence: route.sequence,
                metric: route.metric,
                path: route.path,
                seen_by: vec![],
            };
            self.broadcast_advertisement(&advert, body, None);
        }
        for (key, route) in self.flooder.build_local_tunnel_advertisements() {
            let advert = Advertisement {
                origin: route.origin,
                sequence: route.sequence,
                path: route.path.clone(),
                seen_by: vec![],
            };
            let body = RouteAdvertiseBody {
                kind: RouteKind::Tunnel(key),
                origin: route.origin,
                sequence: route.sequence,
                metric: route.metric,
                path: route.path,
                seen_by: vec![],
            };
            self.broadcast_advertisement(&advert, body, None);
        }
    }

    async fn flood_node_info(&self) {
        let sealed_peers = match &self.management_public_key {
            Some(key) => {
                let summaries = self.peers.summaries().await;
                seal_box(key, &encode_peer_summaries(&summaries))
            }
            None => Vec::new(),
        };
        let body = NodeInfoAdvertiseBody {
            origin: self.identity.id,
            sequence: self.node_info_sequence.fetch_add(1, Ordering::SeqCst),
            display_name: self.config.display_name.clone(),
            hostname: self.config.display_name.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            peer_count: self.peers.peer_ids().len() as u16,
            static_pubkey: *self.identity.static_public.as_bytes(),
            udp_capable: self.config.datagram.udp_enabled,
            sealed_peers,
        };
        if let Ok(frame) = Frame::new(FrameType::NodeInfoAdvertise, 0, body.encode()) {
            for peer_id in self.peers.peer_ids() {
                if let Some(peer) = self.peers.get(&peer_id) {
                    let _ = peer.send(frame.clone());
                }
            }
        }
    }

    fn broadcast_advertisement(&self, advert: &Advertisement, body: RouteAdvertiseBody, exclude: Option<AgentId>) {
        let targets = self.flooder.fanout_targets(&self.peers, advert, exclude);
        if let Ok(frame) = Frame::new(FrameType::RouteAdvertise, 0, body.encode()) {
            for target in targets {
                if let Some(peer) = self.peers.get(&target) {
                    let _ = peer.send(frame.clone());
                }
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, route_ttl: Duration, node_info_ttl: Duration) {
        let mut ticker = tokio::time::interval(route_ttl.min(node_info_ttl).max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let mut routing = self.routing.write().await;
            let removed = routing.cleanup_stale_routes(route_ttl);
            let removed_info = routing.cleanup_stale_node_info(node_info_ttl);
            if removed > 0 || removed_info > 0 {
                log::debug!("evicted {} stale routes, {} stale node-info entries", removed, removed_info);
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        match frame.frame_type {
            FrameType::StreamOpen => self.handle_open(remote, Proto::Tcp, frame).await,
            FrameType::UdpOpen => self.handle_open(remote, Proto::Udp, frame).await,
            FrameType::IcmpOpen => self.handle_open(remote, Proto::Icmp, frame).await,

            FrameType::StreamOpenAck | FrameType::UdpOpenAck | FrameType::IcmpOpenAck => {
                self.handle_open_ack(remote, frame).await
            }
            FrameType::StreamOpenErr | FrameType::UdpOpenErr | FrameType::IcmpOpenErr => {
                self.handle_open_err(remote, frame).await
            }

            FrameType::StreamData | FrameType::UdpDatagram | FrameType::IcmpEcho => {
                self.handle_data_or_echo(remote, frame).await
            }
            FrameType::StreamClose | FrameType::UdpClose | FrameType::IcmpClose => {
                self.handle_close(remote, frame).await
            }
            FrameType::StreamReset => self.handle_reset(remote, frame).await,

            FrameType::RouteAdvertise => self.handle_route_advertise(remote, frame).await,
            FrameType::RouteWithdraw => self.handle_route_withdraw(remote, frame).await,
            FrameType::NodeInfoAdvertise => self.handle_node_info_advertise(remote, frame).await,

            FrameType::Keepalive | FrameType::KeepaliveAck => Ok(()),
            FrameType::ControlRequest | FrameType::ControlResponse => {
                log::debug!("control channel frame from {} ignored (no management endpoint wired)", remote);
                Ok(())
            }
        }
    }

    fn reply_open_err(&self, to: AgentId, proto: Proto, stream_id: u64, request_id: u64, code: OpenErrorCode, message: &str) {
        if let Some(peer) = self.peers.get(&to) {
            let body = OpenErrBody {
                request_id,
                code: code as u16,
                message: message.to_string(),
            };
            if let Ok(frame) = Frame::new(proto.open_err(), stream_id, body.encode()) {
                let _ = peer.send(frame);
            }
        }
    }

    async fn handle_open(self: &Arc<Self>, remote: AgentId, proto: Proto, frame: Frame) -> Result<(), AgentError> {
        let open = OpenBody::decode(&frame.payload)?;

        if !open.remaining_path.is_empty() {
            let next_hop = open.remaining_path[0];
            let Some(next_peer) = self.peers.get(&next_hop) else {
                self.reply_open_err(remote, proto, frame.stream_id, open.request_id, OpenErrorCode::NoRoute, "next hop not connected");
                return Ok(());
            };
            if open.ttl == 0 {
                self.reply_open_err(remote, proto, frame.stream_id, open.request_id, OpenErrorCode::GeneralFailure, "ttl exceeded");
                return Ok(());
            }
            let downstream_id = next_peer.allocate_stream_id();
            self.relay.insert(RelayEntry {
                upstream_peer: remote,
                upstream_stream_id: frame.stream_id,
                downstream_peer: next_hop,
                downstream_stream_id: downstream_id,
            })?;
            let mut forwarded = open.shifted();
            forwarded.ttl = forwarded.ttl.saturating_sub(1);
            let out = Frame::new(proto.open(), downstream_id, forwarded.encode())?;
            next_peer.send(out).map_err(AgentError::from)?;
            return Ok(());
        }

        match proto {
            Proto::Tcp => self.handle_terminal_tcp_open(remote, frame.stream_id, open).await,
            Proto::Udp => self.handle_terminal_udp_open(remote, frame.stream_id, open).await,
            Proto::Icmp => self.handle_terminal_icmp_open(remote, frame.stream_id, open).await,
        }
    }

    async fn handle_terminal_tcp_open(self: &Arc<Self>, remote: AgentId, wire_stream_id: u64, open: OpenBody) -> Result<(), AgentError> {
        if !self.destination_allowed(&open.addr) {
            self.reply_open_err(remote, Proto::Tcp, wire_stream_id, open.request_id, OpenErrorCode::NotAllowed, "destination not in allowed routes");
            return Ok(());
        }
        let target = match &open.addr {
            WireAddr::Domain(name) => format!("{}:{}", name, open.port),
            WireAddr::V4(ip) => format!("{}:{}", ip, open.port),
            WireAddr::V6(ip) => format!("[{}]:{}", ip, open.port),
        };
        let socket = match TcpStream::connect(&target).await {
            Ok(s) => s,
            Err(e) => {
                self.reply_open_err(remote, Proto::Tcp, wire_stream_id, open.request_id, OpenErrorCode::HostUnreachable, &e.to_string());
                return Ok(());
            }
        };
        let bound_addr: WireAddr = socket.local_addr().map(|a| a.ip().into()).unwrap_or(WireAddr::V4(Ipv4Addr::UNSPECIFIED));
        let bound_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        let (session_key, ack) = match e2e::respond_to_open(&open, bound_addr, bound_port) {
            Ok(pair) => pair,
            Err(e) => {
                self.reply_open_err(remote, Proto::Tcp, wire_stream_id, open.request_id, e2e::refusal_code_for_crypto_error(&e), "key agreement failed");
                return Ok(());
            }
        };

        let local_id = self.edges.bind(remote, wire_stream_id, Proto::Tcp);
        let (stream, mut read_rx) = self.streams.register_responder_stream(remote, local_id, session_key.clone());

        if let Some(peer) = self.peers.get(&remote) {
            if let Ok(frame) = Frame::new(FrameType::StreamOpenAck, wire_stream_id, ack.encode()) {
                let _ = peer.send(frame);
            }
        }
        JsonLogger::stream_opened("agent", "tcp", &remote.to_string(), wire_stream_id);

        let (mut read_half, mut write_half) = socket.into_split();
        let core = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16384];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        if let Ok(sealed) = session_key.seal(&[]) {
                            if let Some(peer) = core.peers.get(&remote) {
                                if let Ok(frame) = Frame::new(FrameType::StreamData, wire_stream_id, sealed) {
                                    let _ = peer.send(frame.with_flags(FIN_WRITE));
                                }
                            }
                        }
                        core.close_local_stream(local_id);
                        return;
                    }
                    Ok(n) => {
                        let Ok(sealed) = session_key.seal(&buf[..n]) else { return };
                        if let Some(peer) = core.peers.get(&remote) {
                            if let Ok(frame) = Frame::new(FrameType::StreamData, wire_stream_id, sealed) {
                                if peer.send(frame).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
        tokio::spawn(async move {
            while let Some((plaintext, fin)) = read_rx.recv().await {
                if !plaintext.is_empty() && write_half.write_all(&plaintext).await.is_err() {
                    break;
                }
                if fin {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
            let _ = stream; // keep the handle alive for the lifetime of the pump
        });
        Ok(())
    }

    async fn handle_terminal_udp_open(self: &Arc<Self>, remote: AgentId, wire_stream_id: u64, open: OpenBody) -> Result<(), AgentError> {
        if !self.config.datagram.udp_enabled {
            self.reply_open_err(remote, Proto::Udp, wire_stream_id, open.request_id, OpenErrorCode::UdpDisabled, "udp forwarding disabled");
            return Ok(());
        }
        if !self.destination_allowed(&open.addr) {
            self.reply_open_err(remote, Proto::Udp, wire_stream_id, open.request_id, OpenErrorCode::NotAllowed, "destination not in allowed routes");
            return Ok(());
        }
        let target = match &open.addr {
            WireAddr::V4(ip) => std::net::SocketAddr::new(IpAddr::V4(*ip), open.port),
            WireAddr::V6(ip) => std::net::SocketAddr::new(IpAddr::V6(*ip), open.port),
            WireAddr::Domain(_) => {
                self.reply_open_err(remote, Proto::Udp, wire_stream_id, open.request_id, OpenErrorCode::HostUnreachable, "udp targets must be resolved addresses");
                return Ok(());
            }
        };
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(s) => s,
            Err(e) => {
                self.reply_open_err(remote, Proto::Udp, wire_stream_id, open.request_id, OpenErrorCode::GeneralFailure, &e.to_string());
                return Ok(());
            }
        };
        if socket.connect(target).await.is_err() {
            self.reply_open_err(remote, Proto::Udp, wire_stream_id, open.request_id, OpenErrorCode::HostUnreachable, "connect failed");
            return Ok(());
        }
        let bound_addr: WireAddr = socket.local_addr().map(|a| a.ip().into()).unwrap_or(WireAddr::V4(Ipv4Addr::UNSPECIFIED));
        let bound_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        let (session_key, ack) = match e2e::respond_to_open(&open, bound_addr, bound_port) {
            Ok(pair) => pair,
            Err(e) => {
                self.reply_open_err(remote, Proto::Udp, wire_stream_id, open.request_id, e2e::refusal_code_for_crypto_error(&e), "key agreement failed");
                return Ok(());
            }
        };

        let local_id = self.edges.bind(remote, wire_stream_id, Proto::Udp);
        let socket = Arc::new(socket);
        self.udp_sockets.insert(local_id, socket.clone());
        let (_stream, _read_rx) = self.streams.register_responder_stream(remote, local_id, session_key.clone());

        if let Some(peer) = self.peers.get(&remote) {
            if let Ok(frame) = Frame::new(FrameType::UdpOpenAck, wire_stream_id, ack.encode()) {
                let _ = peer.send(frame);
            }
        }

        let core = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        let Ok(sealed) = session_key.seal(&buf[..n]) else { continue };
                        if let Some(peer) = core.peers.get(&remote) {
                            if let Ok(frame) = Frame::new(FrameType::UdpDatagram, wire_stream_id, sealed) {
                                if peer.send(frame).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        Ok(())
    }

    async fn handle_terminal_icmp_open(self: &Arc<Self>, remote: AgentId, wire_stream_id: u64, open: OpenBody) -> Result<(), AgentError> {
        if !self.config.datagram.icmp_enabled {
            self.reply_open_err(remote, Proto::Icmp, wire_stream_id, open.request_id, OpenErrorCode::IcmpDisabled, "icmp forwarding disabled");
            return Ok(());
        }
        let WireAddr::V4(dest) = open.addr else {
            self.reply_open_err(remote, Proto::Icmp, wire_stream_id, open.request_id, OpenErrorCode::HostUnreachable, "icmp forwarding is ipv4-only");
            return Ok(());
        };
        if !self.destination_allowed(&WireAddr::V4(dest)) {
            self.reply_open_err(remote, Proto::Icmp, wire_stream_id, open.request_id, OpenErrorCode::NotAllowed, "destination not in allowed routes");
            return Ok(());
        }
        // `port` carries the echo identifier for ICMP opens; there is no
        // meaningful transport port for a raw ping.
        let identifier = open.port;

        let (session_key, ack) = match e2e::respond_to_open(&open, WireAddr::V4(dest), identifier) {
            Ok(pair) => pair,
            Err(e) => {
                self.reply_open_err(remote, Proto::Icmp, wire_stream_id, open.request_id, e2e::refusal_code_for_crypto_error(&e), "key agreement failed");
                return Ok(());
            }
        };

        if self.ensure_icmp_socket().is_none() {
            self.reply_open_err(remote, Proto::Icmp, wire_stream_id, open.request_id, OpenErrorCode::GeneralFailure, "raw socket unavailable (missing CAP_NET_RAW?)");
            return Ok(());
        }

        let local_id = self.edges.bind(remote, wire_stream_id, Proto::Icmp);
        self.icmp_sessions.insert(
            (dest, identifier),
            IcmpExitSession {
                local_id,
                dest,
                identifier,
                session_key,
            },
        );

        if let Some(peer) = self.peers.get(&remote) {
            if let Ok(frame) = Frame::new(FrameType::IcmpOpenAck, wire_stream_id, ack.encode()) {
                let _ = peer.send(frame);
            }
        }
        Ok(())
    }

    fn ensure_icmp_socket(self: &Arc<Self>) -> Option<Arc<IcmpSocket>> {
        let mut guard = self.icmp_socket.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            return Some(existing.clone());
        }
        let socket = Arc::new(IcmpSocket::open_v4().ok()?);
        *guard = Some(socket.clone());
        drop(guard);

        let mut replies = socket.spawn_reader();
        let core = self.clone();
        tokio::spawn(async move {
            while let Some((from, identifier, _sequence, payload)) = replies.recv().await {
                let Some(session) = core.icmp_sessions.get(&(from, identifier)) else { continue };
                let Ok(sealed) = session.session_key.seal(&payload) else { continue };
                if let Some((peer_id, wire_id, _)) = core.edges.peer_for(session.local_id) {
                    if let Some(peer) = core.peers.get(&peer_id) {
                        if let Ok(frame) = Frame::new(FrameType::IcmpEcho, wire_id, sealed) {
                            let _ = peer.send(frame);
                        }
                    }
                }
            }
        });
        Some(socket)
    }

    /// Checks `addr` against this agent's configured egress CIDR allow-list
    /// (`local_routes.cidrs`). An empty list means this agent advertises no
    /// local routes and exits nothing; a domain address is let through since
    /// it is resolved by the target process, not matched against a CIDR.
    fn destination_allowed(&self, addr: &WireAddr) -> bool {
        let ip = match addr {
            WireAddr::V4(ip) => IpAddr::V4(*ip),
            WireAddr::V6(ip) => IpAddr::V6(*ip),
            WireAddr::Domain(_) => return true,
        };
        self.config
            .local_routes
            .cidrs
            .iter()
            .filter_map(|c| c.parse::<ipnet::IpNet>().ok())
            .any(|net| net.contains(&ip))
    }

    /// Handles `STREAM_DATA` / `UDP_DATAGRAM` / `IMCP_ECHO`: either forward
    /// unopened at a transit hop (via the relay table, payload untouched), or
    /// decrypt and deliver locally at an ingress/exit endpoint (via the edge
    /// table and live stream / socket).
    async fn handle_data_or_echo(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        if let Some(relayed) = self.forward_via_relay(remote, &frame) {
            relayed?;
            return Ok(());
        }

        let Some(local_id) = self.edges.local_for(remote, frame.stream_id) else {
            return Ok(());
        };

        match frame.frame_type {
            FrameType::StreamData => {
                if let Some(stream) = self.streams.get(local_id) {
                    let plaintext = stream.session_key.open(&frame.payload)?;
                    self.streams.handle_data(local_id, frame.fin_write(), plaintext).await?;
                }
            }
            FrameType::UdpDatagram => {
                if let (Some(socket), Some(stream)) = (self.udp_sockets.get(&local_id), self.streams.get(local_id)) {
                    if let Ok(plaintext) = stream.session_key.open(&frame.payload) {
                        let _ = socket.send(&plaintext).await;
                    }
                } else if let Some(origin) = self.udp_dest_streams.get(&local_id) {
                    let (base_stream_id, dest) = *origin;
                    if let Some(stream) = self.streams.get(local_id) {
                        if let Ok(plaintext) = stream.session_key.open(&frame.payload) {
                            if let Some(delivery) = self.udp_deliveries.get(&base_stream_id) {
                                let _ = delivery.send((dest, plaintext));
                            }
                        }
                    }
                }
            }
            FrameType::IcmpEcho => {
                if let Some(session) = self.icmp_session_for_local(local_id) {
                    if let Ok(plaintext) = session.session_key.open(&frame.payload) {
                        if let Some(socket) = self.icmp_socket.lock().unwrap().clone() {
                            let sequence = 1;
                            let _ = socket.send_echo_request(session.dest, session.identifier, sequence, &plaintext);
                        }
                    }
                } else if let Some(origin) = self.icmp_dest_streams.get(&local_id) {
                    let (dest, identifier) = *origin;
                    if let Some(stream) = self.streams.get(local_id) {
                        if let Ok(plaintext) = stream.session_key.open(&frame.payload) {
                            if let Some(delivery) = self.icmp_deliveries.get(&(dest, identifier)) {
                                let _ = delivery.send(plaintext);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn icmp_session_for_local(&self, local_id: u64) -> Option<IcmpSessionView> {
        self.icmp_sessions.iter().find(|e| e.value().local_id == local_id).map(|e| IcmpSessionView {
            dest: e.value().dest,
            identifier: e.value().identifier,
            session_key: e.value().session_key.clone(),
        })
    }

    /// Tries to forward a non-open frame at a transit hop. Returns `None` if
    /// this agent has no relay entry for it (meaning it's a local endpoint
    /// frame instead), `Some(Ok(()))` on successful forward.
    fn forward_via_relay(&self, remote: AgentId, frame: &Frame) -> Option<Result<(), AgentError>> {
        if let Some(entry) = self.relay.lookup_by_upstream(remote, frame.stream_id) {
            return Some(self.forward_frame(frame, entry.downstream_peer, entry.downstream_stream_id));
        }
        if let Some(entry) = self.relay.lookup_by_downstream(remote, frame.stream_id) {
            return Some(self.forward_frame(frame, entry.upstream_peer, entry.upstream_stream_id));
        }
        None
    }

    fn forward_frame(&self, frame: &Frame, to: AgentId, stream_id: u64) -> Result<(), AgentError> {
        let peer = self.peers.get(&to).ok_or(crate::error::RelayError::UnknownStream(stream_id))?;
        let out = Frame::new(frame.frame_type, stream_id, frame.payload.clone())?.with_flags(frame.flags);
        peer.send(out)?;
        Ok(())
    }

    async fn handle_close(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        if let Some(relayed) = self.forward_via_relay(remote, &frame) {
            return relayed;
        }
        if let Some(local_id) = self.edges.local_for(remote, frame.stream_id) {
            self.close_local_stream(local_id);
        }
        Ok(())
    }

    async fn handle_reset(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        if let Some(relayed) = self.forward_via_relay(remote, &frame) {
            return relayed;
        }
        if let Some(local_id) = self.edges.local_for(remote, frame.stream_id) {
            self.streams.handle_reset(local_id);
            self.edges.remove_local(local_id);
        }
        Ok(())
    }

    fn close_local_stream(&self, local_id: u64) {
        JsonLogger::stream_closed("agent", "tcp", local_id, "fin");
        self.streams.handle_close(local_id);
        self.udp_sockets.remove(&local_id);
        self.edges.remove_local(local_id);
        self.icmp_sessions.retain(|_, session| session.local_id != local_id);
        if let Some((_, (base_stream_id, dest))) = self.udp_dest_streams.remove(&local_id) {
            if let Some(ingress) = self.udp_associations.get(&base_stream_id) {
                ingress.remove(dest);
            }
        }
        self.icmp_dest_streams.remove(&local_id);
    }

    async fn handle_open_ack(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        if let Some(relayed) = self.forward_via_relay(remote, &frame) {
            return relayed;
        }
        let ack = OpenAckBody::decode(&frame.payload)?;
        let stream = self.streams.handle_open_ack(&ack)?;
        // The local id must be the stream id `StreamManager` already filed
        // this stream under, not a freshly minted `EdgeTable` counter value.
        self.edges
            .bind_at(remote, frame.stream_id, proto_of(frame.frame_type), stream.stream_id);
        Ok(())
    }

    async fn handle_open_err(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        if let Some(relayed) = self.forward_via_relay(remote, &frame) {
            return relayed;
        }
        let err = OpenErrBody::decode(&frame.payload)?;
        self.streams
            .handle_open_err(err.request_id, OpenErrorCode::from_u16(err.code), err.message)?;
        Ok(())
    }

    async fn handle_route_advertise(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        let body = RouteAdvertiseBody::decode(&frame.payload)?;
        let route = Route {
            origin: body.origin,
            next_hop: remote,
            path: body.path.clone(),
            metric: body.metric,
            sequence: body.sequence,
            last_seen: std::time::Instant::now(),
        };
        let accepted = {
            let mut routing = self.routing.write().await;
            match &body.kind {
                RouteKind::Cidr(net) => routing.accept_cidr_route(*net, route.clone()),
                RouteKind::Domain(pattern) => routing.accept_domain_route(pattern.clone(), route.clone()),
                RouteKind::Tunnel(key) => routing.accept_tunnel_route(key.clone(), route.clone()),
            }
        };
        match accepted {
            Ok(true) => {
                let forwarded_route = self.flooder.rebuild_for_forwarding(&route);
                let advert = Advertisement {
                    origin: body.origin,
                    sequence: body.sequence,
                    path: forwarded_route.path.clone(),
                    seen_by: self.flooder.seen_by_for_forward(body.seen_by.clone()),
                };
                let forwarded_body = RouteAdvertiseBody {
                    kind: body.kind,
                    origin: body.origin,
                    sequence: body.sequence,
                    metric: forwarded_route.metric,
                    path: forwarded_route.path,
                    seen_by: advert.seen_by.clone(),
                };
                self.broadcast_advertisement(&advert, forwarded_body, Some(remote));
            }
            Ok(false) => {}
            Err(e) => log::debug!("rejected route advertisement from {}: {}", remote, e),
        }
        Ok(())
    }

    async fn handle_route_withdraw(self: &Arc<Self>, _remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        let body = RouteWithdrawBody::decode(&frame.payload)?;
        let mut routing = self.routing.write().await;
        if let Err(e) = routing.withdraw_cidr(body.net, body.origin, body.sequence) {
            log::debug!("rejected route withdrawal: {}", e);
        }
        Ok(())
    }

    async fn handle_node_info_advertise(self: &Arc<Self>, remote: AgentId, frame: Frame) -> Result<(), AgentError> {
        let body = NodeInfoAdvertiseBody::decode(&frame.payload)?;
        // `sealed_peers` is opaque to every agent but the management-key
        // holder; decoding the wire field is as far as a relaying agent can
        // verify it (see `crypto::seal_box`/`open_box`).
        let info = NodeInfo {
            display_name: body.display_name,
            hostname: body.hostname,
            start_time: std::time::Instant::now() - Duration::from_secs(body.uptime_secs),
            sealed_peers: body.sealed_peers,
            static_pubkey: body.static_pubkey,
            udp_capable: body.udp_capable,
            last_seen: std::time::Instant::now(),
        };
        let mut routing = self.routing.write().await;
        match routing.accept_node_info(body.origin, body.sequence, info) {
            Ok(true) => {
                drop(routing);
                let targets = self.peers.peer_ids().into_iter().filter(|id| *id != remote);
                if let Ok(frame) = Frame::new(FrameType::NodeInfoAdvertise, 0, frame.payload.clone()) {
                    for target in targets {
                        if let Some(peer) = self.peers.get(&target) {
                            let _ = peer.send(frame.clone());
                        }
                    }
                }
            }
            Ok(false) => {}
            Err(e) => log::debug!("rejected node-info from {}: {}", remote, e),
        }
        Ok(())
    }
}

struct IcmpSessionView {
    dest: Ipv4Addr,
    identifier: u16,
    session_key: Arc<SessionKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralKeypair;
    use std::path::PathBuf;

    fn test_config(name: &str) -> AgentConfig {
        AgentConfig {
            data_dir: PathBuf::from(format!("/tmp/muti-metroo-agent-test-{}", name)),
            display_name: name.to_string(),
            listeners: vec![],
            dial_targets: vec![],
            local_routes: crate::config::LocalRoutesConfig::default(),
            flooding: crate::config::FloodingConfig::default(),
            peer: crate::config::PeerConfig::default(),
            relay: crate::config::RelayConfig::default(),
            datagram: crate::config::DatagramConfig::default(),
            management_public_key: None,
        }
    }

    #[test]
    fn edge_table_round_trips_peer_binding() {
        let edges = EdgeTable::new();
        let peer = AgentId::random();
        let local = edges.bind(peer, 42, Proto::Tcp);
        assert_eq!(edges.local_for(peer, 42), Some(local));
        assert_eq!(edges.peer_for(local).map(|(p, id, _)| (p, id)), Some((peer, 42)));
        edges.remove_local(local);
        assert_eq!(edges.local_for(peer, 42), None);
    }

    #[tokio::test]
    async fn new_agent_starts_with_no_peers_or_relays() {
        let dir = test_config("construct");
        let identity = AgentIdentity::load_or_create(&dir.data_dir).unwrap();
        let core = AgentCore::new(dir.clone(), identity);
        assert!(core.peers.peer_ids().is_empty());
        assert!(core.relay.is_empty());
        let _ = std::fs::remove_dir_all(&dir.data_dir);
    }

    #[tokio::test]
    async fn disconnect_clears_bound_streams_pending_opens_and_datagram_associations() {
        let dir = test_config("disconnect-cleanup");
        let identity = AgentIdentity::load_or_create(&dir.data_dir).unwrap();
        let core = AgentCore::new(dir.clone(), identity);

        let dying = AgentId::random();
        let survivor = AgentId::random();

        // A live, already-acked TCP edge facing the dying peer.
        let local_id = core.edges.bind(dying, 7, Proto::Tcp);
        let initiator_pub = EphemeralKeypair::generate().public;
        let key = Arc::new(SessionKey::derive_responder(EphemeralKeypair::generate(), 1, &initiator_pub).unwrap());
        core.streams.register_responder_stream(dying, local_id, key);

        // A pending (not yet acked) open routed through the same peer.
        let (_, mut pending_rx, _) = core.streams.begin_open(dying, 99);

        // A live UDP leg and a live ICMP session through the dying peer.
        let (base_id, _udp_rx) = core.open_udp_association();
        let dest: IpAddr = "93.184.216.34".parse().unwrap();
        core.udp_associations.get(&base_id).unwrap().get_or_create(dest, dying, survivor, 1);
        core.icmp_ingress.get_or_create(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 35)), 42, dying, survivor, 2);

        core.handle_peer_disconnect(dying, DisconnectReason::TransportError).await;

        assert_eq!(core.edges.local_for(dying, 7), None);
        assert!(core.streams.get(local_id).is_none());
        assert!(matches!(
            pending_rx.try_recv().unwrap(),
            Err(StreamError::Refused { code: OpenErrorCode::GeneralFailure, .. })
        ));
        assert!(matches!(
            core.udp_associations.get(&base_id).unwrap().get_or_create(dest, dying, survivor, 3),
            GetOrCreateOutcome::Created { .. }
        ));
        assert!(matches!(
            core.icmp_ingress.get_or_create(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 35)), 42, dying, survivor, 4),
            GetOrCreateOutcome::Created { .. }
        ));

        let _ = std::fs::remove_dir_all(&dir.data_dir);
    }
}
