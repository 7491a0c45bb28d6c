//! Fixed binary wire format: `type(u8) | flags(u8) | stream_id(u64) |
//! payload_len(u32) | payload`, big-endian throughout.

use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::CodecError;
use crate::identity::AgentId;
use crate::routing::PeerSummary;

pub const MAX_PAYLOAD: usize = 65536;
pub const HEADER_LEN: usize = 1 + 1 + 8 + 4;
pub const FIN_WRITE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    StreamOpen = 1,
    StreamOpenAck = 2,
    StreamOpenErr = 3,
    StreamData = 4,
    StreamClose = 5,
    StreamReset = 6,
    RouteAdvertise = 7,
    RouteWithdraw = 8,
    NodeInfoAdvertise = 9,
    Keepalive = 10,
    KeepaliveAck = 11,
    ControlRequest = 12,
    ControlResponse = 13,
    UdpOpen = 14,
    UdpOpenAck = 15,
    UdpOpenErr = 16,
    UdpDatagram = 17,
    UdpClose = 18,
    IcmpOpen = 19,
    IcmpOpenAck = 20,
    IcmpOpenErr = 21,
    IcmpEcho = 22,
    IcmpClose = 23,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        use FrameType::*;
        Ok(match v {
            1 => StreamOpen,
            2 => StreamOpenAck,
            3 => StreamOpenErr,
            4 => StreamData,
            5 => StreamClose,
            6 => StreamReset,
            7 => RouteAdvertise,
            8 => RouteWithdraw,
            9 => NodeInfoAdvertise,
            10 => Keepalive,
            11 => KeepaliveAck,
            12 => ControlRequest,
            13 => ControlResponse,
            14 => UdpOpen,
            15 => UdpOpenAck,
            16 => UdpOpenErr,
            17 => UdpDatagram,
            18 => UdpClose,
            19 => IcmpOpen,
            20 => IcmpOpenAck,
            21 => IcmpOpenErr,
            22 => IcmpEcho,
            23 => IcmpClose,
            other => return Err(CodecError::UnknownFrameType(other)),
        })
    }
}

/// A decoded (or to-be-encoded) frame header plus opaque payload bytes. The
/// payload's internal structure depends on `frame_type` and is encoded /
/// decoded by the helpers below — the header itself knows nothing about it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: u64, payload: Vec<u8>) -> Result<Self, CodecError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload.len(), MAX_PAYLOAD));
        }
        Ok(Self {
            frame_type,
            flags: 0,
            stream_id,
            payload,
        })
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn fin_write(&self) -> bool {
        self.flags & FIN_WRITE != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags);
        buf.put_u64(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Attempt to decode one frame from the front of `buf`, advancing it
    /// past the consumed bytes on success. Returns `None` if `buf` does not
    /// yet contain a full frame (caller should read more and retry).
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Self>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let frame_type_byte = buf[0];
        let flags = buf[1];
        let stream_id = u64::from_be_bytes(buf[2..10].try_into().unwrap());
        let payload_len = u32::from_be_bytes(buf[10..14].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload_len, MAX_PAYLOAD));
        }
        if buf.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }
        let frame_type = FrameType::from_u8(frame_type_byte)?;
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(payload_len).to_vec();
        Ok(Some(Self {
            frame_type,
            flags,
            stream_id,
            payload,
        }))
    }
}

/// An address as carried in `STREAM_OPEN` / `UDP_OPEN` / ack payloads.
#[derive(Debug, PartialEq, Eq)]
pub enum WireAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

const ATYP_V4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_V6: u8 = 4;

impl WireAddr {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            WireAddr::V4(ip) => {
                buf.put_u8(ATYP_V4);
                buf.put_slice(&ip.octets());
            }
            WireAddr::V6(ip) => {
                buf.put_u8(ATYP_V6);
                buf.put_slice(&ip.octets());
            }
            WireAddr::Domain(name) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let atyp = read_u8(buf)?;
        match atyp {
            ATYP_V4 => {
                let bytes = read_n::<4>(buf)?;
                Ok(WireAddr::V4(Ipv4Addr::from(bytes)))
            }
            ATYP_V6 => {
                let bytes = read_n::<16>(buf)?;
                Ok(WireAddr::V6(Ipv6Addr::from(bytes)))
            }
            ATYP_DOMAIN => {
                let len = read_u8(buf)? as usize;
                if buf.len() < len {
                    return Err(CodecError::Truncated);
                }
                let name = String::from_utf8(buf[..len].to_vec())
                    .map_err(|_| CodecError::Malformed("domain is not valid utf-8"))?;
                *buf = &buf[len..];
                Ok(WireAddr::Domain(name))
            }
            other => Err(CodecError::UnknownAddrType(other)),
        }
    }
}

impl From<IpAddr> for WireAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => WireAddr::V4(v4),
            IpAddr::V6(v6) => WireAddr::V6(v6),
        }
    }
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Truncated);
    }
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

fn read_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    let bytes = read_n::<2>(buf)?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    let bytes = read_n::<4>(buf)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    let bytes = read_n::<8>(buf)?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode_agent_id_vec(buf: &mut BytesMut, ids: &[AgentId]) {
    buf.put_u8(ids.len().min(255) as u8);
    for id in ids.iter().take(255) {
        buf.put_slice(&id.0);
    }
}

fn decode_agent_id_vec(buf: &mut &[u8]) -> Result<Vec<AgentId>, CodecError> {
    let len = read_u8(buf)? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(AgentId(read_n::<32>(buf)?));
    }
    Ok(out)
}

fn encode_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u16(bytes.len().min(u16::MAX as usize) as u16);
    buf.put_slice(&bytes[..bytes.len().min(u16::MAX as usize)]);
}

fn decode_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    let len = read_u16(buf)? as usize;
    if buf.len() < len {
        return Err(CodecError::Truncated);
    }
    let s = String::from_utf8(buf[..len].to_vec()).map_err(|_| CodecError::Malformed("string is not valid utf-8"))?;
    *buf = &buf[len..];
    Ok(s)
}

fn encode_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u16(bytes.len().min(u16::MAX as usize) as u16);
    buf.put_slice(&bytes[..bytes.len().min(u16::MAX as usize)]);
}

fn decode_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_u16(buf)? as usize;
    if buf.len() < len {
        return Err(CodecError::Truncated);
    }
    let out = buf[..len].to_vec();
    *buf = &buf[len..];
    Ok(out)
}

/// Plaintext encoding of a peer-summary list, sealed with `crypto::seal_box`
/// before it ever reaches the wire (see `NodeInfoAdvertiseBody::sealed_peers`).
pub fn encode_peer_summaries(peers: &[PeerSummary]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(peers.len().min(u16::MAX as usize) as u16);
    for p in peers.iter().take(u16::MAX as usize) {
        buf.put_slice(&p.peer_id.0);
        encode_string(&mut buf, &p.transport);
        buf.put_u32(p.rtt_ms);
        buf.put_u8(p.is_dialer as u8);
    }
    buf.to_vec()
}

pub fn decode_peer_summaries(buf: &[u8]) -> Result<Vec<PeerSummary>, CodecError> {
    let mut buf = buf;
    let len = read_u16(&mut buf)? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let peer_id = AgentId(read_n::<32>(&mut buf)?);
        let transport = decode_string(&mut buf)?;
        let rtt_ms = read_u32(&mut buf)?;
        let is_dialer = read_u8(&mut buf)? != 0;
        out.push(PeerSummary {
            peer_id,
            transport,
            rtt_ms,
            is_dialer,
        });
    }
    Ok(out)
}

/// What a `ROUTE_ADVERTISE` / `ROUTE_WITHDRAW` entry describes: a CIDR
/// block, a domain (possibly wildcard) pattern, or an opaque tunnel key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    Cidr(ipnet::IpNet),
    Domain(String),
    Tunnel(String),
}

const ROUTE_KIND_CIDR: u8 = 1;
const ROUTE_KIND_DOMAIN: u8 = 2;
const ROUTE_KIND_TUNNEL: u8 = 3;

impl RouteKind {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            RouteKind::Cidr(net) => {
                buf.put_u8(ROUTE_KIND_CIDR);
                encode_string(buf, &net.to_string());
            }
            RouteKind::Domain(pattern) => {
                buf.put_u8(ROUTE_KIND_DOMAIN);
                encode_string(buf, pattern);
            }
            RouteKind::Tunnel(key) => {
                buf.put_u8(ROUTE_KIND_TUNNEL);
                encode_string(buf, key);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        match read_u8(buf)? {
            ROUTE_KIND_CIDR => {
                let text = decode_string(buf)?;
                let net = text.parse().map_err(|_| CodecError::Malformed("invalid CIDR in route advertisement"))?;
                Ok(RouteKind::Cidr(net))
            }
            ROUTE_KIND_DOMAIN => Ok(RouteKind::Domain(decode_string(buf)?)),
            ROUTE_KIND_TUNNEL => Ok(RouteKind::Tunnel(decode_string(buf)?)),
            _ => Err(CodecError::Malformed("unknown route kind")),
        }
    }
}

/// `ROUTE_ADVERTISE` payload. `next_hop` is never carried on the wire: each
/// recipient sets it to whichever peer the frame arrived from.
#[derive(Debug, Clone)]
pub struct RouteAdvertiseBody {
    pub kind: RouteKind,
    pub origin: AgentId,
    pub sequence: u32,
    pub metric: u16,
    pub path: Vec<AgentId>,
    pub seen_by: Vec<AgentId>,
}

impl RouteAdvertiseBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.kind.encode(&mut buf);
        buf.put_slice(&self.origin.0);
        buf.put_u32(self.sequence);
        buf.put_u16(self.metric);
        encode_agent_id_vec(&mut buf, &self.path);
        encode_agent_id_vec(&mut buf, &self.seen_by);
        buf.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut buf = buf;
        let kind = RouteKind::decode(&mut buf)?;
        let origin = AgentId(read_n::<32>(&mut buf)?);
        let sequence = read_u32(&mut buf)?;
        let metric = read_u16(&mut buf)?;
        let path = decode_agent_id_vec(&mut buf)?;
        let seen_by = decode_agent_id_vec(&mut buf)?;
        Ok(Self {
            kind,
            origin,
            sequence,
            metric,
            path,
            seen_by,
        })
    }
}

/// `ROUTE_WITHDRAW` payload: only CIDR routes are ever explicitly withdrawn
/// (domain and tunnel routes age out via TTL instead).
#[derive(Debug, Clone)]
pub struct RouteWithdrawBody {
    pub net: ipnet::IpNet,
    pub origin: AgentId,
    pub sequence: u32,
}

impl RouteWithdrawBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, &self.net.to_string());
        buf.put_slice(&self.origin.0);
        buf.put_u32(self.sequence);
        buf.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut buf = buf;
        let text = decode_string(&mut buf)?;
        let net = text.parse().map_err(|_| CodecError::Malformed("invalid CIDR in route withdrawal"))?;
        let origin = AgentId(read_n::<32>(&mut buf)?);
        let sequence = read_u32(&mut buf)?;
        Ok(Self { net, origin, sequence })
    }
}

/// `NODE_INFO_ADVERTISE` payload, one per origin agent per flood cycle.
/// `sealed_peers` is the output of `crypto::seal_box` over an
/// `encode_peer_summaries` payload, present only when the origin has a
/// `management_public_key` configured; transit agents forward it without
/// being able to open it.
#[derive(Debug, Clone)]
pub struct NodeInfoAdvertiseBody {
    pub origin: AgentId,
    pub sequence: u32,
    pub display_name: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub peer_count: u16,
    pub static_pubkey: [u8; 32],
    pub udp_capable: bool,
    pub sealed_peers: Vec<u8>,
}

impl NodeInfoAdvertiseBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.origin.0);
        buf.put_u32(self.sequence);
        encode_string(&mut buf, &self.display_name);
        encode_string(&mut buf, &self.hostname);
        buf.put_u64(self.uptime_secs);
        buf.put_u16(self.peer_count);
        buf.put_slice(&self.static_pubkey);
        buf.put_u8(self.udp_capable as u8);
        encode_bytes(&mut buf, &self.sealed_peers);
        buf.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut buf = buf;
        let origin = AgentId(read_n::<32>(&mut buf)?);
        let sequence = read_u32(&mut buf)?;
        let display_name = decode_string(&mut buf)?;
        let hostname = decode_string(&mut buf)?;
        let uptime_secs = read_u64(&mut buf)?;
        let peer_count = read_u16(&mut buf)?;
        let static_pubkey = read_n::<32>(&mut buf)?;
        let udp_capable = read_u8(&mut buf)? != 0;
        let sealed_peers = decode_bytes(&mut buf)?;
        Ok(Self {
            origin,
            sequence,
            display_name,
            hostname,
            uptime_secs,
            peer_count,
            static_pubkey,
            udp_capable,
            sealed_peers,
        })
    }
}

fn read_n<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], CodecError> {
    if buf.len() < N {
        return Err(CodecError::Truncated);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(out)
}

/// `STREAM_OPEN` / `UDP_OPEN` payload body.
#[derive(Debug, Clone)]
pub struct OpenBody {
    pub request_id: u64,
    pub addr: WireAddr,
    pub port: u16,
    pub ttl: u8,
    pub remaining_path: Vec<AgentId>,
    pub ephemeral_pub: [u8; 32],
}

impl OpenBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64(self.request_id);
        self.addr.encode(&mut buf);
        buf.put_u16(self.port);
        buf.put_u8(self.ttl);
        buf.put_u8(self.remaining_path.len() as u8);
        for hop in &self.remaining_path {
            buf.put_slice(&hop.0);
        }
        buf.put_slice(&self.ephemeral_pub);
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let request_id = read_u64(&mut buf)?;
        let addr = WireAddr::decode(&mut buf)?;
        let port = read_u16(&mut buf)?;
        let ttl = read_u8(&mut buf)?;
        let path_len = read_u8(&mut buf)? as usize;
        let mut remaining_path = Vec::with_capacity(path_len);
        for _ in 0..path_len {
            remaining_path.push(AgentId(read_n::<32>(&mut buf)?));
        }
        let ephemeral_pub = read_n::<32>(&mut buf)?;
        Ok(Self {
            request_id,
            addr,
            port,
            ttl,
            remaining_path,
            ephemeral_pub,
        })
    }

    /// Shift the remaining path by one hop, for forwarding at a transit node.
    pub fn shifted(&self) -> Self {
        let mut shifted = self.clone();
        if !shifted.remaining_path.is_empty() {
            shifted.remaining_path.remove(0);
        }
        shifted
    }
}

impl Clone for WireAddr {
    fn clone(&self) -> Self {
        match self {
            WireAddr::V4(a) => WireAddr::V4(*a),
            WireAddr::V6(a) => WireAddr::V6(*a),
            WireAddr::Domain(s) => WireAddr::Domain(s.clone()),
        }
    }
}

/// `STREAM_OPEN_ACK` / `UDP_OPEN_ACK` payload body.
#[derive(Debug, Clone)]
pub struct OpenAckBody {
    pub request_id: u64,
    pub bound_addr: WireAddr,
    pub bound_port: u16,
    pub ephemeral_pub: [u8; 32],
}

impl OpenAckBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64(self.request_id);
        self.bound_addr.encode(&mut buf);
        buf.put_u16(self.bound_port);
        buf.put_slice(&self.ephemeral_pub);
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let request_id = read_u64(&mut buf)?;
        let bound_addr = WireAddr::decode(&mut buf)?;
        let bound_port = read_u16(&mut buf)?;
        let ephemeral_pub = read_n::<32>(&mut buf)?;
        Ok(Self {
            request_id,
            bound_addr,
            bound_port,
            ephemeral_pub,
        })
    }

    pub fn bound_socket_addr(&self) -> Option<SocketAddr> {
        match &self.bound_addr {
            WireAddr::V4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.bound_port)),
            WireAddr::V6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.bound_port)),
            WireAddr::Domain(_) => None,
        }
    }
}

/// `STREAM_OPEN_ERR` / `UDP_OPEN_ERR` payload body.
#[derive(Debug, Clone)]
pub struct OpenErrBody {
    pub request_id: u64,
    pub code: u16,
    pub message: String,
}

impl OpenErrBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64(self.request_id);
        buf.put_u16(self.code);
        let msg_bytes = self.message.as_bytes();
        buf.put_u16(msg_bytes.len() as u16);
        buf.put_slice(msg_bytes);
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let request_id = read_u64(&mut buf)?;
        let code = read_u16(&mut buf)?;
        let msg_len = read_u16(&mut buf)? as usize;
        if buf.len() < msg_len {
            return Err(CodecError::Truncated);
        }
        let message = String::from_utf8(buf[..msg_len].to_vec())
            .map_err(|_| CodecError::Malformed("error message is not valid utf-8"))?;
        Ok(Self {
            request_id,
            code,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = Frame::new(FrameType::StreamData, 42, b"hello".to_vec())
            .unwrap()
            .with_flags(FIN_WRITE);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.flags, FIN_WRITE);
        assert_eq!(decoded.payload, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn try_decode_waits_for_full_frame() {
        let frame = Frame::new(FrameType::Keepalive, 0, vec![1, 2, 3]).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(Frame::try_decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(Frame::new(FrameType::StreamData, 1, payload).is_err());
    }

    #[test]
    fn open_body_round_trips_with_domain_and_path() {
        let body = OpenBody {
            request_id: 7,
            addr: WireAddr::Domain("example.com".to_string()),
            port: 443,
            ttl: 16,
            remaining_path: vec![AgentId([1u8; 32]), AgentId([2u8; 32])],
            ephemeral_pub: [9u8; 32],
        };
        let encoded = body.encode();
        let decoded = OpenBody::decode(&encoded).unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.addr, WireAddr::Domain("example.com".to_string()));
        assert_eq!(decoded.remaining_path.len(), 2);

        let shifted = decoded.shifted();
        assert_eq!(shifted.remaining_path, vec![AgentId([2u8; 32])]);
    }

    #[test]
    fn open_ack_body_round_trips() {
        let body = OpenAckBody {
            request_id: 99,
            bound_addr: WireAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            bound_port: 8080,
            ephemeral_pub: [3u8; 32],
        };
        let decoded = OpenAckBody::decode(&body.encode()).unwrap();
        assert_eq!(
            decoded.bound_socket_addr(),
            Some("10.0.0.1:8080".parse().unwrap())
        );
    }

    #[test]
    fn route_advertise_body_round_trips() {
        let body = RouteAdvertiseBody {
            kind: RouteKind::Cidr("10.0.0.0/8".parse().unwrap()),
            origin: AgentId([4u8; 32]),
            sequence: 9,
            metric: 2,
            path: vec![AgentId([1u8; 32]), AgentId([4u8; 32])],
            seen_by: vec![AgentId([1u8; 32])],
        };
        let decoded = RouteAdvertiseBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded.kind, RouteKind::Cidr("10.0.0.0/8".parse().unwrap()));
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.path.len(), 2);
    }

    #[test]
    fn node_info_advertise_body_round_trips() {
        let body = NodeInfoAdvertiseBody {
            origin: AgentId([7u8; 32]),
            sequence: 1,
            display_name: "relay-1".to_string(),
            hostname: "relay-1.local".to_string(),
            uptime_secs: 3600,
            peer_count: 3,
            static_pubkey: [9u8; 32],
            udp_capable: true,
            sealed_peers: vec![1, 2, 3, 4],
        };
        let decoded = NodeInfoAdvertiseBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded.display_name, "relay-1");
        assert!(decoded.udp_capable);
        assert_eq!(decoded.sealed_peers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn peer_summaries_round_trip() {
        let peers = vec![
            PeerSummary {
                peer_id: AgentId([1u8; 32]),
                transport: "quic".to_string(),
                rtt_ms: 42,
                is_dialer: true,
            },
            PeerSummary {
                peer_id: AgentId([2u8; 32]),
                transport: "wss".to_string(),
                rtt_ms: 7,
                is_dialer: false,
            },
        ];
        let encoded = encode_peer_summaries(&peers);
        let decoded = decode_peer_summaries(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].transport, "quic");
        assert_eq!(decoded[1].rtt_ms, 7);
    }

    #[test]
    fn open_err_body_round_trips() {
        let body = OpenErrBody {
            request_id: 5,
            code: 1,
            message: "host unreachable".to_string(),
        };
        let decoded = OpenErrBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded.message, "host unreachable");
    }
}
