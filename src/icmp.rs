//! Raw ICMPv4 echo at the exit agent. Requires `CAP_NET_RAW` (or root) at
//! runtime; session bookkeeping in `datagram::IcmpSessions` works regardless
//! of whether the raw socket can actually be opened, so a permission failure
//! surfaces as `IcmpDisabled` at open time rather than a panic later.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

pub struct IcmpSocket {
    socket: Arc<Socket>,
}

impl IcmpSocket {
    pub fn open_v4() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        Ok(Self { socket: Arc::new(socket) })
    }

    pub fn send_echo_request(&self, dest: Ipv4Addr, identifier: u16, sequence: u16, payload: &[u8]) -> io::Result<()> {
        let packet = build_echo_packet(ICMP_ECHO_REQUEST, identifier, sequence, payload);
        let addr = SockAddr::from(std::net::SocketAddrV4::new(dest, 0));
        self.socket.send_to(&packet, &addr)?;
        Ok(())
    }

    /// Spawns a blocking reader loop and returns a channel of
    /// `(source, identifier, sequence, payload)` for inbound echo replies.
    pub fn spawn_reader(&self) -> mpsc::Receiver<(Ipv4Addr, u16, u16, Vec<u8>)> {
        let (tx, rx) = mpsc::channel(256);
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || loop {
            let mut buf = [std::mem::MaybeUninit::uninit(); 2048];
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
                    if let Some((identifier, sequence, payload)) = parse_echo_reply(&bytes) {
                        if let Some(addr) = from.as_socket_ipv4() {
                            if tx.blocking_send((*addr.ip(), identifier, sequence, payload)).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(_) => return,
            }
        });
        rx
    }
}

fn build_echo_packet(icmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(icmp_type);
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// The raw socket delivers the IP header along with the ICMP payload; strip
/// it off using the header's declared length before reading the ICMP fields.
fn parse_echo_reply(ip_packet: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    if ip_packet.len() < 20 {
        return None;
    }
    let ihl = (ip_packet[0] & 0x0f) as usize * 4;
    let icmp = ip_packet.get(ihl..)?;
    if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REPLY {
        return None;
    }
    let identifier = u16::from_be_bytes([icmp[4], icmp[5]]);
    let sequence = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((identifier, sequence, icmp[8..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_own_packet_is_internally_consistent() {
        let packet = build_echo_packet(ICMP_ECHO_REQUEST, 42, 1, b"ping");
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn parse_echo_reply_rejects_short_packets() {
        assert!(parse_echo_reply(&[0u8; 10]).is_none());
    }

    #[test]
    fn parse_echo_reply_rejects_non_reply_type() {
        let request = build_echo_packet(ICMP_ECHO_REQUEST, 1, 1, b"x");
        let mut ip_packet = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        ip_packet.extend_from_slice(&request);
        assert!(parse_echo_reply(&ip_packet).is_none());
    }
}
