//! End-to-end scenarios driving `AgentCore` entry points directly, with no
//! SOCKS5 front-end and no real network transport: agents are wired
//! together with in-process `tokio::io::duplex()` pairs registered via
//! `PeerManager::register`, bypassing the handshake/dial/accept dance, and
//! routes are seeded straight into each agent's `RoutingTable` instead of
//! waiting on flood convergence.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use muti_metroo::agent::AgentCore;
use muti_metroo::codec::WireAddr;
use muti_metroo::config::{AgentConfig, DatagramConfig, FloodingConfig, LocalRoutesConfig, PeerConfig, RelayConfig};
use muti_metroo::identity::{AgentId, AgentIdentity};
use muti_metroo::peer::DisconnectReason;
use muti_metroo::routing::Route;
use muti_metroo::transport::TransportType;

fn test_config(display_name: &str, cidrs: Vec<String>) -> AgentConfig {
    AgentConfig {
        data_dir: std::env::temp_dir().join(format!("muti-metroo-it-{}", AgentId::random())),
        display_name: display_name.to_string(),
        listeners: Vec::new(),
        dial_targets: Vec::new(),
        local_routes: LocalRoutesConfig {
            cidrs,
            domains: Vec::new(),
            tunnels: Vec::new(),
        },
        flooding: FloodingConfig::default(),
        peer: PeerConfig::default(),
        relay: RelayConfig::default(),
        datagram: DatagramConfig::default(),
        management_public_key: None,
    }
}

fn spawn_agent(config: AgentConfig) -> Arc<AgentCore> {
    let identity = AgentIdentity::load_or_create(&config.data_dir).unwrap();
    let core = AgentCore::new(config, identity);
    core.run();
    core
}

/// Wires two agents together as mesh peers over an in-process duplex pipe,
/// skipping the real handshake entirely.
async fn link(a: &Arc<AgentCore>, b: &Arc<AgentCore>) {
    let (a_side, b_side) = tokio::io::duplex(1 << 16);
    a.peers
        .register(b.identity.id, b.config.display_name.clone(), TransportType::Quic, true, Box::new(a_side))
        .expect("fresh registration never loses the tie-break");
    b.peers
        .register(a.identity.id, a.config.display_name.clone(), TransportType::Quic, false, Box::new(b_side))
        .expect("fresh registration never loses the tie-break");
}

/// Seeds a CIDR route into `core`'s routing table as if it had been learned
/// by flooding: `path` is the hop sequence starting at the next agent past
/// `core` itself, ending at `origin`.
async fn seed_route(core: &Arc<AgentCore>, cidr: &str, origin: AgentId, path: Vec<AgentId>) {
    let net = cidr.parse().unwrap();
    let next_hop = path[0];
    core.routing
        .write()
        .await
        .accept_cidr_route(
            net,
            Route {
                origin,
                next_hop,
                path,
                metric: 1,
                sequence: 1,
                last_seen: Instant::now(),
            },
        )
        .unwrap();
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    addr
}

/// Hands `core` a freshly-accepted local socket standing in for what a
/// SOCKS5 front-end would pass to `open_tcp_stream`, and returns the other
/// end of that loopback pipe for the test to drive as "the real client".
async fn local_client_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    (accepted, connect.await.unwrap())
}

const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn three_hop_chain_forwards_tcp_end_to_end() {
    let ingress = spawn_agent(test_config("ingress", vec![]));
    let transit = spawn_agent(test_config("transit", vec![]));
    let exit = spawn_agent(test_config("exit", vec!["127.0.0.0/8".to_string()]));
    link(&ingress, &transit).await;
    link(&transit, &exit).await;

    let echo_addr = spawn_tcp_echo().await;
    let SocketAddr::V4(echo_v4) = echo_addr else { unreachable!() };
    seed_route(&ingress, "127.0.0.0/8", exit.identity.id, vec![transit.identity.id, exit.identity.id]).await;

    let (accepted, mut real_client) = local_client_pair().await;
    timeout(SHORT_TIMEOUT, ingress.open_tcp_stream(accepted, WireAddr::V4(*echo_v4.ip()), echo_v4.port()))
        .await
        .expect("open_tcp_stream did not time out")
        .expect("chain is fully connected and exit allows the destination");

    real_client.write_all(b"hello through the mesh").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(SHORT_TIMEOUT, real_client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"hello through the mesh");
}

#[tokio::test]
async fn cidr_allow_list_refuses_destinations_outside_it() {
    let ingress = spawn_agent(test_config("ingress", vec![]));
    let exit = spawn_agent(test_config("exit", vec!["127.0.0.0/8".to_string()]));
    link(&ingress, &exit).await;

    let echo_addr = spawn_tcp_echo().await;
    let SocketAddr::V4(echo_v4) = echo_addr else { unreachable!() };
    // One route covers both destinations; the allow/deny distinction lives
    // in the exit's own config, not in what the ingress has learned.
    seed_route(&ingress, "0.0.0.0/0", exit.identity.id, vec![exit.identity.id]).await;

    let (allowed_accept, mut allowed_client) = local_client_pair().await;
    timeout(SHORT_TIMEOUT, ingress.open_tcp_stream(allowed_accept, WireAddr::V4(*echo_v4.ip()), echo_v4.port()))
        .await
        .unwrap()
        .expect("127.0.0.0/8 is in the exit's allow-list");
    allowed_client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(SHORT_TIMEOUT, allowed_client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");

    let (denied_accept, _denied_client) = local_client_pair().await;
    let result = timeout(
        SHORT_TIMEOUT,
        ingress.open_tcp_stream(denied_accept, WireAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8080),
    )
    .await
    .unwrap();
    assert!(result.is_err(), "10.0.0.1 is outside the exit's allow-list and must be refused");
}

#[tokio::test]
async fn half_close_propagates_to_the_destination_socket() {
    let ingress = spawn_agent(test_config("ingress", vec![]));
    let exit = spawn_agent(test_config("exit", vec!["127.0.0.0/8".to_string()]));
    link(&ingress, &exit).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let SocketAddr::V4(server_v4) = server_addr else { unreachable!() };
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(received, b"CLIENT_DATA_BEFORE_HALFCLOSE");
        sock.write_all(b"SERVER_RESPONSE_AFTER_HALFCLOSE").await.unwrap();
        let _ = sock.shutdown().await;
    });

    seed_route(&ingress, "127.0.0.0/8", exit.identity.id, vec![exit.identity.id]).await;

    let (accepted, mut real_client) = local_client_pair().await;
    timeout(SHORT_TIMEOUT, ingress.open_tcp_stream(accepted, WireAddr::V4(*server_v4.ip()), server_v4.port()))
        .await
        .unwrap()
        .unwrap();

    real_client.write_all(b"CLIENT_DATA_BEFORE_HALFCLOSE").await.unwrap();
    real_client.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(SHORT_TIMEOUT, real_client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, b"SERVER_RESPONSE_AFTER_HALFCLOSE");
}

#[tokio::test]
async fn transit_disconnect_clears_its_relay_table() {
    let ingress = spawn_agent(test_config("ingress", vec![]));
    let transit = spawn_agent(test_config("transit", vec![]));
    let exit = spawn_agent(test_config("exit", vec!["127.0.0.0/8".to_string()]));
    link(&ingress, &transit).await;
    link(&transit, &exit).await;

    let echo_addr = spawn_tcp_echo().await;
    let SocketAddr::V4(echo_v4) = echo_addr else { unreachable!() };
    seed_route(&ingress, "127.0.0.0/8", exit.identity.id, vec![transit.identity.id, exit.identity.id]).await;

    let (accepted, mut real_client) = local_client_pair().await;
    timeout(SHORT_TIMEOUT, ingress.open_tcp_stream(accepted, WireAddr::V4(*echo_v4.ip()), echo_v4.port()))
        .await
        .unwrap()
        .unwrap();
    real_client.write_all(b"warm up the relay entry").await.unwrap();
    let mut buf = [0u8; 64];
    timeout(SHORT_TIMEOUT, real_client.read(&mut buf)).await.unwrap().unwrap();
    assert!(!transit.relay.is_empty(), "forwarding the open should have left a live relay entry at the transit hop");

    transit.peers.disconnect(&ingress.identity.id, DisconnectReason::TransportError);

    let deadline = Instant::now() + SHORT_TIMEOUT;
    while !transit.relay.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(transit.relay.is_empty(), "disconnect_loop should have torn down every relay entry touching the dead peer");
}

#[tokio::test]
async fn concurrent_udp_sends_to_one_destination_share_one_association() {
    let ingress = spawn_agent(test_config("ingress", vec![]));
    let exit = spawn_agent(test_config("exit", vec!["127.0.0.0/8".to_string()]));
    link(&ingress, &exit).await;
    seed_route(&ingress, "127.0.0.0/8", exit.identity.id, vec![exit.identity.id]).await;

    let dest_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = dest_socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((n, from)) = dest_socket.recv_from(&mut buf).await else { return };
            let _ = dest_socket.send_to(&buf[..n], from).await;
        }
    });

    let (base_stream_id, mut deliveries) = ingress.open_udp_association();
    timeout(SHORT_TIMEOUT, ingress.send_udp_datagram(base_stream_id, dest_addr, b"first"))
        .await
        .unwrap()
        .unwrap();
    timeout(SHORT_TIMEOUT, ingress.send_udp_datagram(base_stream_id, dest_addr, b"second"))
        .await
        .unwrap()
        .unwrap();

    let SocketAddr::V4(dest_v4) = dest_addr else { unreachable!() };
    let (from_first, payload_first) = timeout(SHORT_TIMEOUT, deliveries.recv()).await.unwrap().unwrap();
    let (from_second, payload_second) = timeout(SHORT_TIMEOUT, deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(from_first, IpAddr::V4(*dest_v4.ip()));
    assert_eq!(from_second, from_first);
    let mut payloads = vec![payload_first, payload_second];
    payloads.sort();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);

    ingress.close_udp_association(base_stream_id);
}
