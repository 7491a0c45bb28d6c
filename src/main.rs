//! Muti Metroo - encrypted overlay mesh-routing agent
//!
//! Thin process entry point: load configuration and identity, bind every
//! configured listener, dial every configured outbound target, then run
//! the agent core until interrupted. Argument parsing here is deliberately
//! minimal — a config file path and a verbosity flag — since everything
//! that matters is expressed in the config file consumed by
//! [`muti_metroo::config::AgentConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use muti_metroo::config::{AgentConfig, DialTargetConfig, ListenerConfig, TransportKind};
use muti_metroo::identity::AgentIdentity;
use muti_metroo::peer::{self, ReconnectPolicy};
use muti_metroo::tls;
use muti_metroo::transport::h2::{self, H2Dialer};
use muti_metroo::transport::quic::{self, QuicDialer};
use muti_metroo::transport::wss::{self, WssDialer};
use muti_metroo::transport::{TransportDialer, TransportListener};
use muti_metroo::AgentCore;

#[derive(Parser)]
#[command(name = "muti-metroo")]
#[command(author = "Sina Rabbani")]
#[command(version)]
#[command(about = "Overlay mesh-routing agent", long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AgentConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let identity = AgentIdentity::load_or_create(&config.data_dir)
        .with_context(|| format!("loading identity from {}", config.data_dir.display()))?;
    log::info!("agent {} starting as \"{}\"", identity.id, config.display_name);

    let core = AgentCore::new(config.clone(), identity);
    core.run();

    for listener in &config.listeners {
        spawn_listener(&core, listener.clone()).await?;
    }
    for target in &config.dial_targets {
        spawn_dialer(&core, target.clone());
    }

    tokio::signal::ctrl_c().await?;
    log::info!("received shutdown signal, exiting");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

/// Binds one configured listener and spawns its accept loop. Each accepted
/// connection gets its own handshake-and-register task so one slow or
/// hostile dialer can never block the listener.
async fn spawn_listener(core: &Arc<AgentCore>, listener: ListenerConfig) -> Result<()> {
    let alpn = listener.alpn.clone().into_bytes();
    let subject = hex::encode(core.identity.id.as_bytes());
    let tls_material = tls::generate(&subject, &alpn)?;

    match listener.transport {
        TransportKind::Quic => {
            let bound = quic::bind(listener.listen_addr, tls_material.server_config).await?;
            log::info!("quic listener bound on {}", bound.local_addr());
            spawn_accept_loop(core.clone(), Arc::new(bound));
        }
        TransportKind::Wss => {
            let bound = wss::bind(listener.listen_addr, tls_material.server_config).await?;
            log::info!("wss listener bound on {}", bound.local_addr());
            spawn_accept_loop(core.clone(), Arc::new(bound));
        }
        TransportKind::H2 => {
            let bound = h2::bind(listener.listen_addr, tls_material.server_config).await?;
            log::info!("h2 listener bound on {}", bound.local_addr());
            spawn_accept_loop(core.clone(), Arc::new(bound));
        }
    }
    Ok(())
}

fn spawn_accept_loop<L>(core: Arc<AgentCore>, listener: Arc<L>)
where
    L: TransportListener + 'static,
{
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let core = core.clone();
                    tokio::spawn(async move {
                        let display_name = core.config.display_name.clone();
                        match peer::accept_and_register(&core.peers, conn, core.identity.id, &display_name).await {
                            Ok(p) => log::info!("accepted peer {} over {}", p.remote_id, p.transport_type),
                            Err(e) => log::warn!("inbound handshake failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    log::warn!("listener accept failed, stopping: {}", e);
                    return;
                }
            }
        }
    });
}

/// Dials one configured outbound target. Non-persistent targets dial once;
/// persistent ones reconnect with backoff for as long as the process runs.
/// A persistent target only redials after its connection actually drops —
/// the disconnect broadcast is subscribed before each dial attempt so a
/// disconnect racing the attempt itself can never be missed.
fn spawn_dialer(core: &Arc<AgentCore>, target: DialTargetConfig) {
    let core = core.clone();
    tokio::spawn(async move {
        let policy = ReconnectPolicy {
            initial: std::time::Duration::from_millis(core.config.peer.reconnect_initial_delay_ms),
            max_delay: std::time::Duration::from_millis(core.config.peer.reconnect_max_delay_ms),
            multiplier: core.config.peer.reconnect_multiplier,
            jitter: core.config.peer.reconnect_jitter,
            max_attempts: core.config.peer.reconnect_max_attempts,
        };
        let mut attempt: u32 = 0;
        loop {
            let disconnects = core.subscribe_disconnects();
            match dial_once(&core, &target).await {
                Ok(remote_id) => {
                    attempt = 0;
                    if !target.persistent {
                        return;
                    }
                    wait_for_disconnect(disconnects, remote_id).await;
                    log::info!("peer {} disconnected, reconnecting to {}", remote_id, target.addr);
                }
                Err(e) => {
                    log::warn!("dial to {} failed: {}", target.addr, e);
                    if !target.persistent {
                        return;
                    }
                }
            }
            if policy.max_attempts != 0 && attempt >= policy.max_attempts {
                log::warn!("giving up on {} after {} attempts", target.addr, attempt);
                return;
            }
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    });
}

/// Blocks until `remote_id` specifically disconnects, ignoring unrelated
/// peers' disconnects on the same broadcast. A lagged receiver just resumes
/// listening; a closed one (agent shutting down) returns immediately.
async fn wait_for_disconnect(mut disconnects: tokio::sync::broadcast::Receiver<(muti_metroo::AgentId, muti_metroo::peer::DisconnectReason)>, remote_id: muti_metroo::AgentId) {
    loop {
        match disconnects.recv().await {
            Ok((id, reason)) if id == remote_id => {
                log::debug!("peer {} disconnect observed: {:?}", id, reason);
                return;
            }
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn dial_once(core: &Arc<AgentCore>, target: &DialTargetConfig) -> Result<muti_metroo::AgentId> {
    let expected_remote = target
        .expected_agent_id
        .as_deref()
        .map(parse_agent_id)
        .transpose()?;
    let alpn = b"muti-metroo/1".to_vec();
    let subject = hex::encode(core.identity.id.as_bytes());
    let tls_material = tls::generate(&subject, &alpn)?;

    let conn = match target.transport {
        TransportKind::Quic => {
            let dialer = QuicDialer::new(tls_material.client_config, unspecified_bind_addr(target.addr))?;
            dialer.dial(target.addr, &target.server_name).await?
        }
        TransportKind::Wss => {
            let dialer = WssDialer::new(tls_material.client_config, "/mesh");
            dialer.dial(target.addr, &target.server_name).await?
        }
        TransportKind::H2 => {
            let dialer = H2Dialer::new(tls_material.client_config);
            dialer.dial(target.addr, &target.server_name).await?
        }
    };

    let display_name = core.config.display_name.clone();
    let peer = peer::dial_and_register(&core.peers, conn, core.identity.id, &display_name, expected_remote).await?;
    log::info!("dialed peer {} over {}", peer.remote_id, peer.transport_type);
    Ok(peer.remote_id)
}

fn unspecified_bind_addr(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 0)),
    }
}

fn parse_agent_id(s: &str) -> Result<muti_metroo::AgentId> {
    let bytes = hex::decode(s).context("expected_agent_id must be hex-encoded")?;
    if bytes.len() != 32 {
        anyhow::bail!("expected_agent_id must decode to 32 bytes, got {}", bytes.len());
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&bytes);
    Ok(muti_metroo::AgentId(id))
}
