//! Agent configuration: TOML-backed, nested sub-configs with
//! `#[serde(default)]` so a minimal file only needs the fields that matter.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::TransportType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory holding `identity.key` / `agent.id` and other local state.
    pub data_dir: PathBuf,

    pub display_name: String,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub dial_targets: Vec<DialTargetConfig>,

    #[serde(default)]
    pub local_routes: LocalRoutesConfig,

    #[serde(default)]
    pub flooding: FloodingConfig,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub datagram: DatagramConfig,

    /// Base64-encoded X25519 public key; when set, `NodeInfo` advertisements
    /// are sealed against it before being flooded.
    #[serde(default)]
    pub management_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub transport: TransportKind,
    pub listen_addr: SocketAddr,
    pub alpn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialTargetConfig {
    pub transport: TransportKind,
    pub addr: SocketAddr,
    pub server_name: String,
    pub expected_agent_id: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    Wss,
    H2,
}

impl From<TransportKind> for TransportType {
    fn from(k: TransportKind) -> Self {
        match k {
            TransportKind::Quic => TransportType::Quic,
            TransportKind::Wss => TransportType::Wss,
            TransportKind::H2 => TransportType::H2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalRoutesConfig {
    #[serde(default)]
    pub cidrs: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub tunnels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FloodingConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub route_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub node_info_ttl: Duration,
}

impl Default for FloodingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            route_ttl: Duration::from_secs(90),
            node_info_ttl: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfig {
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: f64,
    pub reconnect_max_attempts: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 60_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.2,
            reconnect_max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    pub stream_channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stream_channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatagramConfig {
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub udp_enabled: bool,
    pub icmp_enabled: bool,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            udp_enabled: true,
            icmp_enabled: true,
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.listeners.is_empty() && self.dial_targets.is_empty() {
            return Err("agent must have at least one listener or dial target".to_string());
        }
        for cidr in &self.local_routes.cidrs {
            cidr.parse::<ipnet::IpNet>()
                .map_err(|e| format!("invalid local CIDR '{}': {}", cidr, e))?;
        }
        if self.peer.reconnect_multiplier <= 1.0 {
            return Err("reconnect_multiplier must be greater than 1.0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        AgentConfig {
            data_dir: PathBuf::from("/tmp/muti-metroo"),
            display_name: "test-agent".to_string(),
            listeners: vec![ListenerConfig {
                transport: TransportKind::Quic,
                listen_addr: "0.0.0.0:4433".parse().unwrap(),
                alpn: "muti-metroo/1".to_string(),
            }],
            dial_targets: vec![],
            local_routes: LocalRoutesConfig::default(),
            flooding: FloodingConfig::default(),
            peer: PeerConfig::default(),
            relay: RelayConfig::default(),
            datagram: DatagramConfig::default(),
            management_public_key: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_listeners_and_dial_targets_fails() {
        let mut config = sample();
        config.listeners.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_cidr_fails() {
        let mut config = sample();
        config.local_routes.cidrs.push("not-a-cidr".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trips() {
        let config = sample();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.display_name, config.display_name);
    }
}
