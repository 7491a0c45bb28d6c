//! Flooder: periodic path-vector advertisement and re-flooding of routes
//! and node-info, with loop prevention via `path` and `seen_by` lists.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::identity::AgentId;
use crate::peer::PeerManager;
use crate::routing::{Advertisement, Route};

pub struct LocalCidrRoute {
    pub net: ipnet::IpNet,
    pub metric: u16,
}

pub struct LocalDomainRoute {
    pub pattern: String,
    pub metric: u16,
}

pub struct LocalTunnelRoute {
    pub key: String,
    pub metric: u16,
}

/// Local route configuration the flooder advertises every cycle, plus
/// whatever routes the routing manager has learned and needs to re-flood.
pub struct Flooder {
    local_agent: AgentId,
    sequence: AtomicU32,
    pub local_cidr: Vec<LocalCidrRoute>,
    pub local_domains: Vec<LocalDomainRoute>,
    pub local_tunnels: Vec<LocalTunnelRoute>,
}

impl Flooder {
    pub fn new(local_agent: AgentId) -> Self {
        Self {
            local_agent,
            sequence: AtomicU32::new(1),
            local_cidr: Vec::new(),
            local_domains: Vec::new(),
            local_tunnels: Vec::new(),
        }
    }

    pub fn with_local_routes(
        local_agent: AgentId,
        local_cidr: Vec<LocalCidrRoute>,
        local_domains: Vec<LocalDomainRoute>,
        local_tunnels: Vec<LocalTunnelRoute>,
    ) -> Self {
        Self {
            local_agent,
            sequence: AtomicU32::new(1),
            local_cidr,
            local_domains,
            local_tunnels,
        }
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn local_route(&self, metric: u16, sequence: u32) -> Route {
        Route {
            origin: self.local_agent,
            next_hop: self.local_agent,
            path: vec![self.local_agent],
            metric,
            sequence,
            last_seen: std::time::Instant::now(),
        }
    }

    /// Builds a fresh advertisement of every locally-configured CIDR route.
    pub fn build_local_cidr_advertisements(&self) -> Vec<(ipnet::IpNet, Route)> {
        let sequence = self.next_sequence();
        self.local_cidr
            .iter()
            .map(|r| (r.net, self.local_route(r.metric, sequence)))
            .collect()
    }

    /// Builds a fresh advertisement of every locally-configured domain route.
    pub fn build_local_domain_advertisements(&self) -> Vec<(String, Route)> {
        let sequence = self.next_sequence();
        self.local_domains
            .iter()
            .map(|r| (r.pattern.clone(), self.local_route(r.metric, sequence)))
            .collect()
    }

    /// Builds a fresh advertisement of every locally-configured tunnel route.
    pub fn build_local_tunnel_advertisements(&self) -> Vec<(String, Route)> {
        let sequence = self.next_sequence();
        self.local_tunnels
            .iter()
            .map(|r| (r.key.clone(), self.local_route(r.metric, sequence)))
            .collect()
    }

    /// Given a route learned from a peer, builds the re-advertisement to
    /// send onward: prepend the local agent to the path and seen-by, and
    /// preserve the origin's sequence number unchanged.
    pub fn rebuild_for_forwarding(&self, origin_route: &Route) -> Route {
        let mut path = vec![self.local_agent];
        path.extend_from_slice(&origin_route.path);
        Route {
            origin: origin_route.origin,
            next_hop: self.local_agent,
            path,
            metric: origin_route.metric.saturating_add(1),
            sequence: origin_route.sequence,
            last_seen: std::time::Instant::now(),
        }
    }

    /// Decides which peers an accepted advertisement should be re-flooded
    /// to: every peer except ones already present in `path` or `seen_by`.
    pub fn fanout_targets(&self, manager: &Arc<PeerManager>, advertisement: &Advertisement, exclude: Option<AgentId>) -> Vec<AgentId> {
        manager
            .peer_ids()
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter(|id| !advertisement.path.contains(id))
            .filter(|id| !advertisement.seen_by.contains(id))
            .collect()
    }

    pub fn seen_by_for_forward(&self, mut seen_by: Vec<AgentId>) -> Vec<AgentId> {
        if !seen_by.contains(&self.local_agent) {
            seen_by.push(self.local_agent);
        }
        seen_by
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_advertisement_prepends_local_and_preserves_sequence() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let flooder = Flooder::new(local);
        let learned = Route {
            origin,
            next_hop: origin,
            path: vec![origin],
            metric: 1,
            sequence: 42,
            last_seen: std::time::Instant::now(),
        };
        let forwarded = flooder.rebuild_for_forwarding(&learned);
        assert_eq!(forwarded.path, vec![local, origin]);
        assert_eq!(forwarded.sequence, 42);
        assert_eq!(forwarded.metric, 2);
    }

    #[test]
    fn fanout_excludes_peers_already_in_path_or_seen_by() {
        let local = AgentId::random();
        let manager = PeerManager::new(local, Duration::from_secs(10), Arc::new(|_, _| {}), Arc::new(|_, _| {}));
        let flooder = Flooder::new(local);
        let in_path = AgentId::random();
        let advertisement = Advertisement {
            origin: AgentId::random(),
            sequence: 1,
            path: vec![in_path],
            seen_by: vec![],
        };
        let targets = flooder.fanout_targets(&manager, &advertisement, None);
        assert!(!targets.contains(&in_path));
    }
}
