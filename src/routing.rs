//! Routing plane: CIDR, domain-pattern, and tunnel-key route tables plus the
//! per-origin node-info table. Longest-prefix CIDR lookup, wildcard-suffix
//! domain lookup, monotonic per-origin sequence acceptance, and TTL-based
//! eviction all live here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ipnet::IpNet;

use crate::error::RoutingError;
use crate::identity::AgentId;
use crate::json_logger::JsonLogger;

#[derive(Debug, Clone)]
pub struct Route {
    pub origin: AgentId,
    pub next_hop: AgentId,
    pub path: Vec<AgentId>,
    pub metric: u16,
    pub sequence: u32,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct CidrRoute {
    pub net: IpNet,
    pub route: Route,
}

#[derive(Debug, Clone)]
pub struct DomainRoute {
    pub pattern: String,
    pub is_wildcard: bool,
    pub base_domain: String,
    pub route: Route,
}

#[derive(Debug, Clone)]
pub struct TunnelRoute {
    pub key: String,
    pub route: Route,
}

#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub peer_id: AgentId,
    pub transport: String,
    pub rtt_ms: u32,
    pub is_dialer: bool,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub display_name: String,
    pub hostname: String,
    pub start_time: Instant,
    /// Opaque `seal_box` output over the origin's peer list; only a holder
    /// of the management private key can open it (see `crypto::open_box`).
    /// Empty when the origin has no `management_public_key` configured.
    pub sealed_peers: Vec<u8>,
    pub static_pubkey: [u8; 32],
    pub udp_capable: bool,
    pub last_seen: Instant,
}

/// An advertisement as received from a peer, ready for acceptance checking.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub origin: AgentId,
    pub sequence: u32,
    pub path: Vec<AgentId>,
    pub seen_by: Vec<AgentId>,
}

fn has_duplicates(ids: &[AgentId]) -> bool {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(*id) {
            return true;
        }
    }
    false
}

/// Compares two candidate routes to the same destination under the tie-break
/// rule: lower metric wins, then shorter path, then lexicographically
/// smaller origin id. Returns `true` if `candidate` should replace `current`.
fn candidate_beats(current: &Route, candidate: &Route) -> bool {
    (candidate.metric, candidate.path.len(), candidate.origin)
        < (current.metric, current.path.len(), current.origin)
}

pub struct RoutingTable {
    local_agent: AgentId,
    cidr_routes: Vec<CidrRoute>,
    domain_routes: HashMap<String, DomainRoute>,
    tunnel_routes: HashMap<String, TunnelRoute>,
    node_info: HashMap<AgentId, NodeInfo>,
    route_sequence: HashMap<AgentId, u32>,
    node_info_sequence: HashMap<AgentId, u32>,
}

impl RoutingTable {
    pub fn new(local_agent: AgentId) -> Self {
        Self {
            local_agent,
            cidr_routes: Vec::new(),
            domain_routes: HashMap::new(),
            tunnel_routes: HashMap::new(),
            node_info: HashMap::new(),
            route_sequence: HashMap::new(),
            node_info_sequence: HashMap::new(),
        }
    }

    /// Validates an incoming advertisement's vectors against loop-prevention
    /// and sequencing rules without mutating any table.
    fn check_advertisement(&self, origin: AgentId, sequence: u32, path: &[AgentId], seen_by: &[AgentId]) -> Result<(), RoutingError> {
        if path.contains(&self.local_agent) || seen_by.contains(&self.local_agent) {
            return Err(RoutingError::Loop);
        }
        if has_duplicates(path) || has_duplicates(seen_by) {
            return Err(RoutingError::DuplicateInVector);
        }
        let stored = self.route_sequence.get(&origin).copied().unwrap_or(0);
        if sequence < stored {
            return Err(RoutingError::SequenceRegression(sequence, stored));
        }
        Ok(())
    }

    pub fn accept_cidr_route(&mut self, net: IpNet, candidate: Route) -> Result<bool, RoutingError> {
        self.check_advertisement(candidate.origin, candidate.sequence, &candidate.path, &[])?;
        let stored_seq = self.route_sequence.get(&candidate.origin).copied().unwrap_or(0);
        let strictly_newer = candidate.sequence > stored_seq;

        let existing_idx = self
            .cidr_routes
            .iter()
            .position(|r| r.net == net && r.route.origin == candidate.origin);

        let should_replace = match existing_idx {
            None => true,
            Some(idx) => strictly_newer || candidate_beats(&self.cidr_routes[idx].route, &candidate),
        };

        if should_replace {
            let entry = CidrRoute {
                net,
                route: candidate.clone(),
            };
            match existing_idx {
                Some(idx) => self.cidr_routes[idx] = entry,
                None => self.cidr_routes.push(entry),
            }
            JsonLogger::route_learned("routing", "cidr", &candidate.origin.to_string(), &net.to_string(), candidate.metric, candidate.sequence);
        }
        if strictly_newer {
            self.route_sequence.insert(candidate.origin, candidate.sequence);
        }
        Ok(should_replace)
    }

    pub fn accept_domain_route(&mut self, candidate_pattern: String, candidate: Route) -> Result<bool, RoutingError> {
        self.check_advertisement(candidate.origin, candidate.sequence, &candidate.path, &[])?;
        let stored_seq = self.route_sequence.get(&candidate.origin).copied().unwrap_or(0);
        let strictly_newer = candidate.sequence > stored_seq;

        let is_wildcard = candidate_pattern.starts_with("*.");
        let base_domain = if is_wildcard {
            candidate_pattern.trim_start_matches("*.").to_string()
        } else {
            candidate_pattern.clone()
        };

        let key = format!("{}|{}", candidate_pattern, candidate.origin.short());
        let should_replace = match self.domain_routes.get(&key) {
            None => true,
            Some(existing) => strictly_newer || candidate_beats(&existing.route, &candidate),
        };
        if should_replace {
            self.domain_routes.insert(
                key,
                DomainRoute {
                    pattern: candidate_pattern,
                    is_wildcard,
                    base_domain,
                    route: candidate.clone(),
                },
            );
        }
        if strictly_newer {
            self.route_sequence.insert(candidate.origin, candidate.sequence);
        }
        Ok(should_replace)
    }

    pub fn accept_tunnel_route(&mut self, key: String, candidate: Route) -> Result<bool, RoutingError> {
        self.check_advertisement(candidate.origin, candidate.sequence, &candidate.path, &[])?;
        let stored_seq = self.route_sequence.get(&candidate.origin).copied().unwrap_or(0);
        let strictly_newer = candidate.sequence > stored_seq;

        let table_key = format!("{}|{}", key, candidate.origin.short());
        let should_replace = match self.tunnel_routes.get(&table_key) {
            None => true,
            Some(existing) => strictly_newer || candidate_beats(&existing.route, &candidate),
        };
        if should_replace {
            self.tunnel_routes.insert(
                table_key,
                TunnelRoute {
                    key,
                    route: candidate.clone(),
                },
            );
        }
        if strictly_newer {
            self.route_sequence.insert(candidate.origin, candidate.sequence);
        }
        Ok(should_replace)
    }

    /// Longest-prefix-match lookup; ties broken by metric, path length, then
    /// origin id.
    pub fn lookup(&self, ip: IpAddr) -> Option<&Route> {
        let mut best: Option<&CidrRoute> = None;
        for entry in &self.cidr_routes {
            if !entry.net.contains(&ip) {
                continue;
            }
            best = match best {
                None => Some(entry),
                Some(current) => {
                    if entry.net.prefix_len() > current.net.prefix_len() {
                        Some(entry)
                    } else if entry.net.prefix_len() == current.net.prefix_len()
                        && candidate_beats(&current.route, &entry.route)
                    {
                        Some(entry)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best.map(|e| &e.route)
    }

    pub fn lookup_domain(&self, name: &str) -> Option<&Route> {
        let exact_key_prefix = format!("{}|", name);
        if let Some(route) = self
            .domain_routes
            .iter()
            .filter(|(k, v)| !v.is_wildcard && k.starts_with(&exact_key_prefix))
            .map(|(_, v)| v)
            .fold(None::<&DomainRoute>, |best, candidate| match best {
                None => Some(candidate),
                Some(b) => {
                    if candidate_beats(&b.route, &candidate.route) {
                        Some(candidate)
                    } else {
                        Some(b)
                    }
                }
            })
        {
            return Some(&route.route);
        }

        let labels: Vec<&str> = name.split('.').collect();
        for start in 0..labels.len() {
            let suffix = labels[start..].join(".");
            if let Some(route) = self
                .domain_routes
                .values()
                .filter(|v| v.is_wildcard && v.base_domain == suffix)
                .fold(None::<&DomainRoute>, |best, candidate| match best {
                    None => Some(candidate),
                    Some(b) => {
                        if candidate_beats(&b.route, &candidate.route) {
                            Some(candidate)
                        } else {
                            Some(b)
                        }
                    }
                })
            {
                return Some(&route.route);
            }
        }
        None
    }

    pub fn lookup_tunnel(&self, key: &str) -> Option<&Route> {
        let prefix = format!("{}|", key);
        self.tunnel_routes
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
            .fold(None::<&TunnelRoute>, |best, candidate| match best {
                None => Some(candidate),
                Some(b) => {
                    if candidate_beats(&b.route, &candidate.route) {
                        Some(candidate)
                    } else {
                        Some(b)
                    }
                }
            })
            .map(|t| &t.route)
    }

    pub fn accept_node_info(&mut self, origin: AgentId, sequence: u32, info: NodeInfo) -> Result<bool, RoutingError> {
        let stored = self.node_info_sequence.get(&origin).copied().unwrap_or(0);
        if sequence < stored {
            return Err(RoutingError::SequenceRegression(sequence, stored));
        }
        let strictly_newer = sequence > stored;
        if strictly_newer {
            self.node_info_sequence.insert(origin, sequence);
        }
        self.node_info.insert(origin, info);
        Ok(strictly_newer)
    }

    pub fn node_info(&self, origin: &AgentId) -> Option<&NodeInfo> {
        self.node_info.get(origin)
    }

    /// Removes routes whose `last_seen` predates `ttl`; returns the count removed.
    pub fn cleanup_stale_routes(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.cidr_routes.len() + self.domain_routes.len() + self.tunnel_routes.len();
        self.cidr_routes.retain(|r| now.duration_since(r.route.last_seen) <= ttl);
        self.domain_routes.retain(|_, r| now.duration_since(r.route.last_seen) <= ttl);
        self.tunnel_routes.retain(|_, r| now.duration_since(r.route.last_seen) <= ttl);
        let after = self.cidr_routes.len() + self.domain_routes.len() + self.tunnel_routes.len();
        before - after
    }

    pub fn cleanup_stale_node_info(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.node_info.len();
        self.node_info.retain(|_, n| now.duration_since(n.last_seen) <= ttl);
        before - self.node_info.len()
    }

    pub fn withdraw_cidr(&mut self, net: IpNet, origin: AgentId, sequence: u32) -> Result<bool, RoutingError> {
        let stored = self.route_sequence.get(&origin).copied().unwrap_or(0);
        if sequence <= stored {
            return Err(RoutingError::SequenceRegression(sequence, stored));
        }
        self.route_sequence.insert(origin, sequence);
        let before = self.cidr_routes.len();
        self.cidr_routes.retain(|r| !(r.net == net && r.route.origin == origin));
        Ok(self.cidr_routes.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(origin: AgentId, next_hop: AgentId, path: Vec<AgentId>, metric: u16, sequence: u32) -> Route {
        Route {
            origin,
            next_hop,
            path,
            metric,
            sequence,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let mut table = RoutingTable::new(local);
        table
            .accept_cidr_route("10.0.0.0/8".parse().unwrap(), route(origin, origin, vec![origin], 1, 1))
            .unwrap();
        table
            .accept_cidr_route("10.1.0.0/16".parse().unwrap(), route(origin, origin, vec![origin], 1, 1))
            .unwrap();
        let found = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(found.origin, origin);
    }

    #[test]
    fn loop_is_rejected() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let mut table = RoutingTable::new(local);
        let err = table
            .accept_cidr_route(
                "10.0.0.0/8".parse().unwrap(),
                route(origin, origin, vec![origin, local], 1, 1),
            )
            .unwrap_err();
        assert!(matches!(err, RoutingError::Loop));
    }

    #[test]
    fn sequence_regression_is_rejected() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let mut table = RoutingTable::new(local);
        table
            .accept_cidr_route("10.0.0.0/8".parse().unwrap(), route(origin, origin, vec![origin], 1, 5))
            .unwrap();
        let err = table
            .accept_cidr_route("10.0.0.0/8".parse().unwrap(), route(origin, origin, vec![origin], 1, 3))
            .unwrap_err();
        assert!(matches!(err, RoutingError::SequenceRegression(3, 5)));
    }

    #[test]
    fn wildcard_domain_matches_subdomains() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let mut table = RoutingTable::new(local);
        table
            .accept_domain_route("*.example.com".to_string(), route(origin, origin, vec![origin], 1, 1))
            .unwrap();
        assert!(table.lookup_domain("a.b.example.com").is_some());
        assert!(table.lookup_domain("example.com").is_none());
        assert!(table.lookup_domain("other.com").is_none());
    }

    #[test]
    fn duplicate_in_path_is_dropped() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let repeated = AgentId::random();
        let mut table = RoutingTable::new(local);
        let err = table
            .accept_cidr_route(
                "10.0.0.0/8".parse().unwrap(),
                route(origin, origin, vec![repeated, repeated], 1, 1),
            )
            .unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateInVector));
    }

    #[test]
    fn stale_routes_are_evicted() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let mut table = RoutingTable::new(local);
        table
            .accept_cidr_route("10.0.0.0/8".parse().unwrap(), route(origin, origin, vec![origin], 1, 1))
            .unwrap();
        let removed = table.cleanup_stale_routes(Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert!(table.lookup("10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn re_advertising_same_sequence_is_a_no_op() {
        let local = AgentId::random();
        let origin = AgentId::random();
        let mut table = RoutingTable::new(local);
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        table
            .accept_cidr_route(net, route(origin, origin, vec![origin], 2, 4))
            .unwrap();
        let replaced = table
            .accept_cidr_route(net, route(origin, origin, vec![origin, AgentId::random()], 2, 4))
            .unwrap();
        assert!(!replaced);
    }
}
