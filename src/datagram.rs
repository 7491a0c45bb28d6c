//! Datagram engines for UDP and ICMP: lazy per-destination associations at
//! ingress, a relay table analogous to the TCP engine's at transit nodes,
//! and idle-timeout cleanup. Both protocols are best-effort — neither
//! retries nor guarantees delivery, matching their external semantics.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

use crate::crypto::SessionKey;
use crate::error::StreamError;
use crate::identity::AgentId;

enum AssociationState {
    Pending(oneshot::Receiver<Result<Arc<SessionKey>, StreamError>>),
    Ready(Arc<SessionKey>),
    Failed,
}

pub(crate) struct DestAssociation {
    stream_id: u64,
    request_id: u64,
    next_hop: AgentId,
    exit_origin: AgentId,
    state: Mutex<AssociationState>,
    last_activity: Mutex<Instant>,
}

/// One ingress-side UDP association, multiplexing many destinations behind
/// a single SOCKS5 UDP association (`base_stream_id`).
pub struct UdpIngressAssociation {
    pub base_stream_id: u64,
    destinations: DashMap<IpAddr, Arc<DestAssociation>>,
    next_stream_id: AtomicU64,
}

pub enum GetOrCreateOutcome {
    Existing(Arc<DestAssociation>),
    Created {
        assoc: Arc<DestAssociation>,
        result_tx: oneshot::Sender<Result<Arc<SessionKey>, StreamError>>,
    },
}

impl UdpIngressAssociation {
    pub fn new(base_stream_id: u64, stream_id_base: u64) -> Self {
        Self {
            base_stream_id,
            destinations: DashMap::new(),
            next_stream_id: AtomicU64::new(stream_id_base),
        }
    }

    /// Returns the existing association for `dest` if present, or atomically
    /// creates a new pending one and returns the sender the caller must
    /// resolve once the `UDP_OPEN_ACK`/`UDP_OPEN_ERR` arrives. Concurrent
    /// callers for the same destination share the single in-flight open.
    pub fn get_or_create(&self, dest: IpAddr, next_hop: AgentId, exit_origin: AgentId, request_id: u64) -> GetOrCreateOutcome {
        if let Some(existing) = self.destinations.get(&dest) {
            return GetOrCreateOutcome::Existing(existing.clone());
        }
        let (tx, rx) = oneshot::channel();
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let assoc = Arc::new(DestAssociation {
            stream_id,
            request_id,
            next_hop,
            exit_origin,
            state: Mutex::new(AssociationState::Pending(rx)),
            last_activity: Mutex::new(Instant::now()),
        });
        match self.destinations.entry(dest) {
            dashmap::mapref::entry::Entry::Occupied(entry) => GetOrCreateOutcome::Existing(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(assoc.clone());
                GetOrCreateOutcome::Created { assoc, result_tx: tx }
            }
        }
    }

    pub fn remove(&self, dest: IpAddr) -> Option<Arc<DestAssociation>> {
        self.destinations.remove(&dest).map(|(_, v)| v)
    }

    pub async fn evict_idle(&self, idle_timeout: Duration) -> Vec<(IpAddr, Arc<DestAssociation>)> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for entry in self.destinations.iter() {
            if now.duration_since(*entry.value().last_activity.lock().await) > idle_timeout {
                stale.push(*entry.key());
            }
        }
        let mut removed = Vec::new();
        for dest in stale {
            if let Some(assoc) = self.remove(dest) {
                removed.push((dest, assoc));
            }
        }
        removed
    }

    /// Removes every destination leg routed through `peer`, for when that
    /// peer's connection dies. A pending leg's waiter is unblocked by
    /// `StreamManager::fail_all_for_peer` resolving its outer open; this
    /// only needs to evict legs that already reached `Ready`.
    pub fn remove_all_for_peer(&self, peer: AgentId) -> Vec<(IpAddr, Arc<DestAssociation>)> {
        let dests: Vec<IpAddr> = self
            .destinations
            .iter()
            .filter(|e| e.value().next_hop == peer)
            .map(|e| *e.key())
            .collect();
        let mut removed = Vec::with_capacity(dests.len());
        for dest in dests {
            if let Some(assoc) = self.remove(dest) {
                removed.push((dest, assoc));
            }
        }
        removed
    }
}

impl DestAssociation {
    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn next_hop(&self) -> AgentId {
        self.next_hop
    }

    pub fn exit_origin(&self) -> AgentId {
        self.exit_origin
    }

    /// Waits for the pending open to resolve (first caller only; subsequent
    /// callers observe `Ready`/`Failed` directly without re-awaiting).
    pub async fn session_key(&self) -> Result<Arc<SessionKey>, StreamError> {
        let mut state = self.state.lock().await;
        match &*state {
            AssociationState::Ready(key) => return Ok(key.clone()),
            AssociationState::Failed => return Err(StreamError::Timeout),
            AssociationState::Pending(_) => {}
        }
        if let AssociationState::Pending(rx) = std::mem::replace(&mut *state, AssociationState::Failed) {
            match rx.await {
                Ok(Ok(key)) => {
                    *state = AssociationState::Ready(key.clone());
                    Ok(key)
                }
                _ => {
                    *state = AssociationState::Failed;
                    Err(StreamError::Timeout)
                }
            }
        } else {
            unreachable!("state was checked to be Pending above")
        }
    }
}

/// ICMP sessions are keyed per-destination directly (no shared base
/// association) since each ping target is its own session from the start.
pub struct IcmpSessions {
    sessions: DashMap<(IpAddr, u16), Arc<DestAssociation>>,
    next_stream_id: AtomicU64,
}

impl IcmpSessions {
    pub fn new(stream_id_base: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            next_stream_id: AtomicU64::new(stream_id_base),
        }
    }

    pub fn get_or_create(&self, dest: IpAddr, identifier: u16, next_hop: AgentId, exit_origin: AgentId, request_id: u64) -> GetOrCreateOutcome {
        let key = (dest, identifier);
        if let Some(existing) = self.sessions.get(&key) {
            return GetOrCreateOutcome::Existing(existing.clone());
        }
        let (tx, rx) = oneshot::channel();
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let assoc = Arc::new(DestAssociation {
            stream_id,
            request_id,
            next_hop,
            exit_origin,
            state: Mutex::new(AssociationState::Pending(rx)),
            last_activity: Mutex::new(Instant::now()),
        });
        match self.sessions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => GetOrCreateOutcome::Existing(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(assoc.clone());
                GetOrCreateOutcome::Created { assoc, result_tx: tx }
            }
        }
    }

    pub fn remove(&self, dest: IpAddr, identifier: u16) -> Option<Arc<DestAssociation>> {
        self.sessions.remove(&(dest, identifier)).map(|(_, v)| v)
    }

    /// Removes every session routed through `peer`, mirroring
    /// `UdpIngressAssociation::remove_all_for_peer`.
    pub fn remove_all_for_peer(&self, peer: AgentId) -> Vec<((IpAddr, u16), Arc<DestAssociation>)> {
        let keys: Vec<(IpAddr, u16)> = self
            .sessions
            .iter()
            .filter(|e| e.value().next_hop == peer)
            .map(|e| *e.key())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for (dest, identifier) in keys {
            if let Some(assoc) = self.remove(dest, identifier) {
                removed.push(((dest, identifier), assoc));
            }
        }
        removed
    }
}

/// Where an ICMP reply should be delivered: the mesh core only needs a sink,
/// not the concrete SOCKS5/WS transport behind it.
pub enum ReplySink {
    Socks5,
    WsPingApi,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_lookups_share_one_pending_association() {
        let ingress = UdpIngressAssociation::new(1, 100);
        let dest: IpAddr = "93.184.216.34".parse().unwrap();
        let next_hop = AgentId::random();
        let exit = AgentId::random();

        let first = ingress.get_or_create(dest, next_hop, exit, 7);
        assert!(matches!(first, GetOrCreateOutcome::Created { .. }));

        let second = ingress.get_or_create(dest, next_hop, exit, 7);
        assert!(matches!(second, GetOrCreateOutcome::Existing(_)));
    }

    #[tokio::test]
    async fn idle_associations_are_evicted() {
        let ingress = UdpIngressAssociation::new(1, 100);
        let dest: IpAddr = "93.184.216.34".parse().unwrap();
        let _ = ingress.get_or_create(dest, AgentId::random(), AgentId::random(), 1);
        let evicted = ingress.evict_idle(Duration::from_secs(0)).await;
        assert_eq!(evicted.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_evicts_only_associations_through_the_dying_peer() {
        let ingress = UdpIngressAssociation::new(1, 100);
        let dying = AgentId::random();
        let other = AgentId::random();
        let exit = AgentId::random();
        let dest_a: IpAddr = "93.184.216.34".parse().unwrap();
        let dest_b: IpAddr = "93.184.216.35".parse().unwrap();
        let _ = ingress.get_or_create(dest_a, dying, exit, 1);
        let _ = ingress.get_or_create(dest_b, other, exit, 2);

        let removed = ingress.remove_all_for_peer(dying);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, dest_a);
        assert!(matches!(ingress.get_or_create(dest_a, dying, exit, 3), GetOrCreateOutcome::Created { .. }));
        assert!(matches!(ingress.get_or_create(dest_b, other, exit, 4), GetOrCreateOutcome::Existing(_)));
    }

    #[test]
    fn icmp_sessions_disconnect_evicts_only_the_dying_peer() {
        let sessions = IcmpSessions::new(1);
        let dying = AgentId::random();
        let other = AgentId::random();
        let exit = AgentId::random();
        let dest: IpAddr = "93.184.216.34".parse().unwrap();
        let _ = sessions.get_or_create(dest, 1, dying, exit, 1);
        let _ = sessions.get_or_create(dest, 2, other, exit, 2);

        let removed = sessions.remove_all_for_peer(dying);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, (dest, 1));
        assert!(matches!(sessions.get_or_create(dest, 2, other, exit, 3), GetOrCreateOutcome::Existing(_)));
        assert!(matches!(sessions.get_or_create(dest, 1, dying, exit, 4), GetOrCreateOutcome::Created { .. }));
    }
}
