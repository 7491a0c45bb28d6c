//! TCP relay engine: at a transit node, maps upstream/downstream stream IDs
//! so frames can be rewritten and forwarded without ever being decrypted.
//!
//! Each relay entry lives once in an arena (a `DashMap<u64, RelayEntry>`
//! keyed by an opaque handle) and is reachable through two index maps, one
//! per stream-id namespace — the two-index-over-one-arena-slot shape named
//! as a design requirement, implemented here with a handle counter instead
//! of the `slab` crate since `slab` is not part of this codebase's stack.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RelayError;
use crate::identity::AgentId;

#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub upstream_peer: AgentId,
    pub upstream_stream_id: u64,
    pub downstream_peer: AgentId,
    pub downstream_stream_id: u64,
}

pub struct RelayTable {
    arena: DashMap<u64, RelayEntry>,
    by_upstream: DashMap<(AgentId, u64), u64>,
    by_downstream: DashMap<(AgentId, u64), u64>,
    next_handle: AtomicU64,
}

impl Default for RelayTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayTable {
    pub fn new() -> Self {
        Self {
            arena: DashMap::new(),
            by_upstream: DashMap::new(),
            by_downstream: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, entry: RelayEntry) -> Result<u64, RelayError> {
        let up_key = (entry.upstream_peer, entry.upstream_stream_id);
        let down_key = (entry.downstream_peer, entry.downstream_stream_id);
        if self.by_upstream.contains_key(&up_key) {
            return Err(RelayError::Collision(entry.upstream_stream_id));
        }
        if self.by_downstream.contains_key(&down_key) {
            return Err(RelayError::Collision(entry.downstream_stream_id));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.arena.insert(handle, entry);
        self.by_upstream.insert(up_key, handle);
        self.by_downstream.insert(down_key, handle);
        Ok(handle)
    }

    pub fn lookup_by_upstream(&self, peer: AgentId, stream_id: u64) -> Option<RelayEntry> {
        let handle = *self.by_upstream.get(&(peer, stream_id))?;
        self.arena.get(&handle).map(|e| e.clone())
    }

    pub fn lookup_by_downstream(&self, peer: AgentId, stream_id: u64) -> Option<RelayEntry> {
        let handle = *self.by_downstream.get(&(peer, stream_id))?;
        self.arena.get(&handle).map(|e| e.clone())
    }

    /// Removes an entry given either side's (peer, stream_id) key — both
    /// index entries and the arena slot are removed atomically from the
    /// caller's point of view (no intermediate state is observable since each
    /// `DashMap` shard lock is held only for the duration of its own removal
    /// and nothing reads the arena without going through an index first).
    pub fn remove_by_upstream(&self, peer: AgentId, stream_id: u64) -> Option<RelayEntry> {
        let (_, handle) = self.by_upstream.remove(&(peer, stream_id))?;
        let (_, entry) = self.arena.remove(&handle)?;
        self.by_downstream.remove(&(entry.downstream_peer, entry.downstream_stream_id));
        Some(entry)
    }

    pub fn remove_by_downstream(&self, peer: AgentId, stream_id: u64) -> Option<RelayEntry> {
        let (_, handle) = self.by_downstream.remove(&(peer, stream_id))?;
        let (_, entry) = self.arena.remove(&handle)?;
        self.by_upstream.remove(&(entry.upstream_peer, entry.upstream_stream_id));
        Some(entry)
    }

    /// Removes every entry touching `peer` in one pass, returning them so
    /// the caller can notify the opposite side of each.
    pub fn remove_all_for_peer(&self, peer: AgentId) -> Vec<RelayEntry> {
        let handles: Vec<u64> = self
            .arena
            .iter()
            .filter(|e| e.upstream_peer == peer || e.downstream_peer == peer)
            .map(|e| *e.key())
            .collect();
        let mut removed = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some((_, entry)) = self.arena.remove(&handle) {
                self.by_upstream.remove(&(entry.upstream_peer, entry.upstream_stream_id));
                self.by_downstream.remove(&(entry.downstream_peer, entry.downstream_stream_id));
                removed.push(entry);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

pub type SharedRelayTable = Arc<RelayTable>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(up: AgentId, up_id: u64, down: AgentId, down_id: u64) -> RelayEntry {
        RelayEntry {
            upstream_peer: up,
            upstream_stream_id: up_id,
            downstream_peer: down,
            downstream_stream_id: down_id,
        }
    }

    #[test]
    fn both_indices_agree() {
        let table = RelayTable::new();
        let up = AgentId::random();
        let down = AgentId::random();
        table.insert(entry(up, 1, down, 2)).unwrap();
        let via_up = table.lookup_by_upstream(up, 1).unwrap();
        let via_down = table.lookup_by_downstream(down, 2).unwrap();
        assert_eq!(via_up.downstream_stream_id, via_down.downstream_stream_id);
        assert_eq!(via_up.upstream_stream_id, via_down.upstream_stream_id);
    }

    #[test]
    fn collision_is_rejected() {
        let table = RelayTable::new();
        let up = AgentId::random();
        let down1 = AgentId::random();
        let down2 = AgentId::random();
        table.insert(entry(up, 1, down1, 2)).unwrap();
        assert!(table.insert(entry(up, 1, down2, 3)).is_err());
    }

    #[test]
    fn removing_one_side_clears_both_indices() {
        let table = RelayTable::new();
        let up = AgentId::random();
        let down = AgentId::random();
        table.insert(entry(up, 1, down, 2)).unwrap();
        table.remove_by_upstream(up, 1).unwrap();
        assert!(table.lookup_by_upstream(up, 1).is_none());
        assert!(table.lookup_by_downstream(down, 2).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn disconnect_clears_every_entry_touching_the_peer() {
        let table = RelayTable::new();
        let a = AgentId::random();
        let b = AgentId::random();
        let c = AgentId::random();
        table.insert(entry(a, 1, b, 2)).unwrap();
        table.insert(entry(b, 3, c, 4)).unwrap();
        let removed = table.remove_all_for_peer(b);
        assert_eq!(removed.len(), 2);
        assert!(table.is_empty());
    }
}
