//! Stream manager: tracks outbound pending stream-open requests and live
//! streams. Owned per-agent (not globally) by `AgentCore`.

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use crate::codec::OpenAckBody;
use crate::crypto::{EphemeralKeypair, SessionKey};
use crate::e2e;
use crate::error::{OpenErrorCode, StreamError};
use crate::identity::AgentId;

pub struct OpenSuccess {
    pub stream_id: u64,
    pub session_key: Arc<SessionKey>,
    pub remote_ephemeral_pub: [u8; 32],
    pub bound_addr_port: (crate::codec::WireAddr, u16),
    pub read_rx: mpsc::Receiver<(Vec<u8>, bool)>,
}

pub type OpenResult = Result<OpenSuccess, StreamError>;

struct PendingOpen {
    local_stream_id: u64,
    peer: AgentId,
    ephemeral: std::sync::Mutex<Option<EphemeralKeypair>>,
    result_tx: std::sync::Mutex<Option<oneshot::Sender<OpenResult>>>,
}

const HALF_OPEN: u8 = 0;
const WRITE_CLOSED: u8 = 1;
const READ_CLOSED: u8 = 2;
const BOTH_CLOSED: u8 = 3;

pub struct LiveStream {
    pub stream_id: u64,
    pub peer: AgentId,
    pub session_key: Arc<SessionKey>,
    pub read_tx: mpsc::Sender<(Vec<u8>, bool)>,
    half_close: AtomicU8,
}

impl LiveStream {
    pub fn mark_write_closed(&self) {
        self.half_close.fetch_or(WRITE_CLOSED, Ordering::SeqCst);
    }

    pub fn mark_read_closed(&self) {
        self.half_close.fetch_or(READ_CLOSED, Ordering::SeqCst);
    }

    pub fn is_fully_closed(&self) -> bool {
        self.half_close.load(Ordering::SeqCst) == BOTH_CLOSED
    }
}

pub struct StreamManager {
    pending_by_request_id: DashMap<u64, Arc<PendingOpen>>,
    streams_by_id: DashMap<u64, Arc<LiveStream>>,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            pending_by_request_id: DashMap::new(),
            streams_by_id: DashMap::new(),
        }
    }

    /// Reserves a random, currently-unused request id and a pending-open
    /// entry, returning the request id, a result receiver, and the
    /// ephemeral keypair's public half to embed in the outbound `STREAM_OPEN`.
    /// `peer` is the next hop the open was (or is about to be) sent to, so a
    /// later disconnect on that peer can find and fail this request.
    pub fn begin_open(&self, peer: AgentId, local_stream_id: u64) -> (u64, oneshot::Receiver<OpenResult>, [u8; 32]) {
        loop {
            let request_id: u64 = rand::thread_rng().gen();
            if self.pending_by_request_id.contains_key(&request_id) {
                continue;
            }
            let ephemeral = EphemeralKeypair::generate();
            let ephemeral_pub = *ephemeral.public.as_bytes();
            let (tx, rx) = oneshot::channel();
            let pending = Arc::new(PendingOpen {
                local_stream_id,
                peer,
                ephemeral: std::sync::Mutex::new(Some(ephemeral)),
                result_tx: std::sync::Mutex::new(Some(tx)),
            });
            self.pending_by_request_id.insert(request_id, pending);
            return (request_id, rx, ephemeral_pub);
        }
    }

    pub fn handle_open_ack(&self, ack: &OpenAckBody) -> Result<Arc<LiveStream>, StreamError> {
        let (_, pending) = self
            .pending_by_request_id
            .remove(&ack.request_id)
            .ok_or(StreamError::UnknownRequest(ack.request_id))?;
        let ephemeral = pending
            .ephemeral
            .lock()
            .unwrap()
            .take()
            .expect("ephemeral is consumed exactly once");
        let session_key = match e2e::complete_initiator_open(ephemeral, ack) {
            Ok(key) => key,
            Err(_) => {
                let _ = self.resolve(&pending, Err(StreamError::Refused {
                    code: OpenErrorCode::GeneralFailure,
                    message: "peer returned an invalid ephemeral key".to_string(),
                }));
                return Err(StreamError::UnknownRequest(ack.request_id));
            }
        };
        let (read_tx, read_rx) = mpsc::channel(64);
        let stream = Arc::new(LiveStream {
            stream_id: pending.local_stream_id,
            peer: pending.peer,
            session_key: session_key.clone(),
            read_tx,
            half_close: AtomicU8::new(HALF_OPEN),
        });
        self.streams_by_id.insert(stream.stream_id, stream.clone());
        let _ = self.resolve(
            &pending,
            Ok(OpenSuccess {
                stream_id: stream.stream_id,
                session_key,
                remote_ephemeral_pub: ack.ephemeral_pub,
                bound_addr_port: (ack.bound_addr.clone(), ack.bound_port),
                read_rx,
            }),
        );
        Ok(stream)
    }

    pub fn handle_open_err(&self, request_id: u64, code: OpenErrorCode, message: String) -> Result<(), StreamError> {
        let (_, pending) = self
            .pending_by_request_id
            .remove(&request_id)
            .ok_or(StreamError::UnknownRequest(request_id))?;
        self.resolve(&pending, Err(StreamError::Refused { code, message }))
    }

    fn resolve(&self, pending: &Arc<PendingOpen>, result: OpenResult) -> Result<(), StreamError> {
        if let Some(tx) = pending.result_tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
        Ok(())
    }

    pub fn cancel(&self, request_id: u64) {
        self.pending_by_request_id.remove(&request_id);
    }

    /// Registers a stream on the responder (exit) side, where there is no
    /// pending-open entry — the open arrived from the network, not from a
    /// local caller. `peer` is the peer the open frame arrived from.
    pub fn register_responder_stream(&self, peer: AgentId, stream_id: u64, session_key: Arc<SessionKey>) -> (Arc<LiveStream>, mpsc::Receiver<(Vec<u8>, bool)>) {
        let (read_tx, read_rx) = mpsc::channel(64);
        let stream = Arc::new(LiveStream {
            stream_id,
            peer,
            session_key,
            read_tx,
            half_close: AtomicU8::new(HALF_OPEN),
        });
        self.streams_by_id.insert(stream_id, stream.clone());
        (stream, read_rx)
    }

    pub fn get(&self, stream_id: u64) -> Option<Arc<LiveStream>> {
        self.streams_by_id.get(&stream_id).map(|s| s.clone())
    }

    pub async fn handle_data(&self, stream_id: u64, fin: bool, payload: Vec<u8>) -> Result<(), StreamError> {
        let stream = self.get(stream_id).ok_or(StreamError::UnknownStream(stream_id))?;
        let _ = stream.read_tx.send((payload, fin)).await;
        if fin {
            stream.mark_write_closed();
        }
        Ok(())
    }

    pub fn handle_close(&self, stream_id: u64) {
        if let Some((_, stream)) = self.streams_by_id.remove(&stream_id) {
            stream.mark_write_closed();
            stream.mark_read_closed();
        }
    }

    pub fn handle_reset(&self, stream_id: u64) {
        self.streams_by_id.remove(&stream_id);
    }

    /// Removes every pending request and live stream tied to `peer` — used
    /// when a peer connection dies so waiters do not hang and readers see
    /// eof instead of stalling forever. A full scan, same as
    /// `RelayTable::remove_all_for_peer` — disconnects are rare enough that
    /// a dedicated peer index would only add bookkeeping cost to the hot path.
    pub fn fail_all_for_peer(&self, peer: AgentId) {
        let request_ids: Vec<u64> = self
            .pending_by_request_id
            .iter()
            .filter(|e| e.value().peer == peer)
            .map(|e| *e.key())
            .collect();
        for request_id in request_ids {
            if let Some((_, pending)) = self.pending_by_request_id.remove(&request_id) {
                let _ = self.resolve(
                    &pending,
                    Err(StreamError::Refused {
                        code: OpenErrorCode::GeneralFailure,
                        message: "peer disconnected".to_string(),
                    }),
                );
            }
        }

        let stream_ids: Vec<u64> = self
            .streams_by_id
            .iter()
            .filter(|e| e.value().peer == peer)
            .map(|e| *e.key())
            .collect();
        for stream_id in stream_ids {
            self.streams_by_id.remove(&stream_id);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestKey(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_open_yields_unique_request_ids() {
        let mgr = StreamManager::new();
        let peer = AgentId::random();
        let (id1, _, _) = mgr.begin_open(peer, 1);
        let (id2, _, _) = mgr.begin_open(peer, 2);
        assert_ne!(id1, id2);
    }

    #[test]
    fn open_err_resolves_pending_with_refusal() {
        let mgr = StreamManager::new();
        let (request_id, mut rx, _) = mgr.begin_open(AgentId::random(), 5);
        mgr.handle_open_err(request_id, OpenErrorCode::HostUnreachable, "nope".into())
            .unwrap();
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(StreamError::Refused { .. })));
    }

    #[test]
    fn unknown_request_id_errors() {
        let mgr = StreamManager::new();
        assert!(matches!(
            mgr.handle_open_err(12345, OpenErrorCode::GeneralFailure, "x".into()),
            Err(StreamError::UnknownRequest(12345))
        ));
    }

    #[test]
    fn fail_all_for_peer_resolves_pending_requests_with_refusal() {
        let mgr = StreamManager::new();
        let dying = AgentId::random();
        let other = AgentId::random();
        let (_dying_request, mut dying_rx, _) = mgr.begin_open(dying, 1);
        let (_other_request, mut other_rx, _) = mgr.begin_open(other, 2);

        mgr.fail_all_for_peer(dying);

        assert!(matches!(dying_rx.try_recv().unwrap(), Err(StreamError::Refused { .. })));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn fail_all_for_peer_removes_only_that_peers_live_streams() {
        let mgr = StreamManager::new();
        let dying = AgentId::random();
        let other = AgentId::random();
        let initiator_pub = EphemeralKeypair::generate().public;
        let key = Arc::new(SessionKey::derive_responder(EphemeralKeypair::generate(), 1, &initiator_pub).unwrap());
        let (dying_stream, _) = mgr.register_responder_stream(dying, 10, key.clone());
        let (other_stream, _) = mgr.register_responder_stream(other, 20, key);

        mgr.fail_all_for_peer(dying);

        assert!(mgr.get(dying_stream.stream_id).is_none());
        assert!(mgr.get(other_stream.stream_id).is_some());
    }
}
