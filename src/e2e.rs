//! End-to-end crypto glue: the thin layer that wires `crypto`'s ECDH/HKDF/AEAD
//! primitives into the stream-open and UDP/ICMP-open call sites. Transit
//! agents never import this module.

use std::sync::Arc;

use crate::codec::{OpenAckBody, OpenBody, WireAddr};
use crate::crypto::{EphemeralKeypair, SessionKey};
use crate::error::{CryptoError, OpenErrorCode};
use crate::identity::AgentId;

/// Builds the initiator half of a `STREAM_OPEN`/`UDP_OPEN`: a fresh
/// ephemeral keypair and the wire body embedding its public half, alongside
/// the keypair itself (kept by the caller until the ack arrives).
pub fn begin_initiator_open(
    request_id: u64,
    addr: WireAddr,
    port: u16,
    ttl: u8,
    remaining_path: Vec<AgentId>,
) -> (OpenBody, EphemeralKeypair) {
    let ephemeral = EphemeralKeypair::generate();
    let body = OpenBody {
        request_id,
        addr,
        port,
        ttl,
        remaining_path,
        ephemeral_pub: *ephemeral.public.as_bytes(),
    };
    (body, ephemeral)
}

/// Completes the initiator side once an ack arrives: derives the shared
/// session key from the initiator's now-consumed ephemeral and the
/// responder's public key carried in the ack.
pub fn complete_initiator_open(
    ephemeral: EphemeralKeypair,
    ack: &OpenAckBody,
) -> Result<Arc<SessionKey>, CryptoError> {
    let remote_pub = x25519_dalek::PublicKey::from(ack.ephemeral_pub);
    SessionKey::derive_initiator(ephemeral, ack.request_id, &remote_pub).map(Arc::new)
}

/// Responder (exit) side: given the initiator's public key from the open
/// body, generates its own ephemeral, derives the session key, and returns
/// both the key and the ack body to send back.
pub fn respond_to_open(open: &OpenBody, bound_addr: WireAddr, bound_port: u16) -> Result<(Arc<SessionKey>, OpenAckBody), CryptoError> {
    let ephemeral = EphemeralKeypair::generate();
    let responder_pub = *ephemeral.public.as_bytes();
    let initiator_pub = x25519_dalek::PublicKey::from(open.ephemeral_pub);
    let session_key = SessionKey::derive_responder(ephemeral, open.request_id, &initiator_pub)?;
    let ack = OpenAckBody {
        request_id: open.request_id,
        bound_addr,
        bound_port,
        ephemeral_pub: responder_pub,
    };
    Ok((Arc::new(session_key), ack))
}

pub fn refusal_code_for_crypto_error(_err: &CryptoError) -> OpenErrorCode {
    OpenErrorCode::GeneralFailure
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn initiator_and_responder_converge_on_the_same_key() {
        let (open_body, initiator_eph) =
            begin_initiator_open(1, WireAddr::Domain("example.com".into()), 443, 16, vec![]);
        let (responder_key, ack) = respond_to_open(&open_body, WireAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 9000).unwrap();
        let initiator_key = complete_initiator_open(initiator_eph, &ack).unwrap();

        let sealed = initiator_key.seal(b"ping").unwrap();
        assert_eq!(responder_key.open(&sealed).unwrap(), b"ping");
    }
}
