//! End-to-end cryptographic primitives: ephemeral X25519 key agreement,
//! HKDF-SHA256 session key derivation, and per-frame ChaCha20-Poly1305
//! framing with a direction-tagged monotonic nonce counter.
//!
//! Transit agents never call into this module; only the ingress and exit
//! endpoints of a stream hold a `SessionKey`.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const SESSION_SALT: &[u8] = b"muti-metroo-session-v1";
pub const AEAD_TAG_LEN: usize = 16;
pub const AEAD_NONCE_LEN: usize = 12;

/// An ephemeral X25519 keypair generated fresh for one stream open attempt.
/// The secret zeroes itself on drop and is consumed exactly once.
pub struct EphemeralKeypair {
    secret: Option<EphemeralSecret>,
    pub public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    /// Consume the secret half against a peer's public key. Can only be
    /// called once; the secret is moved out and zeroed by its own `Drop`.
    fn diffie_hellman(&mut self, peer_public: &PublicKey) -> x25519_dalek::SharedSecret {
        let secret = self.secret.take().expect("diffie_hellman called twice");
        secret.diffie_hellman(peer_public)
    }
}

/// Derived per-stream symmetric key plus independent per-direction nonce
/// counters. A single key is shared by both directions; the nonce's top 4
/// bytes carry a direction tag so the two directions never collide.
pub struct SessionKey {
    cipher: ChaCha20Poly1305,
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
    is_initiator: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl Direction {
    fn tag(self) -> u32 {
        match self {
            Direction::InitiatorToResponder => 0,
            Direction::ResponderToInitiator => 1,
        }
    }
}

impl SessionKey {
    /// Derive a session key as the initiator: consumes `my_ephemeral`,
    /// `request_id` correlates the pending open, `responder_public` is the
    /// peer's ephemeral public key received in the ack.
    pub fn derive_initiator(
        mut my_ephemeral: EphemeralKeypair,
        request_id: u64,
        responder_public: &PublicKey,
    ) -> Result<Self, CryptoError> {
        if responder_public.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::ZeroPeerKey);
        }
        let initiator_public = my_ephemeral.public;
        let shared = my_ephemeral.diffie_hellman(responder_public);
        let key = derive_key(&shared, request_id, &initiator_public, responder_public)?;
        Ok(Self::from_key(key, true))
    }

    /// Derive a session key as the responder: consumes `my_ephemeral`,
    /// `initiator_public` came in the `STREAM_OPEN` frame.
    pub fn derive_responder(
        mut my_ephemeral: EphemeralKeypair,
        request_id: u64,
        initiator_public: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let responder_public = my_ephemeral.public;
        let shared = my_ephemeral.diffie_hellman(initiator_public);
        let key = derive_key(&shared, request_id, initiator_public, &responder_public)?;
        Ok(Self::from_key(key, false))
    }

    fn from_key(key: Zeroizing<[u8; 32]>, is_initiator: bool) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        Self {
            cipher,
            send_counter: AtomicU64::new(0),
            recv_counter: AtomicU64::new(0),
            is_initiator,
        }
    }

    fn send_direction(&self) -> Direction {
        if self.is_initiator {
            Direction::InitiatorToResponder
        } else {
            Direction::ResponderToInitiator
        }
    }

    fn recv_direction(&self) -> Direction {
        if self.is_initiator {
            Direction::ResponderToInitiator
        } else {
            Direction::InitiatorToResponder
        }
    }

    /// Encrypt one frame payload. Returns `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.send_counter.fetch_add(1, Ordering::SeqCst);
        if counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce_bytes = build_nonce(self.send_direction(), counter);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload::from(plaintext))
            .map_err(|_| CryptoError::Decrypt)?;
        let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one frame payload previously produced by the peer's `seal`.
    pub fn open(&self, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(AEAD_NONCE_LEN);
        let expected_tag = self.recv_direction().tag();
        let tag = u32::from_le_bytes([nonce_bytes[0], nonce_bytes[1], nonce_bytes[2], nonce_bytes[3]]);
        if tag != expected_tag {
            return Err(CryptoError::Decrypt);
        }
        let nonce = Nonce::from_slice(nonce_bytes);
        self.recv_counter.fetch_add(1, Ordering::SeqCst);
        self.cipher
            .decrypt(nonce, Payload::from(ciphertext))
            .map_err(|_| CryptoError::Decrypt)
    }
}

fn build_nonce(direction: Direction, counter: u64) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[0..4].copy_from_slice(&direction.tag().to_le_bytes());
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn derive_key(
    shared: &x25519_dalek::SharedSecret,
    request_id: u64,
    initiator_public: &PublicKey,
    responder_public: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(SESSION_SALT), shared.as_bytes());
    let mut info = Vec::with_capacity(8 + 32 + 32);
    info.extend_from_slice(&request_id.to_be_bytes());
    info.extend_from_slice(initiator_public.as_bytes());
    info.extend_from_slice(responder_public.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, okm.as_mut_slice())
        .map_err(|_| CryptoError::HkdfExpand)?;
    Ok(okm)
}

/// Anonymous sender encryption against a known static public key (used to
/// seal `NodeInfo` advertisements for a configured management key). An
/// ephemeral keypair is generated per call and its public half is prefixed
/// to the output so the recipient can recover the shared secret.
pub fn seal_box(recipient_public: &PublicKey, plaintext: &[u8]) -> Vec<u8> {
    let ephemeral = EphemeralKeypair::generate();
    let sender_public = ephemeral.public;
    let mut ephemeral = ephemeral;
    let shared = ephemeral.diffie_hellman(recipient_public);
    let hk = Hkdf::<Sha256>::new(Some(b"muti-metroo-sealed-box-v1"), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(sender_public.as_bytes(), key.as_mut_slice())
        .expect("32 bytes is a valid HKDF output length");
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let nonce = Nonce::from_slice(&[0u8; AEAD_NONCE_LEN]);
    let ciphertext = cipher
        .encrypt(nonce, Payload::from(plaintext))
        .expect("chacha20poly1305 encryption is infallible for valid inputs");
    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(sender_public.as_bytes());
    out.extend_from_slice(&ciphertext);
    out
}

/// Opens a `seal_box` payload using the recipient's static secret.
pub fn open_box(
    recipient_secret: &x25519_dalek::StaticSecret,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < 32 {
        return Err(CryptoError::SealedBoxTooShort);
    }
    let (sender_public_bytes, ciphertext) = sealed.split_at(32);
    let mut arr = [0u8; 32];
    arr.copy_from_slice(sender_public_bytes);
    let sender_public = PublicKey::from(arr);
    let shared = recipient_secret.diffie_hellman(&sender_public);
    let hk = Hkdf::<Sha256>::new(Some(b"muti-metroo-sealed-box-v1"), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(sender_public.as_bytes(), key.as_mut_slice())
        .map_err(|_| CryptoError::HkdfExpand)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let nonce = Nonce::from_slice(&[0u8; AEAD_NONCE_LEN]);
    cipher
        .decrypt(nonce, Payload::from(ciphertext))
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_and_responder_derive_matching_keys() {
        let initiator_eph = EphemeralKeypair::generate();
        let responder_eph = EphemeralKeypair::generate();
        let initiator_pub = initiator_eph.public;
        let responder_pub = responder_eph.public;
        let request_id = 0xdead_beef_cafe_babe;

        let responder_key =
            SessionKey::derive_responder(responder_eph, request_id, &initiator_pub).unwrap();
        let initiator_key =
            SessionKey::derive_initiator(initiator_eph, request_id, &responder_pub).unwrap();

        let sealed = initiator_key.seal(b"hello exit").unwrap();
        let opened = responder_key.open(&sealed).unwrap();
        assert_eq!(opened, b"hello exit");
    }

    #[test]
    fn zero_peer_key_is_rejected() {
        let eph = EphemeralKeypair::generate();
        let zero = PublicKey::from([0u8; 32]);
        assert!(matches!(
            SessionKey::derive_initiator(eph, 1, &zero),
            Err(CryptoError::ZeroPeerKey)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let initiator_eph = EphemeralKeypair::generate();
        let responder_eph = EphemeralKeypair::generate();
        let initiator_pub = initiator_eph.public;
        let responder_pub = responder_eph.public;
        let responder_key = SessionKey::derive_responder(responder_eph, 7, &initiator_pub).unwrap();
        let initiator_key = SessionKey::derive_initiator(initiator_eph, 7, &responder_pub).unwrap();

        let mut sealed = initiator_key.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(responder_key.open(&sealed).is_err());
    }

    #[test]
    fn nonces_increase_monotonically_per_direction() {
        let initiator_eph = EphemeralKeypair::generate();
        let responder_eph = EphemeralKeypair::generate();
        let initiator_pub = initiator_eph.public;
        let responder_pub = responder_eph.public;
        let initiator_key = SessionKey::derive_initiator(initiator_eph, 3, &responder_pub).unwrap();
        let _ = responder_pub;
        let _ = SessionKey::derive_responder(responder_eph, 3, &initiator_pub).unwrap();

        let a = initiator_key.seal(b"a").unwrap();
        let b = initiator_key.seal(b"b").unwrap();
        assert_ne!(&a[4..12], &b[4..12]);
    }

    #[test]
    fn seal_box_round_trips() {
        let recipient_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let recipient_public = PublicKey::from(&recipient_secret);
        let sealed = seal_box(&recipient_public, b"node-info payload");
        let opened = open_box(&recipient_secret, &sealed).unwrap();
        assert_eq!(opened, b"node-info payload");
    }
}
