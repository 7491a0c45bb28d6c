//! Long-lived agent identity: a random 256-bit ID plus a static X25519 keypair.
//!
//! The static keypair is only used to seal/open `NodeInfo` payloads for a
//! configured management key (see `routing`); per-stream session keys always
//! use fresh ephemeral keys (see `crypto`), never this identity.

use std::fmt;
use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::IdentityError;

/// Opaque 256-bit agent identifier. Ordering and equality are plain byte
/// comparison so routing tables can use it as a tie-break key directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(pub [u8; 32]);

impl AgentId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.short())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Agent identity: ID plus static X25519 keypair, persisted under a data
/// directory across restarts.
pub struct AgentIdentity {
    pub id: AgentId,
    static_secret: Zeroizing<[u8; 32]>,
    pub static_public: PublicKey,
}

impl AgentIdentity {
    const ID_FILE: &'static str = "agent.id";
    const KEY_FILE: &'static str = "identity.key";

    /// Load identity files from `data_dir`, generating and persisting a
    /// fresh identity if either file is missing.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, IdentityError> {
        let id_path = data_dir.join(Self::ID_FILE);
        let key_path = data_dir.join(Self::KEY_FILE);

        if id_path.exists() && key_path.exists() {
            let id_bytes = fs::read(&id_path)?;
            let key_bytes = fs::read(&key_path)?;
            if id_bytes.len() != 32 || key_bytes.len() != 32 {
                return Err(IdentityError::Corrupt);
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(&id_bytes);
            let mut secret = [0u8; 32];
            secret.copy_from_slice(&key_bytes);
            let static_secret = Zeroizing::new(secret);
            let static_public = PublicKey::from(&StaticSecret::from(*static_secret));
            return Ok(Self {
                id: AgentId(id),
                static_secret,
                static_public,
            });
        }

        fs::create_dir_all(data_dir)?;
        let id = AgentId::random();
        let secret = StaticSecret::random_from_rng(OsRng);
        let static_public = PublicKey::from(&secret);
        let static_secret = Zeroizing::new(secret.to_bytes());

        fs::write(&id_path, id.0)?;
        write_private_key_file(&key_path, static_secret.as_slice())?;

        log::info!("generated new agent identity {}", id);
        Ok(Self {
            id,
            static_secret,
            static_public,
        })
    }

    pub fn static_secret(&self) -> StaticSecret {
        StaticSecret::from(*self.static_secret)
    }
}

#[cfg(unix)]
fn write_private_key_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private_key_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(AgentId::random(), AgentId::random());
    }

    #[test]
    fn load_or_create_round_trips() {
        let dir = std::env::temp_dir().join(format!("muti-metroo-test-{}", AgentId::random()));
        let first = AgentIdentity::load_or_create(&dir).unwrap();
        let second = AgentIdentity::load_or_create(&dir).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.static_public.as_bytes(), second.static_public.as_bytes());
        let _ = fs::remove_dir_all(&dir);
    }
}
