//! Typed error taxonomy. Subsystems return their own precise error so
//! callers (notably a SOCKS5 front-end) can match on kind; `AgentError`
//! unifies them at the top level via `#[from]`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity files are corrupt")]
    Corrupt,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("peer supplied an all-zero ephemeral key")]
    ZeroPeerKey,
    #[error("HKDF output length invalid")]
    HkdfExpand,
    #[error("AEAD decryption failed (frame corrupt or tampered)")]
    Decrypt,
    #[error("AEAD nonce counter exhausted for this direction")]
    NonceExhausted,
    #[error("sealed box ciphertext too short")]
    SealedBoxTooShort,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame payload {0} exceeds MAX_PAYLOAD ({1})")]
    PayloadTooLarge(usize, usize),
    #[error("buffer too short to decode a full frame")]
    Truncated,
    #[error("unknown frame type byte {0:#x}")]
    UnknownFrameType(u8),
    #[error("unknown address type byte {0:#x}")]
    UnknownAddrType(u8),
    #[error("malformed field: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("stream open timed out")]
    OpenTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("route would create a loop through the local agent")]
    Loop,
    #[error("advertisement sequence {0} is not newer than stored {1}")]
    SequenceRegression(u32, u32),
    #[error("path or seen-by list contains a duplicate agent id")]
    DuplicateInVector,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stream id {0} already has a relay entry")]
    Collision(u64),
    #[error("no relay entry for stream id {0}")]
    UnknownStream(u64),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no pending request with id {0}")]
    UnknownRequest(u64),
    #[error("no live stream with id {0}")]
    UnknownStream(u64),
    #[error("stream open was refused: {code:?} {message}")]
    Refused { code: OpenErrorCode, message: String },
    #[error("stream open timed out")]
    Timeout,
}

/// Error codes carried on the wire in `STREAM_OPEN_ERR` / `UDP_OPEN_ERR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpenErrorCode {
    HostUnreachable = 1,
    ConnectionRefused = 2,
    ConnectionLimit = 3,
    ConnectionTimeout = 4,
    NoRoute = 5,
    UdpDisabled = 6,
    IcmpDisabled = 7,
    ForwardNotFound = 8,
    NotAllowed = 9,
    GeneralFailure = 10,
}

impl OpenErrorCode {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::HostUnreachable,
            2 => Self::ConnectionRefused,
            3 => Self::ConnectionLimit,
            4 => Self::ConnectionTimeout,
            5 => Self::NoRoute,
            6 => Self::UdpDisabled,
            7 => Self::IcmpDisabled,
            8 => Self::ForwardNotFound,
            9 => Self::NotAllowed,
            _ => Self::GeneralFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}
