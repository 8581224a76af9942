//! Error types for Replica Core.

use thiserror::Error;

/// Malformed envelope. Always fatal for the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("length mismatch: header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("payload too large: {0} bytes exceeds the 65535 byte frame limit")]
    PayloadTooLarge(usize),
}

/// Errors from the streaming envelope codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Authentication failures. Fatal for the connection; never retried here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown authentication message type: {0}")]
    UnknownMessageType(u8),

    #[error("bad protocol state: {0}")]
    BadProtocolState(&'static str),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// The peer's finalize proof did not match what we expected.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The peer's response to our challenge did not match what we expected.
    #[error("cannot authenticate peer")]
    PeerAuthenticationFailed,

    #[error("peer advertised a public key that does not match the expected key")]
    PeerKeyMismatch,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid challenge size: {0}")]
    InvalidChallengeSize(usize),

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}
