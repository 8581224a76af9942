//! Error types for the sync module.

use replica_core::{AuthError, CodecError, FrameError};
use replica_store::StoreError;
use thiserror::Error;

/// Content transfer failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// DATA or END_ID arrived with no write stream open.
    #[error("no open write stream")]
    NoOpenStream,

    #[error("cannot open {id} for reading: {source}")]
    OpenRead {
        id: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("cannot open {id} for writing: {source}")]
    OpenWrite {
        id: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] StoreError),

    /// Identifier bytes are not usable as a content name.
    #[error("invalid content identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid chunk size {0}: must be between 1 and 65535")]
    InvalidChunkSize(usize),

    #[error("unknown sync message type: {0}")]
    UnknownMessageType(u8),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced by protocol state machines and the transports driving them.
///
/// Every variant is fatal for the connection it occurred on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// No sub-protocol owns this composed message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Traffic for a sub-protocol that has not been unlocked yet.
    #[error("protocol {0} is locked")]
    ProtocolLocked(&'static str),

    #[error("invalid message mapping: {0}")]
    InvalidMapping(String),

    /// The outgoing channel was closed by the writer.
    #[error("outgoing message channel closed")]
    SinkClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Frame(e) => ProtocolError::Frame(e),
            CodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Result type for content stream operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
