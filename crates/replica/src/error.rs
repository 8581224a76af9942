//! Error types for the node.

use replica_store::StoreError;
use replica_sync::{ProtocolError, SyncError};
use thiserror::Error;

use crate::session::ConnectionId;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Session protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network or file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A session with this id is already registered.
    #[error("session already registered: {0}")]
    SessionExists(ConnectionId),
}

impl From<SyncError> for NodeError {
    fn from(err: SyncError) -> Self {
        NodeError::Protocol(ProtocolError::Sync(err))
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
