//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during repository and pool operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing exists under this name.
    #[error("does not exist or inaccessible: {0}")]
    NotFound(String),

    /// The name resolves outside the repository root.
    #[error("path escapes repository root: {0}")]
    PathEscape(String),

    /// A directory operation hit a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation hit a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Something already occupies this location.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No repository with this id in the pool.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Malformed repository id.
    #[error("invalid repository id: {0}")]
    InvalidId(String),

    /// Template population failed.
    #[error("template error: {0}")]
    Template(String),

    /// Database error from the log backend's index.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Pool metadata serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A blocking storage task did not complete.
    #[error("storage task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
