//! StorageBackend trait: the interface a repository drives its storage through.
//!
//! A repository resolves caller names to [`RepoPath`]s and hands them to
//! one of the backends. Implementations:
//!
//! - [`FsBackend`](crate::fs::FsBackend) - plain files under the repository root
//! - [`LogBackend`](crate::log::LogBackend) - content-addressed append-only log

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::path::RepoPath;

/// A readable byte stream over stored content.
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// A pending write.
///
/// Bytes become visible under the target name only after [`commit`].
/// Dropping a writer without committing discards everything written.
///
/// [`commit`]: ContentWriter::commit
#[async_trait]
pub trait ContentWriter: Send {
    /// Append bytes to the pending content.
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Make the content visible. Returns the total size of the stored entry.
    async fn commit(self: Box<Self>) -> Result<u64>;
}

/// Which backend a repository stores its content with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain files under the repository root.
    #[default]
    Filesystem,
    /// Content-addressed blob log plus an SQLite entry index.
    Log,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Filesystem => write!(f, "filesystem"),
            BackendKind::Log => write!(f, "log"),
        }
    }
}

/// Kind of a repository entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata about a repository entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub kind: EntryKind,
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    pub modified: Option<SystemTime>,
}

impl Stat {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// How a write opens its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace existing content.
    Truncate,
    /// Keep existing content and write after it.
    Append,
}

/// The storage interface behind a [`Repository`](crate::Repository).
///
/// Paths are already resolved and contained; backends never see `..`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    /// Metadata for an entry. `NotFound` if nothing exists at `path`.
    async fn stat(&self, path: &RepoPath) -> Result<Stat>;

    /// Names directly inside a directory, sorted.
    async fn readdir(&self, path: &RepoPath) -> Result<Vec<String>>;

    /// Create a directory and any missing parents.
    async fn mkdir(&self, path: &RepoPath) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Open a file for reading.
    async fn open_read(&self, path: &RepoPath) -> Result<ContentReader>;

    /// Open a file for writing. Missing parent directories are created on commit.
    async fn open_write(&self, path: &RepoPath, mode: WriteMode) -> Result<Box<dyn ContentWriter>>;
}
