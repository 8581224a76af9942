//! # Replica Store
//!
//! Repository storage for Replica nodes. A repository is a tree of named
//! files behind a pluggable backend; a pool keeps a bounded number of them
//! open and finds the rest on disk.
//!
//! ## Overview
//!
//! Callers name entries with plain strings. The [`Repository`] resolves
//! every name against its root before touching storage, so a name can
//! never reach outside the repository. Writes are staged and become
//! visible only on [`ContentWriter::commit`].
//!
//! ## Key Types
//!
//! - [`StorageBackend`] - The async trait every backend implements
//! - [`FsBackend`] - Plain files under the repository root
//! - [`LogBackend`] - Content-addressed blob log with an SQLite entry index
//! - [`Repository`] - Name resolution, open modes, listing, mime sniffing
//! - [`Template`] - Seeds a new repository from a directory or a function
//! - [`RepositoryPool`] - LRU-bounded pool with persistent identity
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_store::{PoolConfig, RepositoryPool, WriteMode};
//!
//! async fn example() -> replica_store::Result<()> {
//!     let pool = RepositoryPool::open(PoolConfig::new("/var/lib/replica")).await?;
//!     let (id, repo) = pool.create(None).await?;
//!
//!     let mut writer = repo.open_write("hello.txt", WriteMode::Truncate).await?;
//!     writer.write(b"hello").await?;
//!     writer.commit().await?;
//!
//!     assert!(pool.get(&id).await?.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Containment**: `..` beyond the root is `PathEscape`, never clamped
//! - **Staged writes**: dropping an uncommitted writer discards its bytes
//! - **Deduplication**: the log backend stores each distinct blob once
//! - **Silent eviction**: evicted repositories reopen from disk on demand

pub mod backend;
pub mod error;
pub mod fs;
pub mod log;
pub mod migration;
pub mod path;
pub mod pool;
pub mod repository;
pub mod template;

pub use backend::{
    BackendKind, ContentReader, ContentWriter, EntryKind, Stat, StorageBackend, WriteMode,
};
pub use error::{Result, StoreError};
pub use fs::FsBackend;
pub use log::LogBackend;
pub use path::RepoPath;
pub use pool::{PoolConfig, RepoId, RepositoryPool, DEFAULT_POOL_SIZE};
pub use repository::{OpenMode, RepoStream, Repository, DEFAULT_MIME};
pub use template::{SetupFn, Template};
