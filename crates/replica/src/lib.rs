//! # Replica
//!
//! Content repositories kept in sync between peers that prove their
//! identity to each other.
//!
//! ## Overview
//!
//! A [`Node`] ties the component crates together:
//!
//! - **Storage** (`replica::store`): an LRU-bounded pool of repositories,
//!   each backed by the filesystem or by a content-addressed log
//! - **Sync** (`replica::sync`): mutual authentication followed by chunked
//!   transfer of named items, multiplexed over one connection
//! - **Core** (`replica::core`): envelope framing and key material
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica::{Node, NodeConfig};
//! use replica::core::Keypair;
//! use replica::sync::ContentId;
//!
//! async fn example() -> replica::Result<()> {
//!     let node = Arc::new(Node::open(Keypair::generate(), NodeConfig::new("data")).await?);
//!
//!     // Create a repository and put something in it
//!     let (repo_id, repo) = node.pool().create(None).await?;
//!     let mut writer = repo.open_write("1", replica::store::WriteMode::Truncate).await?;
//!     writer.write(b"hello").await?;
//!     writer.commit().await?;
//!
//!     // Push it to a peer whose public key we know
//!     # let peer_key = Keypair::generate().box_public_key();
//!     let report = node
//!         .sync_to("127.0.0.1:7700", peer_key, repo_id, vec![ContentId::from(1u64)])
//!         .await?;
//!     println!("sent {} items", report.transfer.items_sent);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `replica::core` - framing, keys and handshake crypto
//! - `replica::store` - repositories and the pool
//! - `replica::sync` - protocols, multiplexer and duplex adapter

pub mod config;
pub mod error;
pub mod node;
pub mod session;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{Node, SessionReport, AUTH_PROTOCOL, SYNC_PROTOCOL};
pub use session::{ConnectionId, SessionGuard, SessionInfo, SessionRegistry};

// Re-export component crates
pub use replica_core as core;
pub use replica_store as store;
pub use replica_sync as sync;

// Re-export commonly used types
pub use replica_core::{BoxPublicKey, Keypair};
pub use replica_store::{BackendKind, PoolConfig, RepoId, Repository, RepositoryPool};
pub use replica_sync::{ContentId, Role};
