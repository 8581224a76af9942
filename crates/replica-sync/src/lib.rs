//! # Replica Sync
//!
//! Message-driven protocols for authenticated content sync between two
//! peers over a single byte stream.
//!
//! ## Overview
//!
//! A session stacks two [`Protocol`] state machines in a [`MultiProtocol`]:
//!
//! - [`MutualAuthenticator`]: three-message challenge/response handshake
//!   proving both sides hold the secret key for their public key
//! - [`SyncProtocol`]: streams an ordered list of content items in chunks
//!   and writes the peer's items into [`ContentStreams`]
//!
//! The multiplexer gives each protocol its own block of message types and
//! keeps sync locked until a hook on the authenticator's final message
//! unlocks it. [`ProtocolDuplex`] runs the result over any
//! `AsyncRead + AsyncWrite` using the envelope codec from `replica-core`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_core::BoxKeyPair;
//! use replica_sync::{
//!     AuthConfig, MemoryStreams, MultiProtocol, MutualAuthenticator, Protocol,
//!     ProtocolDuplex, Role, SyncConfig, SyncProtocol,
//! };
//!
//! # async fn example(io: tokio::net::TcpStream, peer: replica_core::BoxPublicKey) -> replica_sync::Result<()> {
//! let protocols: Vec<Box<dyn Protocol>> = vec![
//!     Box::new(MutualAuthenticator::new(BoxKeyPair::generate(), Some(peer), AuthConfig::default())),
//!     Box::new(SyncProtocol::new(Arc::new(MemoryStreams::new()), Vec::new(), SyncConfig::default())?),
//! ];
//! let multi = MultiProtocol::new(protocols)?;
//! let report = ProtocolDuplex::new(multi, Role::Initiator).run(io).await?;
//! println!("sent {} frames", report.frames_out);
//! # Ok(())
//! # }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                                Responder
//!   |-------- auth CHALLENGE ------------->|
//!   |<------- auth RESPONSE ---------------|
//!   |-------- auth FINALIZE -------------->|   (sync unlocked on both sides)
//!   |-------- sync START_ID(id) ---------->|
//!   |-------- sync DATA ... -------------->|
//!   |-------- sync END_ID(id) ------------>|
//!   |<------- sync FINALIZE ---------------|
//!   |-------- sync FINALIZE -------------->|
//! ```

pub mod auth;
pub mod duplex;
pub mod error;
pub mod memory;
pub mod multi;
pub mod protocol;
pub mod repo;
pub mod sync;

pub use auth::{AuthConfig, MutualAuthenticator};
pub use duplex::{DuplexReport, ProtocolDuplex, Role, DEFAULT_OUTBOUND_BUFFER};
pub use error::{ProtocolError, Result, SyncError, SyncResult};
pub use memory::MemoryStreams;
pub use multi::{
    Direction, Hook, HookEvent, MultiProtocol, ProtocolId, Transition, RESERVED_MESSAGE_SLOTS,
};
pub use protocol::{MessageSink, Protocol};
pub use sync::{ContentId, ContentStreams, IdSource, SyncConfig, SyncProtocol, SyncStats};
