//! # Replica Testkit
//!
//! Testing utilities for Replica.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: envelope frames with known checksums, for checking
//!   other implementations of the wire format
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: nodes and pools on temporary directories
//!
//! ## Golden Vectors
//!
//! ```rust
//! use replica_testkit::vectors::verify_all_vectors;
//!
//! for (name, ok, checksum) in verify_all_vectors() {
//!     assert!(ok, "{name}: {checksum}");
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use replica_testkit::generators::message;
//!
//! proptest! {
//!     #[test]
//!     fn envelope_len_matches(msg in message(1024)) {
//!         let frame = replica_core::envelope::encode(&msg);
//!         prop_assert_eq!(frame.len(), msg.payload().len() + 35);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use replica_testkit::fixtures::TestNode;
//! use replica_store::BackendKind;
//!
//! # async fn example() -> replica::Result<()> {
//! let node = TestNode::new(1, BackendKind::Filesystem).await?;
//! let (id, repo) = node.repo_with(&[("1", &b"hello"[..])]).await?;
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{node_fixtures, TestNode, TestPool};
pub use vectors::{all_vectors, verify_all_vectors, GoldenVector};

/// Install a test-friendly `tracing` subscriber once.
///
/// Filtering follows `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
