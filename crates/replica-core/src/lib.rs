//! # Replica Core
//!
//! Pure primitives shared by the Replica protocol stack: the [`Message`]
//! type, the [`envelope`] wire framing, box encryption keys and the
//! stateless mutual-authentication primitive.
//!
//! This crate does no storage and no networking. The [`EnvelopeCodec`]
//! only plugs the framing into `tokio_util::codec`; it never touches a
//! socket itself.
//!
//! ## Key Types
//!
//! - [`Message`] - A typed protocol message (`u8` type + payload of at most 65535 bytes)
//! - [`envelope::encode`] / [`envelope::decode`] - Wire framing with SHA-256 checksum
//! - [`Keypair`] - Ed25519 node identity, convertible into a [`BoxKeyPair`]
//! - [`BoxKeyPair`] - X25519 + XChaCha20-Poly1305 authenticated encryption
//! - [`auth`] - Challenge/response steps of the three-message handshake
//!
//! ## Envelope Layout
//!
//! ```text
//! +------+--------+--------+-----------------+----------------------+
//! | type | len_hi | len_lo | payload (len)   | sha256(preceding, 32)|
//! +------+--------+--------+-----------------+----------------------+
//! ```

pub mod auth;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod message;

pub use auth::{mutate, Challenge, Expected, Sealed, DEFAULT_CHALLENGE_SIZE};
pub use crypto::{BoxKeyPair, BoxNonce, BoxPublicKey, Ed25519PublicKey, Keypair};
pub use envelope::{EnvelopeCodec, ENVELOPE_OVERHEAD};
pub use error::{AuthError, CodecError, FrameError};
pub use message::{Message, MAX_PAYLOAD_LEN};
