//! Mutual authentication protocol.
//!
//! Three messages prove to both sides that the other holds the secret key
//! for the public key it presents:
//!
//! ```text
//! Initiator                                   Responder
//!   |-- CHALLENGE  pubkey | nonce | box(c) ------->|
//!   |<------------ RESPONSE  nonce | box(m(c)) ----|
//!   |-- FINALIZE   nonce | box(m(m(c))) --------->|
//! ```
//!
//! The cryptographic steps live in [`replica_core::auth`]; this module owns
//! the state machine and the wire layout of each payload.

use std::any::Any;
use std::ops::Range;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use replica_core::auth::{self as handshake, Challenge, Expected, Sealed};
use replica_core::{AuthError, BoxKeyPair, BoxNonce, BoxPublicKey, Message, DEFAULT_CHALLENGE_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{MessageSink, Protocol};

/// Local message types.
pub mod msg {
    pub const CHALLENGE: u8 = 0;
    pub const RESPONSE: u8 = 1;
    pub const FINALIZE: u8 = 2;
}

/// Authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Random challenge length in bytes.
    pub challenge_size: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_size: DEFAULT_CHALLENGE_SIZE,
        }
    }
}

/// Handshake progress.
#[derive(Debug)]
enum AuthState {
    Idle,
    /// We sent CHALLENGE and expect the peer's proof in RESPONSE.
    ChallengeSent { expected: Expected },
    /// We sent RESPONSE and expect the peer's proof in FINALIZE.
    ResponseSent { expected: Expected },
    Authenticated,
}

/// The mutual authentication state machine.
pub struct MutualAuthenticator {
    keys: BoxKeyPair,
    /// Key the peer must present, if we know it up front.
    configured_peer: Option<BoxPublicKey>,
    peer: Option<BoxPublicKey>,
    config: AuthConfig,
    state: AuthState,
    peer_authenticated: bool,
}

impl MutualAuthenticator {
    /// Create an authenticator. `peer` is required to initiate; a responder
    /// may leave it unset and learn it from the challenge.
    pub fn new(keys: BoxKeyPair, peer: Option<BoxPublicKey>, config: AuthConfig) -> Self {
        debug!(own = %keys.public_key().short(), "initialized authenticator");
        Self {
            keys,
            configured_peer: peer,
            peer,
            config,
            state: AuthState::Idle,
            peer_authenticated: false,
        }
    }

    /// Whether the peer has proven possession of its key.
    pub fn peer_authenticated(&self) -> bool {
        self.peer_authenticated
    }

    /// The peer's public key, once known.
    pub fn peer_public_key(&self) -> Option<&BoxPublicKey> {
        self.peer.as_ref()
    }

    pub fn public_key(&self) -> BoxPublicKey {
        self.keys.public_key()
    }

    /// Forget handshake progress. Keys are kept.
    pub fn reset(&mut self) {
        self.state = AuthState::Idle;
        self.peer = self.configured_peer;
        self.peer_authenticated = false;
    }

    fn own(&self) -> String {
        self.keys.public_key().short()
    }

    async fn handle_challenge(&mut self, payload: &[u8], sink: &mut dyn MessageSink) -> Result<()> {
        if !matches!(self.state, AuthState::Idle) {
            warn!(
                own = %self.own(),
                state = ?self.state,
                "challenge received mid-handshake, restarting authentication"
            );
            self.reset();
        }

        let challenge = decode_challenge(payload)?;
        if let Some(expected) = &self.configured_peer {
            if *expected != challenge.public_key {
                return Err(AuthError::PeerKeyMismatch.into());
            }
        }

        let (reply, expected) = handshake::answer_challenge(&self.keys, &challenge)?;
        self.peer = Some(challenge.public_key);
        self.state = AuthState::ResponseSent { expected };

        debug!(own = %self.own(), peer = %challenge.public_key.short(), "answered challenge");
        sink.send(Message::new(msg::RESPONSE, encode_sealed(&reply))?)
            .await
    }

    async fn handle_response(&mut self, payload: &[u8], sink: &mut dyn MessageSink) -> Result<()> {
        let expected = match &self.state {
            AuthState::ChallengeSent { expected } => expected,
            AuthState::Idle => {
                return Err(AuthError::BadProtocolState("authentication not yet initiated").into())
            }
            _ => {
                return Err(AuthError::BadProtocolState(
                    "response received without an outstanding challenge",
                )
                .into())
            }
        };
        let peer = self
            .peer
            .ok_or(AuthError::BadProtocolState("no peer key for response"))?;

        let response = decode_sealed(payload)?;
        let proof = handshake::confirm_response(&self.keys, &peer, &response, expected)?;

        self.peer_authenticated = true;
        self.state = AuthState::Authenticated;
        info!(own = %self.own(), peer = %peer.short(), "peer authenticated");

        sink.send(Message::new(msg::FINALIZE, encode_sealed(&proof))?)
            .await
    }

    fn handle_finalize(&mut self, payload: &[u8]) -> Result<()> {
        let expected = match &self.state {
            AuthState::ResponseSent { expected } => expected,
            AuthState::Idle => {
                return Err(AuthError::BadProtocolState("authentication not yet initiated").into())
            }
            _ => {
                return Err(AuthError::BadProtocolState(
                    "finalize received without a sent response",
                )
                .into())
            }
        };
        let peer = self
            .peer
            .ok_or(AuthError::BadProtocolState("no peer key for finalize"))?;

        let finalize = decode_sealed(payload)?;
        handshake::verify_finalize(&self.keys, &peer, &finalize, expected)?;

        self.peer_authenticated = true;
        self.state = AuthState::Authenticated;
        info!(own = %self.own(), peer = %peer.short(), "peer authenticated");
        Ok(())
    }
}

impl std::fmt::Debug for MutualAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutualAuthenticator")
            .field("own", &self.keys.public_key())
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("peer_authenticated", &self.peer_authenticated)
            .finish()
    }
}

#[async_trait]
impl Protocol for MutualAuthenticator {
    fn name(&self) -> &'static str {
        "mutual-auth"
    }

    fn message_range(&self) -> Range<u8> {
        msg::CHALLENGE..msg::FINALIZE + 1
    }

    async fn initiate(&mut self, sink: &mut dyn MessageSink) -> Result<()> {
        self.reset();
        let peer = self
            .peer
            .ok_or(AuthError::BadProtocolState("cannot initiate without a peer key"))?;

        let (challenge, expected) =
            handshake::create_challenge(&self.keys, &peer, self.config.challenge_size)?;
        self.state = AuthState::ChallengeSent { expected };

        debug!(own = %self.own(), peer = %peer.short(), "sending challenge");
        sink.send(Message::new(msg::CHALLENGE, encode_challenge(&challenge))?)
            .await
    }

    async fn consume(
        &mut self,
        msg_type: u8,
        payload: Bytes,
        sink: &mut dyn MessageSink,
    ) -> Result<()> {
        match msg_type {
            msg::CHALLENGE => self.handle_challenge(&payload, sink).await,
            msg::RESPONSE => self.handle_response(&payload, sink).await,
            msg::FINALIZE => self.handle_finalize(&payload),
            other => Err(AuthError::UnknownMessageType(other).into()),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire layout
// ─────────────────────────────────────────────────────────────────────────────

/// `pubkey(32) | nonce(24) | ciphertext`
pub fn encode_challenge(challenge: &Challenge) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(BoxPublicKey::LEN + BoxNonce::LEN + challenge.ciphertext.len());
    buf.put_slice(challenge.public_key.as_bytes());
    buf.put_slice(challenge.nonce.as_bytes());
    buf.put_slice(&challenge.ciphertext);
    buf.freeze()
}

pub fn decode_challenge(payload: &[u8]) -> std::result::Result<Challenge, AuthError> {
    let header = BoxPublicKey::LEN + BoxNonce::LEN;
    if payload.len() <= header {
        return Err(AuthError::MalformedMessage(format!(
            "challenge of {} bytes, need more than {}",
            payload.len(),
            header
        )));
    }
    Ok(Challenge {
        public_key: BoxPublicKey::from_slice(&payload[..BoxPublicKey::LEN])?,
        nonce: BoxNonce::from_slice(&payload[BoxPublicKey::LEN..header])?,
        ciphertext: payload[header..].to_vec(),
    })
}

/// `nonce(24) | ciphertext`
pub fn encode_sealed(sealed: &Sealed) -> Bytes {
    let mut buf = BytesMut::with_capacity(BoxNonce::LEN + sealed.ciphertext.len());
    buf.put_slice(sealed.nonce.as_bytes());
    buf.put_slice(&sealed.ciphertext);
    buf.freeze()
}

pub fn decode_sealed(payload: &[u8]) -> std::result::Result<Sealed, AuthError> {
    if payload.len() <= BoxNonce::LEN {
        return Err(AuthError::MalformedMessage(format!(
            "sealed message of {} bytes, need more than {}",
            payload.len(),
            BoxNonce::LEN
        )));
    }
    Ok(Sealed {
        nonce: BoxNonce::from_slice(&payload[..BoxNonce::LEN])?,
        ciphertext: payload[BoxNonce::LEN..].to_vec(),
    })
}
