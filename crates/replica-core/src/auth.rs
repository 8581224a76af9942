//! Mutual authentication primitive.
//!
//! Stateless challenge/response steps proving that both peers hold the
//! secret key for the public key they claim. The protocol state machine
//! lives in `replica-sync`; this module only encrypts, decrypts, mutates
//! and compares.
//!
//! ```text
//! Alice                                          Bob
//!   | challenge: pk_A, box_A->B(c)                |   Alice stores mutate(c)
//!   |-------------------------------------------->|
//!   |            response: box_B->A(mutate(c))    |   Bob stores mutate(mutate(c))
//!   |<--------------------------------------------|
//!   | finalize: box_A->B(mutate(mutate(c)))       |   Alice checked Bob
//!   |-------------------------------------------->|   Bob checks Alice
//! ```
//!
//! Message 2 proves Bob to Alice, message 3 proves Alice to Bob. Each proof
//! is a value only the holder of the matching secret key could decrypt,
//! passed through [`mutate`] so it cannot be echoed back unchanged.

use rand::RngCore;

use crate::crypto::{BoxKeyPair, BoxNonce, BoxPublicKey};
use crate::error::AuthError;

/// Default challenge length in bytes.
pub const DEFAULT_CHALLENGE_SIZE: usize = 32;

const MUTATE_CONTEXT: &str = "replica mutual-auth v0 mutate";

/// First handshake message: the initiator's public key and an encrypted
/// random challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub public_key: BoxPublicKey,
    pub nonce: BoxNonce,
    pub ciphertext: Vec<u8>,
}

/// Response and finalize messages: a sealed, mutated challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: BoxNonce,
    pub ciphertext: Vec<u8>,
}

/// The value we expect the peer to prove it can produce.
#[derive(Clone, PartialEq, Eq)]
pub struct Expected(Vec<u8>);

impl Expected {
    /// Constant-time comparison against a received value.
    pub fn matches(&self, received: &[u8]) -> bool {
        self.0.len() == received.len()
            && self
                .0
                .iter()
                .zip(received)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Expected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Expected({} bytes)", self.0.len())
    }
}

/// Deterministic, non-identity transform binding a value to a handshake step.
///
/// Output has the input's length: the blake3 XOF of the input under a
/// dedicated derive-key context.
pub fn mutate(input: &[u8]) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new_derive_key(MUTATE_CONTEXT);
    hasher.update(input);
    let mut out = vec![0u8; input.len()];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Step 1 (initiator): encrypt a fresh random challenge to `peer`.
pub fn create_challenge(
    own: &BoxKeyPair,
    peer: &BoxPublicKey,
    size: usize,
) -> Result<(Challenge, Expected), AuthError> {
    if size == 0 {
        return Err(AuthError::InvalidChallengeSize(size));
    }

    let mut challenge = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut challenge);

    let (nonce, ciphertext) = own.seal(peer, &challenge)?;
    let expected = Expected(mutate(&challenge));

    Ok((
        Challenge {
            public_key: own.public_key(),
            nonce,
            ciphertext,
        },
        expected,
    ))
}

/// Step 2 (responder): decrypt the challenge and answer with its mutation.
///
/// Returns the reply and the value the initiator's finalize must carry.
pub fn answer_challenge(
    own: &BoxKeyPair,
    challenge: &Challenge,
) -> Result<(Sealed, Expected), AuthError> {
    let decrypted = own.open(&challenge.public_key, &challenge.nonce, &challenge.ciphertext)?;
    if decrypted.is_empty() {
        return Err(AuthError::MalformedMessage("empty challenge".into()));
    }

    let reply = mutate(&decrypted);
    let expected = Expected(mutate(&reply));
    let (nonce, ciphertext) = own.seal(&challenge.public_key, &reply)?;

    Ok((Sealed { nonce, ciphertext }, expected))
}

/// Step 3 (initiator): check the responder's proof and produce our own.
pub fn confirm_response(
    own: &BoxKeyPair,
    peer: &BoxPublicKey,
    response: &Sealed,
    expected: &Expected,
) -> Result<Sealed, AuthError> {
    let decrypted = own.open(peer, &response.nonce, &response.ciphertext)?;
    if !expected.matches(&decrypted) {
        return Err(AuthError::PeerAuthenticationFailed);
    }

    let proof = mutate(&decrypted);
    let (nonce, ciphertext) = own.seal(peer, &proof)?;
    Ok(Sealed { nonce, ciphertext })
}

/// Step 4 (responder): check the initiator's proof.
pub fn verify_finalize(
    own: &BoxKeyPair,
    peer: &BoxPublicKey,
    finalize: &Sealed,
    expected: &Expected,
) -> Result<(), AuthError> {
    let decrypted = own.open(peer, &finalize.nonce, &finalize.ciphertext)?;
    if !expected.matches(&decrypted) {
        return Err(AuthError::AuthenticationFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_full_exchange() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();

        let (challenge, alice_expected) =
            create_challenge(&alice, &bob.public_key(), DEFAULT_CHALLENGE_SIZE).unwrap();
        let (response, bob_expected) = answer_challenge(&bob, &challenge).unwrap();
        let finalize =
            confirm_response(&alice, &bob.public_key(), &response, &alice_expected).unwrap();
        verify_finalize(&bob, &alice.public_key(), &finalize, &bob_expected).unwrap();
    }

    #[test]
    fn test_challenge_for_someone_else() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let carol = BoxKeyPair::generate();

        let (challenge, _) = create_challenge(&alice, &carol.public_key(), 32).unwrap();
        assert_eq!(
            answer_challenge(&bob, &challenge).unwrap_err(),
            AuthError::DecryptionFailed
        );
    }

    #[test]
    fn test_echoed_response_rejected() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();

        let (challenge, expected) = create_challenge(&alice, &bob.public_key(), 32).unwrap();
        // Bob decrypts but sends the raw challenge back instead of its mutation.
        let raw = bob
            .open(&alice.public_key(), &challenge.nonce, &challenge.ciphertext)
            .unwrap();
        let (nonce, ciphertext) = bob.seal(&alice.public_key(), &raw).unwrap();
        let echoed = Sealed { nonce, ciphertext };

        assert_eq!(
            confirm_response(&alice, &bob.public_key(), &echoed, &expected).unwrap_err(),
            AuthError::PeerAuthenticationFailed
        );
    }

    #[test]
    fn test_wrong_finalize_rejected() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();

        let (challenge, _) = create_challenge(&alice, &bob.public_key(), 32).unwrap();
        let (_, bob_expected) = answer_challenge(&bob, &challenge).unwrap();

        let (nonce, ciphertext) = alice.seal(&bob.public_key(), &[0u8; 32]).unwrap();
        let bogus = Sealed { nonce, ciphertext };
        assert_eq!(
            verify_finalize(&bob, &alice.public_key(), &bogus, &bob_expected).unwrap_err(),
            AuthError::AuthenticationFailed
        );
    }

    #[test]
    fn test_zero_size_challenge_rejected() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        assert_eq!(
            create_challenge(&alice, &bob.public_key(), 0).unwrap_err(),
            AuthError::InvalidChallengeSize(0)
        );
    }

    proptest! {
        #[test]
        fn test_mutate_deterministic_and_not_identity(input in prop::collection::vec(any::<u8>(), 16..128)) {
            let once = mutate(&input);
            prop_assert_eq!(once.len(), input.len());
            prop_assert_eq!(&once, &mutate(&input));
            prop_assert_ne!(&once, &input);
        }
    }
}
