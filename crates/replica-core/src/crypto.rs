//! Cryptographic primitives for Replica.
//!
//! Node identities are Ed25519 keys. The handshake needs authenticated
//! asymmetric encryption, so identities convert into [`BoxKeyPair`]s:
//! X25519 key agreement, a blake3-derived symmetric key, and
//! XChaCha20-Poly1305 with a random 24-byte nonce.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::AuthError;

const BOX_KEY_CONTEXT: &str = "replica box v0 shared key";

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

/// A node identity keypair.
///
/// This wraps ed25519-dalek's SigningKey. The authenticator works on the
/// X25519 form obtained with [`Keypair::to_box_keypair`].
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// The X25519 public key matching [`Keypair::to_box_keypair`].
    pub fn box_public_key(&self) -> BoxPublicKey {
        BoxPublicKey(self.signing_key.verifying_key().to_montgomery().to_bytes())
    }

    /// Convert into the encryption key pair used by the authenticator.
    pub fn to_box_keypair(&self) -> BoxKeyPair {
        BoxKeyPair::from_secret(StaticSecret::from(self.signing_key.to_scalar_bytes()))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// An X25519 public key used for box encryption.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxPublicKey(pub [u8; 32]);

impl BoxPublicKey {
    /// Key length in bytes.
    pub const LEN: usize = 32;

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| AuthError::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        format!("{}...{}", &hex[..6], &hex[hex.len() - 6..])
    }
}

impl fmt::Debug for BoxPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxPub({})", self.short())
    }
}

impl fmt::Display for BoxPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// A 192-bit XChaCha20-Poly1305 nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxNonce(pub [u8; 24]);

impl BoxNonce {
    /// Nonce length in bytes.
    pub const LEN: usize = 24;

    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from a slice of exactly 24 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 24] = bytes
            .try_into()
            .map_err(|_| AuthError::MalformedMessage("nonce must be 24 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }
}

/// Key pair for authenticated asymmetric encryption.
///
/// The public half is stored next to the secret rather than recomputed, so
/// a key source can hand over a pair whose halves do not belong together.
/// Such a pair fails the handshake at the peer, which is what the
/// authenticator relies on.
#[derive(Clone)]
pub struct BoxKeyPair {
    public: BoxPublicKey,
    secret: StaticSecret,
}

impl BoxKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_secret_bytes(bytes)
    }

    /// Create from raw secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    /// Create from an explicit public key and secret, without checking that
    /// they match.
    pub fn from_parts(public: BoxPublicKey, secret_bytes: [u8; 32]) -> Self {
        Self {
            public,
            secret: StaticSecret::from(secret_bytes),
        }
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = BoxPublicKey(*PublicKey::from(&secret).as_bytes());
        Self { public, secret }
    }

    /// The advertised public key.
    pub fn public_key(&self) -> BoxPublicKey {
        self.public
    }

    /// Encrypt `plaintext` to `peer` under a fresh random nonce.
    pub fn seal(
        &self,
        peer: &BoxPublicKey,
        plaintext: &[u8],
    ) -> Result<(BoxNonce, Vec<u8>), AuthError> {
        let cipher = self.cipher(peer)?;
        let nonce = BoxNonce::generate();
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| AuthError::EncryptionFailed(e.to_string()))?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt a box sealed by `peer` for us.
    pub fn open(
        &self,
        peer: &BoxPublicKey,
        nonce: &BoxNonce,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        let cipher = self.cipher(peer)?;
        cipher
            .decrypt(XNonce::from_slice(&nonce.0), ciphertext)
            .map_err(|_| AuthError::DecryptionFailed)
    }

    fn cipher(&self, peer: &BoxPublicKey) -> Result<XChaCha20Poly1305, AuthError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer.0));
        if !shared.was_contributory() {
            return Err(AuthError::InvalidPublicKey);
        }
        let key = blake3::derive_key(BOX_KEY_CONTEXT, shared.as_bytes());
        XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| AuthError::EncryptionFailed(e.to_string()))
    }
}

impl fmt::Debug for BoxKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxKeyPair({:?})", self.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_deterministic_from_seed() {
        let seed = [0x42u8; 32];
        let kp1 = Keypair::from_seed(&seed);
        let kp2 = Keypair::from_seed(&seed);
        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_eq!(kp1.box_public_key(), kp2.box_public_key());
    }

    #[test]
    fn test_identity_converts_to_matching_box_key() {
        let kp = Keypair::generate();
        assert_eq!(kp.to_box_keypair().public_key(), kp.box_public_key());
    }

    #[test]
    fn test_seal_open() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();

        let (nonce, ciphertext) = alice.seal(&bob.public_key(), b"hello, bob").unwrap();
        assert_ne!(ciphertext, b"hello, bob");

        let plaintext = bob.open(&alice.public_key(), &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello, bob");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let eve = BoxKeyPair::generate();

        let (nonce, ciphertext) = alice.seal(&bob.public_key(), b"secret").unwrap();
        let err = eve.open(&alice.public_key(), &nonce, &ciphertext).unwrap_err();
        assert_eq!(err, AuthError::DecryptionFailed);
    }

    #[test]
    fn test_mismatched_parts_cannot_talk() {
        let real = BoxKeyPair::generate();
        let other = BoxKeyPair::generate();
        let liar = BoxKeyPair::from_parts(real.public_key(), [7u8; 32]);
        let (nonce, ciphertext) = liar.seal(&other.public_key(), b"hi").unwrap();

        // The receiver trusts the advertised key, which the liar does not hold.
        assert!(other.open(&liar.public_key(), &nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_low_order_key_rejected() {
        let kp = BoxKeyPair::generate();
        let err = kp.seal(&BoxPublicKey([0u8; 32]), b"x").unwrap_err();
        assert_eq!(err, AuthError::InvalidPublicKey);
    }
}
