//! Golden envelope vectors.
//!
//! Each vector fixes a message and the SHA-256 trailer its envelope must
//! carry, so any implementation of the framing can be checked byte for byte.

use bytes::Bytes;
use replica_core::envelope;
use replica_core::{FrameError, Message};

/// A golden test vector.
#[derive(Debug, Clone)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    pub msg_type: u8,
    /// Builds the payload.
    pub payload: fn() -> Vec<u8>,
    /// Expected trailing checksum (hex).
    pub expected_checksum: &'static str,
    /// Full expected frame (hex), for the short vectors.
    pub expected_frame: Option<&'static str>,
}

impl GoldenVector {
    pub fn message(&self) -> Result<Message, FrameError> {
        Message::new(self.msg_type, Bytes::from((self.payload)()))
    }
}

/// Get all golden test vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    vec![
        GoldenVector {
            name: "empty payload",
            msg_type: 0,
            payload: Vec::new,
            expected_checksum: "709e80c88487a2411e1ee4dfb9f22a861492d20c4765150c0c794abd70f8147c",
            expected_frame: Some(
                "000000709e80c88487a2411e1ee4dfb9f22a861492d20c4765150c0c794abd70f8147c",
            ),
        },
        GoldenVector {
            name: "hello on composed sync START_ID",
            msg_type: 13,
            payload: || b"hello".to_vec(),
            expected_checksum: "50b0b7d5ea2d13867f3538b58eebe299fad23c261035aab1d8164d82defd2360",
            expected_frame: Some(
                "0d000568656c6c6f50b0b7d5ea2d13867f3538b58eebe299fad23c261035aab1d8164d82defd2360",
            ),
        },
        GoldenVector {
            name: "1 KiB counter payload",
            msg_type: 2,
            payload: || (0..1024).map(|i| (i % 256) as u8).collect(),
            expected_checksum: "747bb23fc3bbde88dff7f34979c48805dde304d250caa37d13b7112898155c53",
            expected_frame: None,
        },
        GoldenVector {
            name: "maximum zero payload",
            msg_type: 255,
            payload: || vec![0u8; 65535],
            expected_checksum: "c62b9075ffb46c0c1366cffc1b66f35ce8d658e0894a73c6b62c9da1b6d3fe2c",
            expected_frame: None,
        },
    ]
}

/// Encode every vector and compare against its expectations.
///
/// Returns `(name, matches, actual checksum hex)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let frame = match v.message() {
                Ok(message) => envelope::encode(&message),
                Err(e) => return (v.name.to_string(), false, e.to_string()),
            };
            let checksum = hex::encode(&frame[frame.len() - envelope::CHECKSUM_LEN..]);
            let frame_ok = v
                .expected_frame
                .map_or(true, |expected| hex::encode(&frame) == expected);
            let matches = frame_ok && checksum == v.expected_checksum;
            (v.name.to_string(), matches, checksum)
        })
        .collect()
}
