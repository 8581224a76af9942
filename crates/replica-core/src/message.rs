//! Protocol messages.
//!
//! A message is the unit every protocol state machine consumes and emits:
//! a one-byte type code and an opaque payload. Payloads are bounded by the
//! 16-bit length field of the envelope; larger content is chunked by the
//! caller into several messages.

use std::fmt;

use bytes::Bytes;

use crate::error::FrameError;

/// Largest payload a single message can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// A typed protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: u8,
    payload: Bytes,
}

impl Message {
    /// Create a message, rejecting payloads that do not fit in one frame.
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { msg_type, payload })
    }

    /// Create a message without a payload.
    pub const fn empty(msg_type: u8) -> Self {
        Self {
            msg_type,
            payload: Bytes::new(),
        }
    }

    /// The message type code.
    pub const fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Same payload under a different type code.
    ///
    /// Used when translating between a sub-protocol's local type space and
    /// a composed one.
    pub fn with_type(self, msg_type: u8) -> Self {
        Self {
            msg_type,
            payload: self.payload,
        }
    }

    /// Split into type and payload.
    pub fn into_parts(self) -> (u8, Bytes) {
        (self.msg_type, self.payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_payload_accepted() {
        let msg = Message::new(7, vec![0u8; MAX_PAYLOAD_LEN]).unwrap();
        assert_eq!(msg.payload().len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Message::new(7, vec![0u8; MAX_PAYLOAD_LEN + 1]).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1));
    }

    #[test]
    fn test_with_type_keeps_payload() {
        let msg = Message::new(1, &b"chunk"[..]).unwrap().with_type(14);
        assert_eq!(msg.msg_type(), 14);
        assert_eq!(msg.payload().as_ref(), b"chunk");
    }
}
