//! Envelope framing.
//!
//! Every message crosses the wire as
//! `type(1) | length_hi(1) | length_lo(1) | payload(length) | checksum(32)`,
//! where the checksum is the SHA-256 of all preceding bytes of the frame.
//! This layout is fixed; interoperating nodes must agree on it byte for byte.
//!
//! Decoding is strict. A frame that is too short, whose declared length does
//! not account for every byte, or whose checksum does not match is rejected
//! as a whole. There is no partial recovery.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, FrameError};
use crate::message::Message;

/// Type byte plus the two length bytes.
pub const HEADER_LEN: usize = 3;

/// SHA-256 digest length.
pub const CHECKSUM_LEN: usize = 32;

/// Bytes an envelope adds around the payload.
pub const ENVELOPE_OVERHEAD: usize = HEADER_LEN + CHECKSUM_LEN;

/// Encode a message into a fresh envelope.
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENVELOPE_OVERHEAD + message.payload().len());
    encode_into(message, &mut buf);
    buf.freeze()
}

/// Append the envelope for `message` to `dst`.
pub fn encode_into(message: &Message, dst: &mut BytesMut) {
    let payload = message.payload();
    let start = dst.len();
    dst.reserve(ENVELOPE_OVERHEAD + payload.len());

    dst.put_u8(message.msg_type());
    // Message construction guarantees the payload fits in 16 bits.
    dst.put_u16(payload.len() as u16);
    dst.put_slice(payload);

    let checksum = Sha256::digest(&dst[start..]);
    dst.put_slice(&checksum);
}

/// Decode a complete envelope.
pub fn decode(frame: &[u8]) -> Result<Message, FrameError> {
    if frame.len() < ENVELOPE_OVERHEAD {
        return Err(FrameError::FrameTooShort {
            len: frame.len(),
            min: ENVELOPE_OVERHEAD,
        });
    }

    let declared = declared_len(frame);
    let actual = frame.len() - ENVELOPE_OVERHEAD;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }

    let (body, checksum) = frame.split_at(frame.len() - CHECKSUM_LEN);
    let computed = Sha256::digest(body);
    if computed.as_slice() != checksum {
        return Err(FrameError::ChecksumMismatch);
    }

    Message::new(frame[0], Bytes::copy_from_slice(&body[HEADER_LEN..]))
}

/// Payload length declared in a frame header. Caller ensures `HEADER_LEN` bytes.
fn declared_len(header: &[u8]) -> usize {
    u16::from_be_bytes([header[1], header[2]]) as usize
}

/// Streaming envelope codec for `tokio_util::codec::Framed*`.
///
/// The decoder waits until the header's declared length plus the envelope
/// overhead is buffered, then hands exactly that frame to [`decode`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let total = declared_len(src) + ENVELOPE_OVERHEAD;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        Ok(Some(decode(&frame)?))
    }
}

impl Encoder<Message> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use proptest::prelude::*;
    use tokio_util::codec::FramedRead;

    fn msg(t: u8, payload: &[u8]) -> Message {
        Message::new(t, payload.to_vec()).unwrap()
    }

    #[test]
    fn test_layout() {
        let frame = encode(&msg(0x02, b"abc"));
        assert_eq!(frame.len(), 3 + ENVELOPE_OVERHEAD);
        assert_eq!(&frame[..6], &[0x02, 0x00, 0x03, b'a', b'b', b'c']);

        let checksum = Sha256::digest(&frame[..6]);
        assert_eq!(&frame[6..], checksum.as_slice());
    }

    #[test]
    fn test_length_is_big_endian() {
        let frame = encode(&msg(1, &[0u8; 0x0102]));
        assert_eq!(frame[1], 0x01);
        assert_eq!(frame[2], 0x02);
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode(&Message::empty(9));
        assert_eq!(frame.len(), ENVELOPE_OVERHEAD);
        assert_eq!(decode(&frame).unwrap(), Message::empty(9));
    }

    #[test]
    fn test_too_short() {
        let err = decode(&[0u8; 34]).unwrap_err();
        assert_eq!(err, FrameError::FrameTooShort { len: 34, min: 35 });
    }

    #[test]
    fn test_length_mismatch() {
        let mut frame = encode(&msg(1, b"hello")).to_vec();
        frame.push(0);
        let err = decode(&frame).unwrap_err();
        assert_eq!(err, FrameError::LengthMismatch { declared: 5, actual: 6 });
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = encode(&msg(1, b"hello")).to_vec();
        frame[4] ^= 0x01;
        assert_eq!(decode(&frame).unwrap_err(), FrameError::ChecksumMismatch);
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let frame = encode(&msg(3, b"partial"));
        let mut codec = EnvelopeCodec::new();

        let mut buf = BytesMut::from(&frame[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[10..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg(3, b"partial"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_corrupt_frame() {
        let mut frame = BytesMut::from(&encode(&msg(3, b"x"))[..]);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = EnvelopeCodec::new().decode(&mut frame).unwrap_err();
        assert!(matches!(err, CodecError::Frame(FrameError::ChecksumMismatch)));
    }

    #[tokio::test]
    async fn test_framed_read_multiple_messages() {
        let mut wire = BytesMut::new();
        let mut codec = EnvelopeCodec::new();
        codec.encode(msg(0, b"first"), &mut wire).unwrap();
        codec.encode(msg(1, b"second"), &mut wire).unwrap();

        let reader = std::io::Cursor::new(wire.freeze().to_vec());
        let mut framed = FramedRead::new(reader, EnvelopeCodec::new());

        assert_eq!(framed.next().await.unwrap().unwrap(), msg(0, b"first"));
        assert_eq!(framed.next().await.unwrap().unwrap(), msg(1, b"second"));
        assert!(framed.next().await.is_none());
    }

    proptest! {
        #[test]
        fn test_roundtrip(t in any::<u8>(), payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let message = Message::new(t, payload).unwrap();
            prop_assert_eq!(decode(&encode(&message)).unwrap(), message);
        }

        #[test]
        fn test_single_bit_flip_detected(
            payload in prop::collection::vec(any::<u8>(), 1..256),
            pick in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut frame = encode(&Message::new(5, payload).unwrap()).to_vec();
            // Payload and checksum region only; header flips change the length.
            let idx = HEADER_LEN + pick.index(frame.len() - HEADER_LEN);
            frame[idx] ^= 1 << bit;
            prop_assert_eq!(decode(&frame).unwrap_err(), FrameError::ChecksumMismatch);
        }
    }
}
