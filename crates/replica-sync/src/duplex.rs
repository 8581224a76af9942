//! Running a multiplexed session over a byte stream.
//!
//! [`ProtocolDuplex`] owns a [`MultiProtocol`] and drives it against any
//! `AsyncRead + AsyncWrite` connection:
//!
//! - incoming bytes are framed by [`EnvelopeCodec`] and fed to `consume`
//! - outgoing messages go through a bounded channel to a writer task
//! - queued protocol output (`pump`) is only emitted when the channel has
//!   capacity, so a slow peer throttles the sender
//!
//! The adapter contains no protocol logic. It stops when the multiplexer
//! reports finished, when the remote closes, or on the first error.

use std::fmt;

use futures::{SinkExt, StreamExt};
use replica_core::{CodecError, EnvelopeCodec, Message};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};
use crate::multi::MultiProtocol;

/// Outgoing messages buffered before `pump` is held back.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 16;

/// Which side of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opened the connection and sends the first message.
    Initiator,
    /// Accepted the connection and waits for the peer.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Summary of one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplexReport {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Whether the multiplexer finished, as opposed to the remote closing first.
    pub finished: bool,
}

/// A multiplexer bound to a connection role.
pub struct ProtocolDuplex {
    multi: MultiProtocol,
    role: Role,
    buffer: usize,
}

impl fmt::Debug for ProtocolDuplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDuplex")
            .field("role", &self.role)
            .field("buffer", &self.buffer)
            .field("multi", &self.multi)
            .finish()
    }
}

enum Step {
    Frame(Option<std::result::Result<Message, CodecError>>),
    Pump(bool),
}

impl ProtocolDuplex {
    pub fn new(multi: MultiProtocol, role: Role) -> Self {
        Self {
            multi,
            role,
            buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }

    /// Set the outbound channel capacity. Zero is treated as one.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn multi(&self) -> &MultiProtocol {
        &self.multi
    }

    pub fn multi_mut(&mut self) -> &mut MultiProtocol {
        &mut self.multi
    }

    pub fn into_inner(self) -> MultiProtocol {
        self.multi
    }

    /// Drive the session over `io` until it ends.
    ///
    /// On success the write half has been flushed and shut down. On error
    /// the writer is aborted and pending output is dropped.
    pub async fn run<T>(&mut self, io: T) -> Result<DuplexReport>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut frames = FramedRead::new(read_half, EnvelopeCodec::new());
        let (tx, rx) = mpsc::channel(self.buffer);
        let writer = tokio::spawn(write_frames(write_half, rx));

        debug!(role = %self.role, "session started");
        match self.drive(&mut frames, tx).await {
            Ok((frames_in, finished)) => {
                let frames_out = writer
                    .await
                    .map_err(|e| ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
                let report = DuplexReport {
                    frames_in,
                    frames_out,
                    finished,
                };
                debug!(role = %self.role, ?report, "session ended");
                Ok(report)
            }
            Err(err) => {
                writer.abort();
                debug!(role = %self.role, error = %err, "session failed");
                Err(err)
            }
        }
    }

    async fn drive<R>(
        &mut self,
        frames: &mut FramedRead<R, EnvelopeCodec>,
        tx: mpsc::Sender<Message>,
    ) -> Result<(u64, bool)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut out = tx.clone();
        let mut frames_in = 0u64;

        if self.role == Role::Initiator {
            self.multi.initiate(&mut out).await?;
        }

        loop {
            if self.multi.is_finished() {
                return Ok((frames_in, true));
            }

            let step = if self.multi.has_pending() {
                tokio::select! {
                    frame = frames.next() => Step::Frame(frame),
                    permit = tx.reserve() => Step::Pump(permit.is_ok()),
                }
            } else {
                Step::Frame(frames.next().await)
            };

            match step {
                Step::Pump(true) => self.multi.pump(&mut out).await?,
                Step::Pump(false) => return Err(ProtocolError::SinkClosed),
                Step::Frame(Some(frame)) => {
                    let (msg_type, payload) = frame?.into_parts();
                    frames_in += 1;
                    trace!(msg_type, len = payload.len(), "frame in");
                    self.multi.consume(msg_type, payload, &mut out).await?;
                }
                Step::Frame(None) => {
                    debug!(role = %self.role, frames_in, "remote closed");
                    return Ok((frames_in, false));
                }
            }
        }
    }
}

async fn write_frames<W>(write_half: W, mut rx: mpsc::Receiver<Message>) -> Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new());
    let mut frames_out = 0u64;

    while let Some(message) = rx.recv().await {
        trace!(msg_type = message.msg_type(), "frame out");
        sink.send(message).await?;
        frames_out += 1;
    }

    let mut write_half = sink.into_inner();
    if let Err(e) = write_half.shutdown().await {
        debug!(error = %e, "shutdown after final frame failed");
    }
    Ok(frames_out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use replica_core::{envelope, BoxKeyPair, BoxPublicKey};

    use super::*;
    use crate::auth::{self, AuthConfig, MutualAuthenticator};
    use crate::memory::MemoryStreams;
    use crate::multi::{Direction, ProtocolId, Transition};
    use crate::protocol::Protocol;
    use crate::sync::{self, ContentId, SyncConfig, SyncProtocol};

    const AUTH: ProtocolId = ProtocolId::new(0);
    const SYNC: ProtocolId = ProtocolId::new(1);

    fn session(
        role: Role,
        keys: BoxKeyPair,
        peer: Option<BoxPublicKey>,
        streams: MemoryStreams,
        ids: Vec<ContentId>,
        chunk_size: usize,
    ) -> ProtocolDuplex {
        let protocols: Vec<Box<dyn Protocol>> = vec![
            Box::new(MutualAuthenticator::new(keys, peer, AuthConfig::default())),
            Box::new(
                SyncProtocol::new(Arc::new(streams), ids, SyncConfig { chunk_size }).unwrap(),
            ),
        ];
        let mut multi = MultiProtocol::new(protocols).unwrap();
        multi.lock(SYNC).unwrap();

        let finalize = multi.map_type(AUTH, auth::msg::FINALIZE).unwrap();
        let direction = match role {
            Role::Initiator => Direction::Outgoing,
            Role::Responder => Direction::Incoming,
        };
        multi
            .register(finalize, direction, |_| Some(Transition::Unlock(SYNC)))
            .unwrap();
        multi
            .register(finalize, direction, |_| Some(Transition::Initiate(SYNC)))
            .unwrap();

        ProtocolDuplex::new(multi, role).with_buffer(2)
    }

    #[tokio::test]
    async fn test_full_session_over_duplex() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let bob_pk = bob.public_key();

        let source = MemoryStreams::new();
        source.insert(1u64, Bytes::from(vec![7u8; 10_000]));
        source.insert(2u64, Bytes::from_static(b"second"));
        let target = MemoryStreams::new();

        let mut initiator = session(
            Role::Initiator,
            alice,
            Some(bob_pk),
            source,
            vec![ContentId::from(1u64), ContentId::from(2u64)],
            1024,
        );
        let mut responder = session(Role::Responder, bob, None, target.clone(), vec![], 1024);

        let (a, b) = tokio::io::duplex(4096);
        let (left, right) = tokio::join!(initiator.run(a), responder.run(b));
        let left = left.unwrap();
        let right = right.unwrap();

        assert!(left.finished);
        assert!(right.finished);
        // challenge, finalize, 2x start, 10+1 data, 2x end, sync finalize
        assert_eq!(left.frames_out, 18);
        // response, sync finalize
        assert_eq!(right.frames_out, 2);
        assert_eq!(left.frames_in, right.frames_out);
        assert_eq!(right.frames_in, left.frames_out);

        assert_eq!(target.get(1u64).unwrap(), Bytes::from(vec![7u8; 10_000]));
        assert_eq!(target.get(2u64).unwrap(), Bytes::from_static(b"second"));

        let auth = responder.multi().protocol::<MutualAuthenticator>(AUTH).unwrap();
        assert!(auth.peer_authenticated());
        let stats = responder.multi().protocol::<SyncProtocol>(SYNC).unwrap().stats();
        assert_eq!(stats.items_received, 2);
        assert_eq!(stats.bytes_received, 10_006);
    }

    #[tokio::test]
    async fn test_both_sides_send_concurrently() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let bob_pk = bob.public_key();

        let left_store = MemoryStreams::new();
        left_store.insert("from-left", Bytes::from(vec![1u8; 50_000]));
        let right_store = MemoryStreams::new();
        right_store.insert("from-right", Bytes::from(vec![2u8; 50_000]));

        let mut initiator = session(
            Role::Initiator,
            alice,
            Some(bob_pk),
            left_store.clone(),
            vec![ContentId::from("from-left")],
            1024,
        );
        let mut responder = session(
            Role::Responder,
            bob,
            None,
            right_store.clone(),
            vec![ContentId::from("from-right")],
            1024,
        );

        // A pipe smaller than either transfer forces both directions to interleave.
        let (a, b) = tokio::io::duplex(4096);
        let (left, right) = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            tokio::join!(initiator.run(a), responder.run(b))
        })
        .await
        .unwrap();
        let left = left.unwrap();
        let right = right.unwrap();

        assert!(left.finished && right.finished);
        assert_eq!(right_store.get("from-left").unwrap(), Bytes::from(vec![1u8; 50_000]));
        assert_eq!(left_store.get("from-right").unwrap(), Bytes::from(vec![2u8; 50_000]));

        for duplex in [&initiator, &responder] {
            let stats = duplex.multi().protocol::<SyncProtocol>(SYNC).unwrap().stats();
            assert_eq!(stats.items_sent, 1);
            assert_eq!(stats.items_received, 1);
            assert_eq!(stats.bytes_received, 50_000);
        }
    }

    #[tokio::test]
    async fn test_wrong_peer_key_fails() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let mallory = BoxKeyPair::generate();

        let mut initiator = session(
            Role::Initiator,
            alice,
            Some(mallory.public_key()),
            MemoryStreams::new(),
            vec![],
            1024,
        );
        let mut responder = session(Role::Responder, bob, None, MemoryStreams::new(), vec![], 1024);

        let (a, b) = tokio::io::duplex(4096);
        let (left, right) = tokio::join!(initiator.run(a), responder.run(b));

        assert!(matches!(
            right,
            Err(ProtocolError::Auth(replica_core::AuthError::DecryptionFailed))
        ));
        // The initiator sees the connection close before authenticating.
        let left = left.unwrap();
        assert!(!left.finished);
    }

    #[tokio::test]
    async fn test_sync_traffic_before_auth_is_rejected() {
        let mut responder = session(
            Role::Responder,
            BoxKeyPair::generate(),
            None,
            MemoryStreams::new(),
            vec![],
            1024,
        );
        let start = responder.multi().map_type(SYNC, sync::msg::START_ID).unwrap();

        let (mut a, b) = tokio::io::duplex(4096);
        let frame = envelope::encode(&Message::new(start, Bytes::from_static(b"1")).unwrap());
        a.write_all(&frame).await.unwrap();

        let result = responder.run(b).await;
        assert!(matches!(result, Err(ProtocolError::ProtocolLocked("sync"))));
    }

    #[tokio::test]
    async fn test_remote_close_ends_run() {
        let mut responder = session(
            Role::Responder,
            BoxKeyPair::generate(),
            None,
            MemoryStreams::new(),
            vec![],
            1024,
        );
        let (a, b) = tokio::io::duplex(64);
        drop(a);

        let report = responder.run(b).await.unwrap();
        assert_eq!(report.frames_in, 0);
        assert!(!report.finished);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_fatal() {
        let mut responder = session(
            Role::Responder,
            BoxKeyPair::generate(),
            None,
            MemoryStreams::new(),
            vec![],
            1024,
        );
        let (mut a, b) = tokio::io::duplex(4096);
        let mut frame = envelope::encode(&Message::new(0, Bytes::from_static(b"x")).unwrap()).to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        a.write_all(&frame).await.unwrap();

        let result = responder.run(b).await;
        assert!(matches!(result, Err(ProtocolError::Frame(_))));
    }
}
