//! Content sync protocol.
//!
//! The sending side walks an identifier source and streams each item:
//!
//! ```text
//! START_ID(id1) DATA(..)* END_ID(id1) START_ID(id2) DATA(..)* END_ID(id2) FINALIZE
//! ```
//!
//! The receiving side opens a write stream per START_ID, appends DATA, and
//! commits on END_ID. A START_ID while a stream is still open commits that
//! stream first. Both directions run on the same protocol object; a side is
//! finished once it has sent and received FINALIZE.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use replica_core::{Message, MAX_PAYLOAD_LEN};
use replica_store::{ContentReader, ContentWriter};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::error::{Result, SyncError, SyncResult};
use crate::protocol::{MessageSink, Protocol};

/// Local message types.
pub mod msg {
    pub const START_ID: u8 = 0;
    pub const DATA: u8 = 1;
    pub const END_ID: u8 = 2;
    pub const FINALIZE: u8 = 3;
}

/// Default DATA chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum DATA payload per message.
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD_LEN {
            return Err(SyncError::InvalidChunkSize(self.chunk_size));
        }
        Ok(())
    }
}

/// Identifier of a content item, carried as raw bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(Bytes);

impl ContentId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// The identifier as a UTF-8 name.
    pub fn as_str(&self) -> SyncResult<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|_| SyncError::InvalidIdentifier(hex::encode(&self.0)))
    }
}

impl From<u64> for ContentId {
    /// Numbers travel as their decimal representation.
    fn from(n: u64) -> Self {
        Self(Bytes::from(n.to_string()))
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Vec<u8>> for ContentId {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for ContentId {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self)
    }
}

/// Where synced content is read from and written to.
#[async_trait]
pub trait ContentStreams: Send + Sync {
    /// Open an item for reading.
    async fn open_read(&self, id: &ContentId) -> SyncResult<ContentReader>;

    /// Open an item for writing. Content becomes visible on commit.
    async fn open_write(&self, id: &ContentId) -> SyncResult<Box<dyn ContentWriter>>;
}

/// Source of identifiers to send, consumed lazily.
pub type IdSource = Box<dyn Iterator<Item = ContentId> + Send>;

/// Transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub items_sent: u64,
    pub bytes_sent: u64,
    pub items_received: u64,
    pub bytes_received: u64,
}

enum SendState {
    Idle,
    Streaming { id: ContentId, reader: ContentReader },
    Done,
}

impl fmt::Debug for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendState::Idle => f.write_str("Idle"),
            SendState::Streaming { id, .. } => write!(f, "Streaming({})", id),
            SendState::Done => f.write_str("Done"),
        }
    }
}

/// The sync state machine.
pub struct SyncProtocol {
    streams: Arc<dyn ContentStreams>,
    ids: IdSource,
    send: SendState,
    /// At most one open write stream.
    receiving: Option<(ContentId, Box<dyn ContentWriter>)>,
    chunk: Vec<u8>,
    finalize_sent: bool,
    finalize_received: bool,
    stats: SyncStats,
}

impl SyncProtocol {
    /// Create a sync protocol sending `ids` in order.
    pub fn new<I>(streams: Arc<dyn ContentStreams>, ids: I, config: SyncConfig) -> SyncResult<Self>
    where
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        config.validate()?;
        Ok(Self {
            streams,
            ids: Box::new(ids.into_iter()),
            send: SendState::Idle,
            receiving: None,
            chunk: vec![0u8; config.chunk_size],
            finalize_sent: false,
            finalize_received: false,
            stats: SyncStats::default(),
        })
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Whether the remote side sent FINALIZE.
    pub fn remote_finished(&self) -> bool {
        self.finalize_received
    }

    /// Open the next item, or send FINALIZE when the source is exhausted.
    async fn start_next(&mut self, sink: &mut dyn MessageSink) -> Result<()> {
        let Some(id) = self.ids.next() else {
            sink.send(Message::empty(msg::FINALIZE)).await?;
            self.send = SendState::Done;
            self.finalize_sent = true;
            info!(
                items = self.stats.items_sent,
                bytes = self.stats.bytes_sent,
                "all content sent"
            );
            return Ok(());
        };

        let reader = self
            .streams
            .open_read(&id)
            .await
            .map_err(|e| SyncError::OpenRead {
                id: id.to_string(),
                source: Box::new(e),
            })?;
        sink.send(Message::new(msg::START_ID, id.as_bytes().clone())?)
            .await?;
        debug!(%id, "started sending");
        self.send = SendState::Streaming { id, reader };
        Ok(())
    }

    async fn commit_open(&mut self) -> Result<()> {
        if let Some((id, writer)) = self.receiving.take() {
            let size = writer.commit().await.map_err(SyncError::Write)?;
            self.stats.items_received += 1;
            debug!(%id, size, "received item");
        }
        Ok(())
    }
}

impl fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("send", &self.send)
            .field("receiving", &self.receiving.as_ref().map(|(id, _)| id))
            .field("finalize_sent", &self.finalize_sent)
            .field("finalize_received", &self.finalize_received)
            .field("stats", &self.stats)
            .finish()
    }
}

#[async_trait]
impl Protocol for SyncProtocol {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn message_range(&self) -> Range<u8> {
        msg::START_ID..msg::FINALIZE + 1
    }

    async fn initiate(&mut self, sink: &mut dyn MessageSink) -> Result<()> {
        if !matches!(self.send, SendState::Idle) {
            return Ok(());
        }
        self.start_next(sink).await
    }

    async fn consume(
        &mut self,
        msg_type: u8,
        payload: Bytes,
        _sink: &mut dyn MessageSink,
    ) -> Result<()> {
        match msg_type {
            msg::START_ID => {
                self.commit_open().await?;
                let id = ContentId::from(payload);
                let writer = self
                    .streams
                    .open_write(&id)
                    .await
                    .map_err(|e| SyncError::OpenWrite {
                        id: id.to_string(),
                        source: Box::new(e),
                    })?;
                debug!(%id, "receiving");
                self.receiving = Some((id, writer));
                Ok(())
            }
            msg::DATA => {
                let (_, writer) = self.receiving.as_mut().ok_or(SyncError::NoOpenStream)?;
                writer.write(&payload).await.map_err(SyncError::Write)?;
                self.stats.bytes_received += payload.len() as u64;
                Ok(())
            }
            msg::END_ID => {
                match &self.receiving {
                    None => return Err(SyncError::NoOpenStream.into()),
                    Some((open, _)) if open.as_bytes() != &payload => {
                        debug!(open = %open, end = %ContentId::from(payload), "END_ID names a different item");
                    }
                    Some(_) => {}
                }
                self.commit_open().await
            }
            msg::FINALIZE => {
                self.finalize_received = true;
                info!(
                    items = self.stats.items_received,
                    bytes = self.stats.bytes_received,
                    "remote finished sending"
                );
                Ok(())
            }
            other => Err(SyncError::UnknownMessageType(other).into()),
        }
    }

    fn has_pending(&self) -> bool {
        matches!(self.send, SendState::Streaming { .. })
    }

    async fn pump(&mut self, sink: &mut dyn MessageSink) -> Result<()> {
        let SendState::Streaming { reader, .. } = &mut self.send else {
            return Ok(());
        };
        let n = reader.read(&mut self.chunk).await.map_err(SyncError::Read)?;

        if n > 0 {
            let data = Bytes::copy_from_slice(&self.chunk[..n]);
            sink.send(Message::new(msg::DATA, data)?).await?;
            self.stats.bytes_sent += n as u64;
            return Ok(());
        }

        if let SendState::Streaming { id, .. } = std::mem::replace(&mut self.send, SendState::Idle) {
            sink.send(Message::new(msg::END_ID, id.as_bytes().clone())?)
                .await?;
            self.stats.items_sent += 1;
            debug!(%id, "finished sending");
        }
        self.start_next(sink).await
    }

    fn is_finished(&self) -> bool {
        self.finalize_sent && self.finalize_received
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::memory::MemoryStreams;

    fn source() -> Arc<MemoryStreams> {
        let streams = MemoryStreams::new();
        streams.insert("id1", &b"foo-data"[..]);
        streams.insert("id2", &b"bar-data"[..]);
        Arc::new(streams)
    }

    /// Drive a sender until it has nothing left to emit.
    async fn drain(protocol: &mut SyncProtocol) -> Vec<Message> {
        let mut out = Vec::new();
        protocol.initiate(&mut out).await.unwrap();
        while protocol.has_pending() {
            protocol.pump(&mut out).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_sender_ordering() {
        let ids = vec![ContentId::from("id1"), ContentId::from("id2")];
        let mut sender = SyncProtocol::new(source(), ids, SyncConfig::default()).unwrap();

        let out = drain(&mut sender).await;
        let seen: Vec<(u8, &[u8])> = out.iter().map(|m| (m.msg_type(), &m.payload()[..])).collect();
        assert_eq!(
            seen,
            vec![
                (msg::START_ID, &b"id1"[..]),
                (msg::DATA, &b"foo-data"[..]),
                (msg::END_ID, &b"id1"[..]),
                (msg::START_ID, &b"id2"[..]),
                (msg::DATA, &b"bar-data"[..]),
                (msg::END_ID, &b"id2"[..]),
                (msg::FINALIZE, &b""[..]),
            ]
        );
        assert_eq!(sender.stats().items_sent, 2);
        assert_eq!(sender.stats().bytes_sent, 16);
        assert!(!sender.is_finished());
    }

    #[tokio::test]
    async fn test_chunking() {
        let streams = MemoryStreams::new();
        streams.insert("big", vec![7u8; 10]);
        let config = SyncConfig { chunk_size: 4 };
        let mut sender =
            SyncProtocol::new(Arc::new(streams), vec![ContentId::from("big")], config).unwrap();

        let out = drain(&mut sender).await;
        let sizes: Vec<usize> = out
            .iter()
            .filter(|m| m.msg_type() == msg::DATA)
            .map(|m| m.payload().len())
            .collect();
        assert!(sizes.iter().all(|&n| n <= 4));
        assert_eq!(sizes.iter().sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn test_round_trip_between_peers() {
        let ids = vec![ContentId::from("id1"), ContentId::from("id2")];
        let mut sender = SyncProtocol::new(source(), ids, SyncConfig::default()).unwrap();
        let target = Arc::new(MemoryStreams::new());
        let mut receiver =
            SyncProtocol::new(target.clone(), Vec::new(), SyncConfig::default()).unwrap();

        let mut replies = Vec::new();
        receiver.initiate(&mut replies).await.unwrap();
        for message in drain(&mut sender).await {
            let (msg_type, payload) = message.into_parts();
            receiver.consume(msg_type, payload, &mut replies).await.unwrap();
        }
        for message in replies {
            let (msg_type, payload) = message.into_parts();
            sender.consume(msg_type, payload, &mut Vec::new()).await.unwrap();
        }

        assert_eq!(target.get("id1").unwrap(), Bytes::from_static(b"foo-data"));
        assert_eq!(target.get("id2").unwrap(), Bytes::from_static(b"bar-data"));
        assert_eq!(receiver.stats().items_received, 2);
        assert!(sender.is_finished());
        assert!(receiver.is_finished());
    }

    #[tokio::test]
    async fn test_start_commits_open_stream() {
        let target = Arc::new(MemoryStreams::new());
        let mut receiver =
            SyncProtocol::new(target.clone(), Vec::new(), SyncConfig::default()).unwrap();
        let mut sink = Vec::new();

        receiver.consume(msg::START_ID, Bytes::from_static(b"a"), &mut sink).await.unwrap();
        receiver.consume(msg::DATA, Bytes::from_static(b"unterminated"), &mut sink).await.unwrap();
        receiver.consume(msg::START_ID, Bytes::from_static(b"b"), &mut sink).await.unwrap();

        assert_eq!(target.get("a").unwrap(), Bytes::from_static(b"unterminated"));
        assert!(target.get("b").is_none());
    }

    #[tokio::test]
    async fn test_data_without_stream() {
        let mut receiver =
            SyncProtocol::new(Arc::new(MemoryStreams::new()), Vec::new(), SyncConfig::default())
                .unwrap();

        let result = receiver.consume(msg::DATA, Bytes::from_static(b"x"), &mut Vec::new()).await;
        assert!(matches!(result, Err(ProtocolError::Sync(SyncError::NoOpenStream))));

        let result = receiver.consume(msg::END_ID, Bytes::from_static(b"x"), &mut Vec::new()).await;
        assert!(matches!(result, Err(ProtocolError::Sync(SyncError::NoOpenStream))));
    }

    #[tokio::test]
    async fn test_missing_source_item_is_fatal() {
        let mut sender = SyncProtocol::new(
            Arc::new(MemoryStreams::new()),
            vec![ContentId::from("missing")],
            SyncConfig::default(),
        )
        .unwrap();

        let result = sender.initiate(&mut Vec::new()).await;
        assert!(matches!(
            result,
            Err(ProtocolError::Sync(SyncError::OpenRead { .. }))
        ));
    }

    #[test]
    fn test_numeric_ids_are_decimal() {
        assert_eq!(ContentId::from(42u64).as_bytes(), &Bytes::from_static(b"42"));
        assert_eq!(ContentId::from(42u64).to_string(), "42");
        assert!(ContentId::from(vec![0xff, 0xfe]).as_str().is_err());
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(SyncConfig { chunk_size: 0 }.validate().is_err());
        assert!(SyncConfig { chunk_size: 65_536 }.validate().is_err());
        assert!(SyncConfig { chunk_size: 65_535 }.validate().is_ok());
    }
}
