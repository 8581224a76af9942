//! The Protocol trait: message-driven state machines.
//!
//! A protocol owns a half-open range of local message types. It reacts to
//! `initiate` and `consume` by emitting messages into a [`MessageSink`].
//! Protocols that stream (the sync sender) additionally report queued output
//! through `has_pending` and emit it from `pump`, so the transport can
//! interleave reading with sending under backpressure.

use std::any::Any;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use replica_core::Message;
use tokio::sync::mpsc;

use crate::error::{ProtocolError, Result};

/// Destination for messages a protocol emits.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: Message) -> Result<()>;
}

#[async_trait]
impl MessageSink for Vec<Message> {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.push(message);
        Ok(())
    }
}

#[async_trait]
impl MessageSink for mpsc::Sender<Message> {
    async fn send(&mut self, message: Message) -> Result<()> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| ProtocolError::SinkClosed)
    }
}

/// A message-driven protocol state machine.
///
/// Errors returned from any method are fatal for the connection. The only
/// recoverable condition a protocol handles internally is one it documents.
#[async_trait]
pub trait Protocol: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Local message types this protocol understands, `[start, end)`.
    fn message_range(&self) -> Range<u8>;

    /// Start the protocol from this side.
    async fn initiate(&mut self, sink: &mut dyn MessageSink) -> Result<()>;

    /// Handle one incoming message of a local type.
    async fn consume(
        &mut self,
        msg_type: u8,
        payload: Bytes,
        sink: &mut dyn MessageSink,
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Streaming output
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether `pump` has output to emit.
    fn has_pending(&self) -> bool {
        false
    }

    /// Emit the next piece of queued output.
    async fn pump(&mut self, _sink: &mut dyn MessageSink) -> Result<()> {
        Ok(())
    }

    /// Whether this side has nothing more to send or receive.
    fn is_finished(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}
