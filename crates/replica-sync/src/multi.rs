//! Multiplexing several protocols over one message space.
//!
//! Each sub-protocol is assigned a block of composed message types in
//! registration order. A block covers the protocol's own range plus
//! [`RESERVED_MESSAGE_SLOTS`] spare codes, so a protocol can grow new
//! message types without shifting everything registered after it.
//!
//! ```text
//! auth  [0,3)  -> composed  0..3   (3..13 reserved)
//! sync  [0,4)  -> composed 13..17  (17..27 reserved)
//! ```
//!
//! Transitions between protocols are driven by hooks: callbacks registered
//! on a composed type and direction that may ask the multiplexer to unlock
//! or initiate another sub-protocol once the current step has completed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use replica_core::Message;
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};
use crate::protocol::{MessageSink, Protocol};

/// Spare composed codes after each sub-protocol's range.
pub const RESERVED_MESSAGE_SLOTS: usize = 10;

/// Index of a sub-protocol, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(usize);

impl ProtocolId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Consumed from the remote side.
    Incoming,
    /// Emitted towards the remote side.
    Outgoing,
}

/// Action a hook asks the multiplexer to take after the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Run the sub-protocol's `initiate`.
    Initiate(ProtocolId),
    /// Let traffic reach a locked sub-protocol.
    Unlock(ProtocolId),
}

/// What a hook sees.
#[derive(Debug)]
pub struct HookEvent<'a> {
    pub protocol: ProtocolId,
    pub local_type: u8,
    pub composed_type: u8,
    pub payload: &'a [u8],
    pub direction: Direction,
}

/// Callback run for a composed message type in one direction.
pub type Hook = Box<dyn Fn(&HookEvent<'_>) -> Option<Transition> + Send + Sync>;

type HookMap = HashMap<(u8, Direction), Vec<Hook>>;

struct Slot {
    protocol: Box<dyn Protocol>,
    offset: u8,
    range: Range<u8>,
    locked: bool,
}

/// Several protocols sharing one composed message space.
pub struct MultiProtocol {
    slots: Vec<Slot>,
    hooks: HookMap,
}

impl fmt::Debug for MultiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for slot in &self.slots {
            list.entry(&format_args!(
                "{} {:?} @ {}{}",
                slot.protocol.name(),
                slot.range,
                slot.offset,
                if slot.locked { " (locked)" } else { "" }
            ));
        }
        list.finish()
    }
}

impl MultiProtocol {
    /// Build the composed mapping. Order matters: it fixes both the
    /// composed codes and which protocol `initiate` starts.
    pub fn new(protocols: Vec<Box<dyn Protocol>>) -> Result<Self> {
        let mut slots = Vec::with_capacity(protocols.len());
        let mut offset: usize = 0;

        for protocol in protocols {
            let range = protocol.message_range();
            if range.start > range.end {
                return Err(ProtocolError::InvalidMapping(format!(
                    "message range of {} is out of order",
                    protocol.name()
                )));
            }
            let width = range.len();
            if offset + width > usize::from(u8::MAX) + 1 {
                return Err(ProtocolError::InvalidMapping(format!(
                    "no composed message types left for {}",
                    protocol.name()
                )));
            }
            let base = u8::try_from(offset).map_err(|_| {
                ProtocolError::InvalidMapping(format!(
                    "no composed message types left for {}",
                    protocol.name()
                ))
            })?;

            debug!(protocol = protocol.name(), ?range, offset = base, "mapped protocol");
            slots.push(Slot {
                protocol,
                offset: base,
                range,
                locked: false,
            });
            offset += width + RESERVED_MESSAGE_SLOTS;
        }

        Ok(Self {
            slots,
            hooks: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mapping
    // ─────────────────────────────────────────────────────────────────────────

    /// Composed type for a sub-protocol's local type.
    pub fn map_type(&self, id: ProtocolId, local: u8) -> Result<u8> {
        let slot = self.slot(id)?;
        if !slot.range.contains(&local) {
            return Err(ProtocolError::UnknownMessageType(local));
        }
        Ok(slot.offset + (local - slot.range.start))
    }

    /// Owning sub-protocol and local type for a composed type.
    pub fn lookup_type(&self, composed: u8) -> Result<(ProtocolId, u8)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| {
                let delta = composed.checked_sub(slot.offset)?;
                (usize::from(delta) < slot.range.len())
                    .then(|| (ProtocolId(index), slot.range.start + delta))
            })
            .ok_or(ProtocolError::UnknownMessageType(composed))
    }

    fn slot(&self, id: ProtocolId) -> Result<&Slot> {
        self.slots
            .get(id.0)
            .ok_or_else(|| ProtocolError::InvalidMapping(format!("no protocol at index {}", id.0)))
    }

    fn slot_mut(&mut self, id: ProtocolId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.0)
            .ok_or_else(|| ProtocolError::InvalidMapping(format!("no protocol at index {}", id.0)))
    }

    /// Typed access to a sub-protocol.
    pub fn protocol<T: Protocol + 'static>(&self, id: ProtocolId) -> Option<&T> {
        self.slots.get(id.0)?.protocol.as_any().downcast_ref::<T>()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hooks and gating
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `hook` whenever a message of `composed` type travels in `direction`.
    pub fn register<F>(&mut self, composed: u8, direction: Direction, hook: F) -> Result<()>
    where
        F: Fn(&HookEvent<'_>) -> Option<Transition> + Send + Sync + 'static,
    {
        self.lookup_type(composed)?;
        self.hooks
            .entry((composed, direction))
            .or_default()
            .push(Box::new(hook));
        debug!(composed, ?direction, "registered hook");
        Ok(())
    }

    /// Reject incoming traffic for `id` until a transition unlocks it.
    pub fn lock(&mut self, id: ProtocolId) -> Result<()> {
        self.slot_mut(id)?.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self, id: ProtocolId) -> Result<()> {
        self.slot_mut(id)?.locked = false;
        Ok(())
    }

    pub fn is_locked(&self, id: ProtocolId) -> bool {
        self.slots.get(id.0).map(|s| s.locked).unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Driving
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the first sub-protocol.
    pub async fn initiate(&mut self, sink: &mut dyn MessageSink) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        self.apply(vec![Transition::Initiate(ProtocolId(0))], sink).await
    }

    /// Dispatch one composed message to its sub-protocol.
    pub async fn consume(
        &mut self,
        composed: u8,
        payload: Bytes,
        sink: &mut dyn MessageSink,
    ) -> Result<()> {
        let (id, local) = self.lookup_type(composed)?;
        trace!(composed, protocol = id.0, local, "consuming");

        let mut transitions = Vec::new();
        {
            let Self { slots, hooks } = &mut *self;
            let slot = &mut slots[id.0];
            if slot.locked {
                return Err(ProtocolError::ProtocolLocked(slot.protocol.name()));
            }
            let mut mapped = MappedSink::new(sink, id, slot, hooks, &mut transitions);
            slot.protocol.consume(local, payload.clone(), &mut mapped).await?;
        }

        fire(
            &self.hooks,
            &HookEvent {
                protocol: id,
                local_type: local,
                composed_type: composed,
                payload: &payload,
                direction: Direction::Incoming,
            },
            &mut transitions,
        );

        self.apply(transitions, sink).await
    }

    /// Whether any unlocked sub-protocol has queued output.
    pub fn has_pending(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| !slot.locked && slot.protocol.has_pending())
    }

    /// Emit queued output from the first sub-protocol that has some.
    pub async fn pump(&mut self, sink: &mut dyn MessageSink) -> Result<()> {
        let Some(index) = self
            .slots
            .iter()
            .position(|slot| !slot.locked && slot.protocol.has_pending())
        else {
            return Ok(());
        };

        let mut transitions = Vec::new();
        {
            let Self { slots, hooks } = &mut *self;
            let slot = &mut slots[index];
            let mut mapped = MappedSink::new(sink, ProtocolId(index), slot, hooks, &mut transitions);
            slot.protocol.pump(&mut mapped).await?;
        }
        self.apply(transitions, sink).await
    }

    /// Whether every sub-protocol is finished.
    pub fn is_finished(&self) -> bool {
        self.slots.iter().all(|slot| slot.protocol.is_finished())
    }

    /// Apply transitions in order, including any that their own steps produce.
    async fn apply(&mut self, transitions: Vec<Transition>, sink: &mut dyn MessageSink) -> Result<()> {
        let mut queue: VecDeque<Transition> = transitions.into();
        while let Some(transition) = queue.pop_front() {
            match transition {
                Transition::Unlock(id) => {
                    self.unlock(id)?;
                    debug!(protocol = self.slot(id)?.protocol.name(), "unlocked");
                }
                Transition::Initiate(id) => {
                    let mut produced = Vec::new();
                    {
                        let Self { slots, hooks } = &mut *self;
                        let slot = slots.get_mut(id.0).ok_or_else(|| {
                            ProtocolError::InvalidMapping(format!("no protocol at index {}", id.0))
                        })?;
                        debug!(protocol = slot.protocol.name(), "initiating");
                        let mut mapped = MappedSink::new(sink, id, slot, hooks, &mut produced);
                        slot.protocol.initiate(&mut mapped).await?;
                    }
                    queue.extend(produced);
                }
            }
        }
        Ok(())
    }
}

fn fire(hooks: &HookMap, event: &HookEvent<'_>, transitions: &mut Vec<Transition>) {
    if let Some(list) = hooks.get(&(event.composed_type, event.direction)) {
        transitions.extend(list.iter().filter_map(|hook| hook(event)));
    }
}

/// Remaps a sub-protocol's output into composed types and runs outgoing hooks.
struct MappedSink<'a> {
    inner: &'a mut dyn MessageSink,
    id: ProtocolId,
    offset: u8,
    range: Range<u8>,
    hooks: &'a HookMap,
    transitions: &'a mut Vec<Transition>,
}

impl<'a> MappedSink<'a> {
    fn new(
        inner: &'a mut dyn MessageSink,
        id: ProtocolId,
        slot: &Slot,
        hooks: &'a HookMap,
        transitions: &'a mut Vec<Transition>,
    ) -> Self {
        Self {
            inner,
            id,
            offset: slot.offset,
            range: slot.range.clone(),
            hooks,
            transitions,
        }
    }
}

#[async_trait]
impl MessageSink for MappedSink<'_> {
    async fn send(&mut self, message: Message) -> Result<()> {
        let local = message.msg_type();
        if !self.range.contains(&local) {
            return Err(ProtocolError::UnknownMessageType(local));
        }
        let composed = self.offset + (local - self.range.start);
        let message = message.with_type(composed);
        let payload = message.payload().clone();

        self.inner.send(message).await?;

        fire(
            self.hooks,
            &HookEvent {
                protocol: self.id,
                local_type: local,
                composed_type: composed,
                payload: &payload,
                direction: Direction::Outgoing,
            },
            self.transitions,
        );
        Ok(())
    }
}
