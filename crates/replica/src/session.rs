//! Registry of live sessions.
//!
//! Every connection a [`Node`](crate::Node) runs is registered here for its
//! lifetime. Registration hands back a [`SessionGuard`]; dropping the guard
//! removes the entry, so a session is deregistered however it ends.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use replica_sync::Role;
use tracing::debug;

use crate::error::{NodeError, Result};

/// Identifies one session on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Remote address, when the transport has one.
    pub peer_addr: Option<SocketAddr>,
    pub role: Role,
    /// Per-registry sequence number.
    pub serial: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{}#{}@{}", self.role, self.serial, addr),
            None => write!(f, "{}#{}", self.role, self.serial),
        }
    }
}

/// What the registry knows about a live session.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub started: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: Mutex<HashMap<ConnectionId, SessionInfo>>,
    next_serial: AtomicU64,
}

/// Shared set of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.active()).finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id with a fresh serial.
    pub fn next_id(&self, peer_addr: Option<SocketAddr>, role: Role) -> ConnectionId {
        ConnectionId {
            peer_addr,
            role,
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Register `id` until the returned guard is dropped.
    pub fn register(&self, id: ConnectionId) -> Result<SessionGuard> {
        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(NodeError::SessionExists(id));
        }
        sessions.insert(
            id,
            SessionInfo {
                started: Instant::now(),
            },
        );
        debug!(session = %id, live = sessions.len(), "session registered");
        Ok(SessionGuard {
            registry: self.clone(),
            id,
        })
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.sessions.lock().contains_key(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<SessionInfo> {
        self.inner.sessions.lock().get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live session ids, oldest first.
    pub fn active(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.sessions.lock().keys().copied().collect();
        ids.sort_by_key(|id| id.serial);
        ids
    }

    fn remove(&self, id: &ConnectionId) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(info) = sessions.remove(id) {
            debug!(
                session = %id,
                elapsed_ms = info.started.elapsed().as_millis() as u64,
                live = sessions.len(),
                "session removed"
            );
        }
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    id: ConnectionId,
}

impl SessionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
