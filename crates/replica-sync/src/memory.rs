//! In-memory content streams for tests and tools.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use replica_store::{ContentReader, ContentWriter, StoreError};

use crate::error::{SyncError, SyncResult};
use crate::sync::{ContentId, ContentStreams};

/// A map of content items shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStreams {
    items: Arc<Mutex<HashMap<ContentId, Bytes>>>,
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<ContentId>, data: impl Into<Bytes>) {
        self.items.lock().insert(id.into(), data.into());
    }

    pub fn get(&self, id: impl Into<ContentId>) -> Option<Bytes> {
        self.items.lock().get(&id.into()).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl ContentStreams for MemoryStreams {
    async fn open_read(&self, id: &ContentId) -> SyncResult<ContentReader> {
        let data = self
            .items
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::Store(StoreError::NotFound(id.to_string())))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn open_write(&self, id: &ContentId) -> SyncResult<Box<dyn ContentWriter>> {
        Ok(Box::new(MemoryWriter {
            id: id.clone(),
            buf: Vec::new(),
            items: Arc::clone(&self.items),
        }))
    }
}

struct MemoryWriter {
    id: ContentId,
    buf: Vec<u8>,
    items: Arc<Mutex<HashMap<ContentId, Bytes>>>,
}

#[async_trait]
impl ContentWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> replica_store::Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> replica_store::Result<u64> {
        let MemoryWriter { id, buf, items } = *self;
        let size = buf.len() as u64;
        items.lock().insert(id, Bytes::from(buf));
        Ok(size)
    }
}
