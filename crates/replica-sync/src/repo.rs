//! Content streams backed by a repository.
//!
//! Identifiers are used as names inside the repository, so they must be
//! UTF-8 and are subject to the same containment rules as any other name.

use async_trait::async_trait;
use replica_store::{ContentReader, ContentWriter, Repository, WriteMode};

use crate::error::SyncResult;
use crate::sync::{ContentId, ContentStreams};

#[async_trait]
impl ContentStreams for Repository {
    async fn open_read(&self, id: &ContentId) -> SyncResult<ContentReader> {
        let name = id.as_str()?;
        Ok(Repository::open_read(self, name).await?)
    }

    async fn open_write(&self, id: &ContentId) -> SyncResult<Box<dyn ContentWriter>> {
        let name = id.as_str()?;
        Ok(Repository::open_write(self, name, WriteMode::Truncate).await?)
    }
}
