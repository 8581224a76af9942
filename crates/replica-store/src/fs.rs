//! Filesystem backend.
//!
//! Entries are plain files and directories under the repository root.
//! Writes land in a staging file under `<root>/.replica-staging/` and are
//! renamed into place on commit, so readers never observe partial content.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    BackendKind, ContentReader, ContentWriter, EntryKind, Stat, StorageBackend, WriteMode,
};
use crate::error::{Result, StoreError};
use crate::path::RepoPath;

/// Name of the staging directory under the repository root.
pub const STAGING_DIR: &str = ".replica-staging";

/// Plain-file storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    staging: PathBuf,
}

impl FsBackend {
    /// Open (creating if needed) a filesystem backend at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        Ok(Self { root, staging })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn metadata(&self, path: &RepoPath) -> Result<std::fs::Metadata> {
        fs::metadata(path.to_fs_path(&self.root))
            .await
            .map_err(|e| not_found_or(e, path))
    }
}

fn not_found_or(err: std::io::Error, path: &RepoPath) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn stat(&self, path: &RepoPath) -> Result<Stat> {
        let meta = self.metadata(path).await?;
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Ok(Stat {
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            mode: mode_bits(&meta),
            modified: meta.modified().ok(),
        })
    }

    async fn readdir(&self, path: &RepoPath) -> Result<Vec<String>> {
        let meta = self.metadata(path).await?;
        if !meta.is_dir() {
            return Err(StoreError::NotADirectory(path.to_string()));
        }

        let mut entries = fs::read_dir(path.to_fs_path(&self.root)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_root() && name == STAGING_DIR {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn mkdir(&self, path: &RepoPath) -> Result<()> {
        let target = path.to_fs_path(&self.root);
        match fs::create_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::NotADirectory(path.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn open_read(&self, path: &RepoPath) -> Result<ContentReader> {
        let meta = self.metadata(path).await?;
        if meta.is_dir() {
            return Err(StoreError::IsADirectory(path.to_string()));
        }
        let file = File::open(path.to_fs_path(&self.root))
            .await
            .map_err(|e| not_found_or(e, path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &RepoPath, mode: WriteMode) -> Result<Box<dyn ContentWriter>> {
        if path.is_root() {
            return Err(StoreError::IsADirectory(path.to_string()));
        }
        let target = path.to_fs_path(&self.root);
        let staging = self.staging.join(Uuid::new_v4().simple().to_string());

        let mut existing = 0;
        if mode == WriteMode::Append {
            match fs::metadata(&target).await {
                Ok(meta) if meta.is_dir() => {
                    return Err(StoreError::IsADirectory(path.to_string()))
                }
                Ok(_) => existing = fs::copy(&target, &staging).await?,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;

        debug!(path = %path, staging = %staging.display(), ?mode, "opened staged write");

        Ok(Box::new(FsWriter {
            file: Some(file),
            staging,
            target,
            name: path.to_string(),
            size: existing,
        }))
    }
}

/// Staged write for [`FsBackend`].
struct FsWriter {
    file: Option<File>,
    staging: PathBuf,
    target: PathBuf,
    name: String,
    size: u64,
}

#[async_trait]
impl ContentWriter for FsWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::InvalidData(format!("write after commit: {}", self.name)))?;
        file.write_all(buf).await?;
        self.size += buf.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StoreError::InvalidData(format!("double commit: {}", self.name)))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    StoreError::NotADirectory(self.name.clone())
                } else {
                    StoreError::Io(e)
                }
            })?;
        }
        if fs::metadata(&self.target).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(StoreError::IsADirectory(self.name.clone()));
        }
        fs::rename(&self.staging, &self.target).await?;

        debug!(path = %self.name, size = self.size, "committed write");
        Ok(self.size)
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        // Uncommitted or failed: the staging file is garbage either way.
        if std::fs::metadata(&self.staging).is_ok() {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}
