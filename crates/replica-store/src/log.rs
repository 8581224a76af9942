//! Log-structured backend.
//!
//! Content lives in a single append-only `blobs.log`, one copy per distinct
//! Blake3 hash. The directory tree lives in `index.db` as an entry log: every
//! write or mkdir appends a row, and the latest row for a path is its current
//! state. Nothing is ever rewritten in place.
//!
//! The index is rusqlite behind a mutex; every index operation runs on a
//! blocking thread via `tokio::task::spawn_blocking`.

use std::collections::BTreeSet;
use std::fs::OpenOptions as StdOpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{
    BackendKind, ContentReader, ContentWriter, EntryKind, Stat, StorageBackend, WriteMode,
};
use crate::error::{Result, StoreError};
use crate::fs::STAGING_DIR;
use crate::migration::{self, now_millis};
use crate::path::RepoPath;

/// Index database file name.
pub const INDEX_FILE: &str = "index.db";

/// Blob log file name.
pub const BLOB_LOG_FILE: &str = "blobs.log";

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// Index connection plus the append handle of the blob log.
///
/// Both sit behind one lock so blob offsets and index rows stay in step.
struct LogState {
    conn: Connection,
    log: std::fs::File,
}

/// Latest index row for a path.
#[derive(Debug, Clone)]
struct EntryRow {
    kind: EntryKind,
    blob: Option<Vec<u8>>,
    size: u64,
    mode: u32,
    modified: i64,
}

impl EntryRow {
    fn to_stat(&self) -> Stat {
        Stat {
            kind: self.kind,
            size: self.size,
            mode: self.mode,
            modified: Some(UNIX_EPOCH + Duration::from_millis(self.modified.max(0) as u64)),
        }
    }
}

/// Content-addressed, append-only storage.
#[derive(Clone)]
pub struct LogBackend {
    log_path: PathBuf,
    staging: PathBuf,
    state: Arc<Mutex<LogState>>,
}

impl LogBackend {
    /// Open (creating if needed) a log backend rooted at `root`.
    ///
    /// Completes once the index is open and migrated.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;

        let index_path = root.join(INDEX_FILE);
        let log_path = root.join(BLOB_LOG_FILE);
        let open_log_path = log_path.clone();

        let state = tokio::task::spawn_blocking(move || -> Result<LogState> {
            let mut conn = Connection::open(&index_path)?;
            migration::migrate(&mut conn)?;
            let log = StdOpenOptions::new()
                .create(true)
                .append(true)
                .open(&open_log_path)?;
            Ok(LogState { conn, log })
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))??;

        info!(root = %root.display(), "log backend ready");

        Ok(Self {
            log_path,
            staging,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Number of distinct blobs stored.
    pub async fn blob_count(&self) -> Result<u64> {
        self.blocking(|state| {
            let count: i64 = state
                .conn
                .query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Run `f` against the locked state on a blocking thread.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LogState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.state), f).await
    }

    async fn latest(&self, path: &RepoPath) -> Result<Option<EntryRow>> {
        let key = path.key();
        self.blocking(move |state| latest_entry(&state.conn, &key)).await
    }
}

async fn run_blocking<F, T>(state: Arc<Mutex<LogState>>, f: F) -> Result<T>
where
    F: FnOnce(&mut LogState) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = state.lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
}

fn latest_entry(conn: &Connection, key: &str) -> Result<Option<EntryRow>> {
    let row = conn
        .query_row(
            "SELECT kind, blob_hash, size, mode, modified FROM entries
             WHERE path = ?1 ORDER BY seq DESC LIMIT 1",
            params![key],
            |row| {
                let kind: i64 = row.get(0)?;
                Ok(EntryRow {
                    kind: if kind == 1 {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    blob: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    mode: row.get(3)?,
                    modified: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Append directory rows for every path in `dirs` that is not already one.
fn ensure_dirs(conn: &Connection, dirs: &[RepoPath], now: i64) -> Result<()> {
    for dir in dirs {
        match latest_entry(conn, &dir.key())? {
            Some(row) if row.kind == EntryKind::Directory => {}
            Some(_) => return Err(StoreError::NotADirectory(dir.to_string())),
            None => {
                conn.execute(
                    "INSERT INTO entries (path, kind, blob_hash, size, mode, modified)
                     VALUES (?1, 1, NULL, 0, ?2, ?3)",
                    params![dir.key(), DIR_MODE, now],
                )?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for LogBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Log
    }

    async fn stat(&self, path: &RepoPath) -> Result<Stat> {
        if path.is_root() {
            return Ok(Stat {
                kind: EntryKind::Directory,
                size: 0,
                mode: DIR_MODE,
                modified: None,
            });
        }
        self.latest(path)
            .await?
            .map(|row| row.to_stat())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn readdir(&self, path: &RepoPath) -> Result<Vec<String>> {
        let dir = path.clone();
        self.blocking(move |state| {
            if !dir.is_root() {
                match latest_entry(&state.conn, &dir.key())? {
                    Some(row) if row.kind == EntryKind::Directory => {}
                    Some(_) => return Err(StoreError::NotADirectory(dir.to_string())),
                    None => return Err(StoreError::NotFound(dir.to_string())),
                }
            }

            let prefix = if dir.is_root() {
                String::new()
            } else {
                format!("{}/", dir.key())
            };
            let mut stmt = state.conn.prepare(
                "SELECT DISTINCT path FROM entries WHERE substr(path, 1, ?1) = ?2",
            )?;
            let paths = stmt
                .query_map(params![prefix.chars().count() as i64, prefix], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let names: BTreeSet<String> = paths
                .iter()
                .filter_map(|p| p.get(prefix.len()..))
                .filter_map(|rest| rest.split('/').next())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            Ok(names.into_iter().collect())
        })
        .await
    }

    async fn mkdir(&self, path: &RepoPath) -> Result<()> {
        if path.is_root() {
            return Ok(());
        }
        let mut dirs = path.ancestors();
        dirs.push(path.clone());
        self.blocking(move |state| {
            let tx = state.conn.transaction()?;
            ensure_dirs(&tx, &dirs, now_millis())?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn open_read(&self, path: &RepoPath) -> Result<ContentReader> {
        if path.is_root() {
            return Err(StoreError::IsADirectory(path.to_string()));
        }
        let key = path.key();
        let name = path.to_string();
        let (offset, length) = self
            .blocking(move |state| {
                let row = latest_entry(&state.conn, &key)?
                    .ok_or_else(|| StoreError::NotFound(name.clone()))?;
                if row.kind == EntryKind::Directory {
                    return Err(StoreError::IsADirectory(name));
                }
                let hash = row
                    .blob
                    .ok_or_else(|| StoreError::InvalidData(format!("file without blob: {}", name)))?;
                let (offset, length): (i64, i64) = state
                    .conn
                    .query_row(
                        "SELECT offset, length FROM blobs WHERE hash = ?1",
                        params![hash],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?
                    .ok_or_else(|| {
                        StoreError::InvalidData(format!("missing blob {}", hex::encode(&hash)))
                    })?;
                Ok((offset as u64, length as u64))
            })
            .await?;

        let mut file = File::open(&self.log_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(length)))
    }

    async fn open_write(&self, path: &RepoPath, mode: WriteMode) -> Result<Box<dyn ContentWriter>> {
        if path.is_root() {
            return Err(StoreError::IsADirectory(path.to_string()));
        }
        let existing = match self.latest(path).await? {
            Some(row) if row.kind == EntryKind::Directory => {
                return Err(StoreError::IsADirectory(path.to_string()))
            }
            Some(_) => true,
            None => false,
        };

        let staging = self.staging.join(Uuid::new_v4().simple().to_string());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;

        let mut writer = Box::new(LogWriter {
            file: Some(file),
            staging,
            path: path.clone(),
            hasher: blake3::Hasher::new(),
            size: 0,
            state: Arc::clone(&self.state),
        });

        if mode == WriteMode::Append && existing {
            let mut reader = self.open_read(path).await?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n]).await?;
            }
        }

        debug!(path = %path, ?mode, "opened log write");
        Ok(writer as Box<dyn ContentWriter>)
    }
}

/// Staged write for [`LogBackend`].
struct LogWriter {
    file: Option<File>,
    staging: PathBuf,
    path: RepoPath,
    hasher: blake3::Hasher,
    size: u64,
    state: Arc<Mutex<LogState>>,
}

#[async_trait]
impl ContentWriter for LogWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::InvalidData(format!("write after commit: {}", self.path)))?;
        file.write_all(buf).await?;
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StoreError::InvalidData(format!("double commit: {}", self.path)))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let hash = self.hasher.finalize();
        let size = self.size;
        let path = self.path.clone();
        let staging = self.staging.clone();

        let appended = run_blocking(Arc::clone(&self.state), move |state| {
            let LogState { conn, log } = state;
            let hash_bytes = hash.as_bytes().to_vec();
            let now = now_millis();

            let tx = conn.transaction()?;
            if let Some(row) = latest_entry(&tx, &path.key())? {
                if row.kind == EntryKind::Directory {
                    return Err(StoreError::IsADirectory(path.to_string()));
                }
            }
            ensure_dirs(&tx, &path.ancestors(), now)?;

            let known: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM blobs WHERE hash = ?1",
                    params![hash_bytes],
                    |row| row.get(0),
                )
                .optional()?;
            let appended = known.is_none();
            if appended {
                let offset = log.metadata()?.len();
                let mut source = std::fs::File::open(&staging)?;
                std::io::copy(&mut source, log)?;
                log.sync_data()?;
                tx.execute(
                    "INSERT INTO blobs (hash, offset, length, stored_at) VALUES (?1, ?2, ?3, ?4)",
                    params![hash_bytes, offset as i64, size as i64, now],
                )?;
            }

            tx.execute(
                "INSERT INTO entries (path, kind, blob_hash, size, mode, modified)
                 VALUES (?1, 0, ?2, ?3, ?4, ?5)",
                params![path.key(), hash_bytes, size as i64, FILE_MODE, now],
            )?;
            tx.commit()?;
            Ok(appended)
        })
        .await?;

        debug!(
            path = %self.path,
            size,
            blob = %hash.to_hex(),
            deduplicated = !appended,
            "committed log write"
        );
        Ok(size)
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if std::fs::metadata(&self.staging).is_ok() {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}
