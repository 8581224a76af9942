//! A single repository: a named tree of files behind a storage backend.
//!
//! Every name a caller passes is resolved with [`RepoPath::resolve`] before
//! it reaches the backend, so nothing outside the repository root can be
//! named. A `..` that would escape is rejected with `PathEscape`.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::backend::{BackendKind, ContentReader, ContentWriter, Stat, StorageBackend, WriteMode};
use crate::error::{Result, StoreError};
use crate::fs::FsBackend;
use crate::log::LogBackend;
use crate::path::RepoPath;
use crate::template::Template;

/// Mime type reported when content sniffing finds nothing.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Buffer size for copying content into the repository.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Bytes read from the head of a file for mime detection.
const SNIFF_LEN: usize = 8192;

/// Access mode for [`Repository::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Replace content on commit.
    Write,
    /// Extend existing content on commit.
    Append,
}

/// A stream returned by [`Repository::open`].
pub enum RepoStream {
    Reader(ContentReader),
    Writer(Box<dyn ContentWriter>),
}

impl RepoStream {
    pub fn into_reader(self) -> Option<ContentReader> {
        match self {
            RepoStream::Reader(reader) => Some(reader),
            RepoStream::Writer(_) => None,
        }
    }

    pub fn into_writer(self) -> Option<Box<dyn ContentWriter>> {
        match self {
            RepoStream::Writer(writer) => Some(writer),
            RepoStream::Reader(_) => None,
        }
    }
}

/// A repository rooted at a directory.
pub struct Repository {
    root: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.root)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl Repository {
    /// Open a repository at `root` with the given backend.
    ///
    /// Completes when the backend is ready to serve requests.
    pub async fn new(root: impl AsRef<Path>, kind: BackendKind) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let backend: Box<dyn StorageBackend> = match kind {
            BackendKind::Filesystem => Box::new(FsBackend::open(&root).await?),
            BackendKind::Log => Box::new(LogBackend::open(&root).await?),
        };
        debug!(root = %root.display(), backend = %kind, "repository ready");
        Ok(Self { root, backend })
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(root: impl Into<PathBuf>, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn stat(&self, name: &str) -> Result<Stat> {
        let path = RepoPath::resolve(name)?;
        self.backend.stat(&path).await
    }

    /// Size in bytes of the entry at `name`.
    pub async fn size(&self, name: &str) -> Result<u64> {
        Ok(self.stat(name).await?.size)
    }

    /// Names directly inside `dir`, sorted.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = RepoPath::resolve(dir)?;
        self.backend.readdir(&path).await
    }

    /// Create `dir` and any missing parents.
    pub async fn mkdir(&self, dir: &str) -> Result<()> {
        let path = RepoPath::resolve(dir)?;
        self.backend.mkdir(&path).await
    }

    /// Sniff the content type of the file at `name`.
    ///
    /// Falls back to [`DEFAULT_MIME`] when the head of the file matches no
    /// known signature.
    pub async fn detect_mime(&self, name: &str) -> Result<String> {
        let mut reader = self.open_read(name).await?;
        let mut head = vec![0u8; SNIFF_LEN];
        let mut filled = 0;
        while filled < head.len() {
            let n = reader.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let mime = infer::get(&head[..filled])
            .map(|kind| kind.mime_type())
            .unwrap_or(DEFAULT_MIME);
        Ok(mime.to_string())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Open `name` in the given mode.
    pub async fn open(&self, name: &str, mode: OpenMode) -> Result<RepoStream> {
        match mode {
            OpenMode::Read => Ok(RepoStream::Reader(self.open_read(name).await?)),
            OpenMode::Write => Ok(RepoStream::Writer(
                self.open_write(name, WriteMode::Truncate).await?,
            )),
            OpenMode::Append => Ok(RepoStream::Writer(
                self.open_write(name, WriteMode::Append).await?,
            )),
        }
    }

    pub async fn open_read(&self, name: &str) -> Result<ContentReader> {
        let path = RepoPath::resolve(name)?;
        self.backend.open_read(&path).await
    }

    /// Open `name` for writing. Parent directories are created on commit.
    pub async fn open_write(&self, name: &str, mode: WriteMode) -> Result<Box<dyn ContentWriter>> {
        let path = RepoPath::resolve(name)?;
        self.backend.open_write(&path, mode).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Templates
    // ─────────────────────────────────────────────────────────────────────────

    /// Seed the repository from a template.
    pub async fn populate(&self, template: Template) -> Result<()> {
        match template {
            Template::Directory(source) => self.copy_tree(source).await,
            Template::Setup(setup) => setup(self).await,
        }
    }

    async fn copy_tree(&self, source: PathBuf) -> Result<()> {
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| StoreError::Template(format!("{}: {}", source.display(), e)))?;
        if !meta.is_dir() {
            return Err(StoreError::Template(format!(
                "not a directory: {}",
                source.display()
            )));
        }

        let walk_root = source.clone();
        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<(String, bool)>> {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&walk_root).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|e| StoreError::Template(e.to_string()))?;
                let relative = entry
                    .path()
                    .strip_prefix(&walk_root)
                    .map_err(|e| StoreError::Template(e.to_string()))?;
                let name = relative.to_str().ok_or_else(|| {
                    StoreError::Template(format!("non UTF-8 name: {}", relative.display()))
                })?;
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    entries.push((name.to_string(), true));
                } else if file_type.is_file() {
                    entries.push((name.to_string(), false));
                } else {
                    debug!(path = %entry.path().display(), "skipping non-regular template entry");
                }
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))??;

        let mut files = 0usize;
        for (name, is_dir) in &entries {
            if *is_dir {
                self.mkdir(name).await?;
                continue;
            }
            let mut input = File::open(source.join(name)).await?;
            let mut writer = self.open_write(name, WriteMode::Truncate).await?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n]).await?;
            }
            writer.commit().await?;
            files += 1;
        }

        info!(
            root = %self.root.display(),
            source = %source.display(),
            files,
            "populated repository from directory"
        );
        Ok(())
    }
}
