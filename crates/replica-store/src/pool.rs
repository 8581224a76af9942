//! Repository pool.
//!
//! The pool owns a base directory and a bounded LRU cache of open
//! repositories. Repositories live at `<base>/<id[0..2]>/<id[2..4]>/<id>`,
//! and an evicted repository is simply reopened from disk on the next `get`.
//!
//! ## Identity
//!
//! The pool has a persistent id, generated on first open and stored in
//! `<base>/pool.cbor`. Repository ids are UUID v5 values in the pool id's
//! namespace, named by a fresh 16-byte random seed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::backend::BackendKind;
use crate::error::{Result, StoreError};
use crate::migration::now_millis;
use crate::repository::Repository;
use crate::template::Template;

/// Pool metadata file name under the base path.
pub const POOL_META_FILE: &str = "pool.cbor";

/// Default number of resident repositories.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Attempts at drawing an unused repository id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Configuration for a [`RepositoryPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the pool metadata and all repositories.
    pub base_path: PathBuf,
    /// Maximum number of repositories kept open.
    pub pool_size: usize,
    /// Backend used for every repository in the pool.
    pub backend: BackendKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("replica-data"),
            pool_size: DEFAULT_POOL_SIZE,
            backend: BackendKind::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }
}

/// Identifier of a repository within a pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId(Uuid);

impl RepoId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({})", self.0.simple())
    }
}

impl FromStr for RepoId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(RepoId)
            .map_err(|e| StoreError::InvalidId(format!("{}: {}", s, e)))
    }
}

/// Persistent pool metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolMeta {
    pool_id: Uuid,
    backend: BackendKind,
    created_at: i64,
}

/// An LRU-bounded set of repositories under one base directory.
pub struct RepositoryPool {
    config: PoolConfig,
    pool_id: Uuid,
    cache: Mutex<LruCache<RepoId, Arc<Repository>>>,
    /// In-flight constructions, one cell per id.
    loading: LoadingMap,
}

impl fmt::Debug for RepositoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryPool")
            .field("base_path", &self.config.base_path)
            .field("pool_id", &self.pool_id)
            .field("resident", &self.resident_count())
            .finish()
    }
}

impl RepositoryPool {
    /// Open the pool at `config.base_path`, creating it if needed.
    pub async fn open(config: PoolConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_path).await?;
        let meta = load_or_create_meta(&config).await?;

        if meta.backend != config.backend {
            return Err(StoreError::InvalidData(format!(
                "pool at {} uses the {} backend, configured for {}",
                config.base_path.display(),
                meta.backend,
                config.backend
            )));
        }

        let capacity = NonZeroUsize::new(config.pool_size).unwrap_or_else(|| {
            warn!("pool_size 0 is not usable, keeping one repository resident");
            NonZeroUsize::MIN
        });

        info!(
            base = %config.base_path.display(),
            pool_id = %meta.pool_id,
            capacity = capacity.get(),
            backend = %config.backend,
            "repository pool opened"
        );

        Ok(Self {
            pool_id: meta.pool_id,
            cache: Mutex::new(LruCache::new(capacity)),
            loading: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn pool_id(&self) -> Uuid {
        self.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// On-disk location of a repository.
    pub fn repo_path(&self, id: &RepoId) -> PathBuf {
        let name = id.to_string();
        self.config
            .base_path
            .join(&name[0..2])
            .join(&name[2..4])
            .join(&name)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new repository, seed it from `template`, and cache it.
    ///
    /// The repository becomes visible to `get` only once seeding finishes.
    /// A failed template removes the half-built repository.
    pub async fn create(&self, template: Option<Template>) -> Result<(RepoId, Arc<Repository>)> {
        let id = self.fresh_id().await?;
        let path = self.repo_path(&id);
        let kind = self.config.backend;

        let repo = self
            .load(id, async move {
                tokio::fs::create_dir_all(&path).await?;
                let built = async {
                    let repo = Repository::new(&path, kind).await?;
                    if let Some(template) = template {
                        repo.populate(template).await?;
                    }
                    Ok::<_, StoreError>(repo)
                }
                .await;
                if built.is_err() {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                }
                built
            })
            .await?;

        info!(repo = %id, "repository created");
        Ok((id, repo))
    }

    /// Look up a repository, opening it from disk if it is not resident.
    ///
    /// Concurrent calls for the same id share one construction.
    pub async fn get(&self, id: &RepoId) -> Result<Option<Arc<Repository>>> {
        let cached = self.cache.lock().get(id).cloned();
        if let Some(repo) = cached {
            return Ok(Some(repo));
        }

        let path = self.repo_path(id);
        let kind = self.config.backend;
        let name = id.to_string();
        let loaded = self
            .load(*id, async move {
                if !tokio::fs::try_exists(&path).await? {
                    return Err(StoreError::RepositoryNotFound(name));
                }
                Repository::new(&path, kind).await
            })
            .await;

        match loaded {
            Ok(repo) => {
                debug!(repo = %id, "repository loaded from disk");
                Ok(Some(repo))
            }
            Err(StoreError::RepositoryNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether a repository with this id exists, resident or not.
    pub async fn has(&self, id: &RepoId) -> Result<bool> {
        if self.is_resident(id) || self.loading.lock().contains_key(id) {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.repo_path(id)).await?)
    }

    /// Ids of every repository on disk, sorted.
    pub async fn list_ids(&self) -> Result<Vec<RepoId>> {
        let base = self.config.base_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<RepoId>> {
            let mut ids = Vec::new();
            for entry in WalkDir::new(&base).min_depth(3).max_depth(3) {
                let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
                if !entry.file_type().is_dir() {
                    continue;
                }
                match entry.file_name().to_str().map(RepoId::from_str) {
                    Some(Ok(id)) => ids.push(id),
                    _ => debug!(path = %entry.path().display(), "ignoring stray pool entry"),
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cache
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether the repository is currently held in the cache.
    pub fn is_resident(&self, id: &RepoId) -> bool {
        self.cache.lock().contains(id)
    }

    pub fn resident_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Resident ids, most recently used first.
    pub fn resident_ids(&self) -> Vec<RepoId> {
        self.cache.lock().iter().map(|(id, _)| *id).collect()
    }

    async fn fresh_id(&self) -> Result<RepoId> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let mut seed = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut seed);
            let id = RepoId(Uuid::new_v5(&self.pool_id, &seed));

            if self.is_resident(&id) || self.loading.lock().contains_key(&id) {
                continue;
            }
            if tokio::fs::try_exists(self.repo_path(&id)).await? {
                debug!(repo = %id, "repository id already on disk, drawing again");
                continue;
            }
            return Ok(id);
        }
        Err(StoreError::AlreadyExists(
            "no unused repository id after repeated attempts".to_string(),
        ))
    }

    /// Run `init` at most once per id across concurrent callers, then cache.
    async fn load<F>(&self, id: RepoId, init: F) -> Result<Arc<Repository>>
    where
        F: Future<Output = Result<Repository>>,
    {
        let guard = LoadingGuard {
            loading: &self.loading,
            id,
            cell: Arc::clone(
                self.loading
                    .lock()
                    .entry(id)
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            ),
        };

        let result = guard
            .cell
            .get_or_try_init(|| async move { init.await.map(Arc::new) })
            .await
            .cloned();

        if let Ok(repo) = &result {
            self.insert(id, Arc::clone(repo));
        }
        result
    }

    fn insert(&self, id: RepoId, repo: Arc<Repository>) {
        let displaced = self.cache.lock().push(id, repo);
        if let Some((evicted, _)) = displaced {
            if evicted != id {
                debug!(repo = %evicted, "evicted repository from pool");
            }
        }
    }
}

type LoadingMap = Mutex<HashMap<RepoId, Arc<OnceCell<Arc<Repository>>>>>;

/// Clears a `loading` entry when its last caller finishes or is dropped.
struct LoadingGuard<'a> {
    loading: &'a LoadingMap,
    id: RepoId,
    cell: Arc<OnceCell<Arc<Repository>>>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut loading = self.loading.lock();
        let Some(current) = loading.get(&self.id) else {
            return;
        };
        // Map plus this guard: nobody else is still waiting on the cell.
        let last = Arc::strong_count(&self.cell) <= 2;
        if Arc::ptr_eq(current, &self.cell) && (self.cell.initialized() || last) {
            loading.remove(&self.id);
        }
    }
}

async fn load_or_create_meta(config: &PoolConfig) -> Result<PoolMeta> {
    let path = config.base_path.join(POOL_META_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ciborium::from_reader(&bytes[..])
            .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let meta = PoolMeta {
                pool_id: Uuid::new_v4(),
                backend: config.backend,
                created_at: now_millis(),
            };
            write_meta(&path, &meta).await?;
            info!(pool_id = %meta.pool_id, "generated pool id");
            Ok(meta)
        }
        Err(e) => Err(StoreError::Io(e)),
    }
}

async fn write_meta(path: &Path, meta: &PoolMeta) -> Result<()> {
    let mut bytes = Vec::new();
    ciborium::into_writer(meta, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("cbor.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
