//! Test fixtures and helpers.
//!
//! Nodes and pools rooted in temporary directories that are removed when
//! the fixture is dropped.

use std::sync::Arc;

use replica::{Node, NodeConfig, Result};
use replica_core::{BoxPublicKey, Keypair};
use replica_store::{
    BackendKind, PoolConfig, RepoId, Repository, RepositoryPool, WriteMode,
};
use tempfile::TempDir;

/// Deterministic identity for fixture `seed`.
pub fn keypair(seed: u8) -> Keypair {
    Keypair::from_seed(&[seed; 32])
}

/// Write `data` to `name` in `repo` and commit it.
pub async fn put(repo: &Repository, name: &str, data: &[u8]) -> Result<u64> {
    let mut writer = repo.open_write(name, WriteMode::Truncate).await?;
    writer.write(data).await?;
    Ok(writer.commit().await?)
}

/// A node with its own temporary pool directory.
pub struct TestNode {
    pub node: Arc<Node>,
    dir: TempDir,
}

impl TestNode {
    /// Open a node keyed by `seed` with small chunks, so transfers span
    /// several DATA messages.
    pub async fn new(seed: u8, backend: BackendKind) -> Result<Self> {
        let dir = TempDir::new()?;
        let mut config = NodeConfig::new(dir.path());
        config.storage.backend = backend;
        config.sync.chunk_size = 1024;
        Self::with_config(seed, config, dir).await
    }

    pub async fn with_config(seed: u8, config: NodeConfig, dir: TempDir) -> Result<Self> {
        let node = Node::open(keypair(seed), config).await?;
        Ok(Self {
            node: Arc::new(node),
            dir,
        })
    }

    pub fn public_key(&self) -> BoxPublicKey {
        self.node.public_key()
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Create a repository holding `files`.
    pub async fn repo_with(&self, files: &[(&str, &[u8])]) -> Result<(RepoId, Arc<Repository>)> {
        let (id, repo) = self.node.pool().create(None).await?;
        for (name, data) in files {
            put(&repo, name, data).await?;
        }
        Ok((id, repo))
    }
}

/// `count` nodes with seeds `1..=count`, alternating backends.
pub async fn node_fixtures(count: u8) -> Result<Vec<TestNode>> {
    let mut nodes = Vec::with_capacity(count as usize);
    for seed in 1..=count {
        let backend = if seed % 2 == 1 {
            BackendKind::Filesystem
        } else {
            BackendKind::Log
        };
        nodes.push(TestNode::new(seed, backend).await?);
    }
    Ok(nodes)
}

/// A bare repository pool on a temporary directory.
pub struct TestPool {
    pub pool: RepositoryPool,
    dir: TempDir,
}

impl TestPool {
    pub async fn new(pool_size: usize, backend: BackendKind) -> replica_store::Result<Self> {
        let dir = TempDir::new()?;
        let config = PoolConfig {
            base_path: dir.path().to_path_buf(),
            pool_size,
            backend,
        };
        Ok(Self {
            pool: RepositoryPool::open(config).await?,
            dir,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_fixture() {
        let fixture = TestNode::new(7, BackendKind::Log).await.unwrap();
        let (id, repo) = fixture.repo_with(&[("a", &b"1"[..]), ("b", &b"22"[..])]).await.unwrap();

        assert_eq!(repo.size("b").await.unwrap(), 2);
        assert!(fixture.node.pool().has(&id).await.unwrap());
        assert!(fixture.path().join("pool.cbor").exists());
        assert_eq!(fixture.public_key(), keypair(7).box_public_key());
    }

    #[tokio::test]
    async fn test_node_fixtures_differ() {
        let nodes = node_fixtures(3).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert_ne!(nodes[0].public_key(), nodes[1].public_key());
        assert_eq!(nodes[1].node.config().storage.backend, BackendKind::Log);
    }

    #[tokio::test]
    async fn test_pool_fixture() {
        let fixture = TestPool::new(2, BackendKind::Filesystem).await.unwrap();
        let (id, _) = fixture.pool.create(None).await.unwrap();
        assert!(fixture.pool.is_resident(&id));
        assert!(fixture.path().exists());
    }
}
