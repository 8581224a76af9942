//! Node configuration.
//!
//! All sections are optional when loading from JSON; missing fields take
//! their defaults.
//!
//! ```json
//! {
//!   "storage": { "base_path": "/var/lib/replica", "pool_size": 50, "backend": "log" },
//!   "auth": { "challenge_size": 32 },
//!   "sync": { "chunk_size": 65535 },
//!   "outbound_buffer": 32
//! }
//! ```

use std::path::Path;

use replica_store::PoolConfig;
use replica_sync::{AuthConfig, SyncConfig, DEFAULT_OUTBOUND_BUFFER};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Repository pool settings.
    pub storage: PoolConfig,
    /// Handshake settings.
    pub auth: AuthConfig,
    /// Transfer settings.
    pub sync: SyncConfig,
    /// Outgoing messages buffered per connection.
    pub outbound_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage: PoolConfig::default(),
            auth: AuthConfig::default(),
            sync: SyncConfig::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl NodeConfig {
    /// Default configuration storing repositories under `base_path`.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            storage: PoolConfig::new(base_path.as_ref()),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Check values that the type system doesn't.
    pub fn validate(&self) -> Result<()> {
        self.sync
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        if self.auth.challenge_size == 0 {
            return Err(NodeError::Config("auth.challenge_size must be positive".into()));
        }
        if self.storage.pool_size == 0 {
            return Err(NodeError::Config("storage.pool_size must be positive".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(NodeError::Config("outbound_buffer must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use replica_store::BackendKind;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
        assert_eq!(config.auth.challenge_size, 32);
        assert_eq!(config.sync.chunk_size, 32 * 1024);
        assert_eq!(config.storage.backend, BackendKind::Filesystem);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let config = NodeConfig::from_json_str(
            r#"{ "storage": { "base_path": "/tmp/pool", "backend": "log" }, "sync": { "chunk_size": 1024 } }"#,
        )
        .unwrap();

        assert_eq!(config.storage.base_path, Path::new("/tmp/pool"));
        assert_eq!(config.storage.backend, BackendKind::Log);
        assert_eq!(config.storage.pool_size, replica_store::DEFAULT_POOL_SIZE);
        assert_eq!(config.sync.chunk_size, 1024);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(NodeConfig::from_json_str("{}").unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_invalid_values() {
        for json in [
            r#"{ "sync": { "chunk_size": 0 } }"#,
            r#"{ "sync": { "chunk_size": 70000 } }"#,
            r#"{ "auth": { "challenge_size": 0 } }"#,
            r#"{ "outbound_buffer": 0 }"#,
            r#"{ "storage": { "backend": "tape" } }"#,
            "not json",
        ] {
            assert!(
                matches!(NodeConfig::from_json_str(json), Err(NodeError::Config(_))),
                "accepted {json}"
            );
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "outbound_buffer": 4 }"#).unwrap();

        assert_eq!(NodeConfig::from_json_file(&path).unwrap().outbound_buffer, 4);
        assert!(matches!(
            NodeConfig::from_json_file(dir.path().join("missing.json")),
            Err(NodeError::Config(_))
        ));
    }
}
