//! Name resolution inside a repository.
//!
//! Names are resolved lexically against the repository root. A `..` that
//! would climb above the root is an error, never clamped. This is the
//! containment boundary for everything a peer or API caller can name.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::fs::STAGING_DIR;

/// A normalized path relative to a repository root.
///
/// The empty path is the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPath {
    components: Vec<String>,
}

impl RepoPath {
    /// The repository root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Resolve a caller-supplied name.
    ///
    /// Leading `/` and `.` components are ignored, so `/a/./b` and `a/b`
    /// name the same entry. The backend staging directory is reserved at
    /// the root and never resolves.
    pub fn resolve(name: &str) -> Result<Self> {
        let mut components: Vec<String> = Vec::new();
        for component in Path::new(name).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if components.pop().is_none() {
                        return Err(StoreError::PathEscape(name.to_string()));
                    }
                }
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| StoreError::PathEscape(name.to_string()))?;
                    if components.is_empty() && part == STAGING_DIR {
                        return Err(StoreError::PathEscape(name.to_string()));
                    }
                    components.push(part.to_string());
                }
                Component::Prefix(_) => return Err(StoreError::PathEscape(name.to_string())),
            }
        }
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Parent path; `None` for the root.
    pub fn parent(&self) -> Option<RepoPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    /// All proper ancestors, nearest to the root first, excluding the root.
    pub fn ancestors(&self) -> Vec<RepoPath> {
        (1..self.components.len())
            .map(|n| Self {
                components: self.components[..n].to_vec(),
            })
            .collect()
    }

    /// First component of the root-level entry containing this path.
    pub fn first(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }

    /// `/`-joined key used by the log backend index.
    pub fn key(&self) -> String {
        self.components.join("/")
    }

    /// Absolute filesystem path under `root`.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(&self.components);
        path
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_resolve_normalizes() {
        let path = RepoPath::resolve("/a/./b/../c").unwrap();
        assert_eq!(path.key(), "a/c");
        assert_eq!(path.to_string(), "/a/c");
    }

    #[test]
    fn test_resolve_root() {
        assert!(RepoPath::resolve("/").unwrap().is_root());
        assert!(RepoPath::resolve("").unwrap().is_root());
        assert!(RepoPath::resolve("a/..").unwrap().is_root());
    }

    #[test]
    fn test_escape_rejected() {
        for name in ["..", "../x", "a/../../x", "/../../etc/passwd", "a/b/../../../c"] {
            assert!(
                matches!(RepoPath::resolve(name), Err(StoreError::PathEscape(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_staging_dir_reserved_at_root() {
        for name in [".replica-staging", "/.replica-staging/x", "a/../.replica-staging/y"] {
            assert!(
                matches!(RepoPath::resolve(name), Err(StoreError::PathEscape(_))),
                "{name} should be rejected"
            );
        }
        let nested = RepoPath::resolve("a/.replica-staging").unwrap();
        assert_eq!(nested.first(), Some("a"));
    }

    #[test]
    fn test_fs_path_stays_under_root() {
        let root = Path::new("/data/repo");
        let path = RepoPath::resolve("x/../y/z").unwrap();
        assert_eq!(path.to_fs_path(root), PathBuf::from("/data/repo/y/z"));
    }

    #[test]
    fn test_ancestors() {
        let path = RepoPath::resolve("a/b/c").unwrap();
        let keys: Vec<String> = path.ancestors().iter().map(RepoPath::key).collect();
        assert_eq!(keys, vec!["a", "a/b"]);
        assert_eq!(path.parent().unwrap().key(), "a/b");
    }

    proptest! {
        #[test]
        fn test_descending_then_climbing_stays_contained(
            parts in prop::collection::vec("[a-z]{1,8}", 1..6),
            up in 0usize..8,
        ) {
            let name = format!("{}/{}", parts.join("/"), vec![".."; up].join("/"));
            let resolved = RepoPath::resolve(&name);
            if up > parts.len() {
                prop_assert!(matches!(resolved, Err(StoreError::PathEscape(_))));
            } else {
                let path = resolved.unwrap();
                prop_assert_eq!(path.key(), parts[..parts.len() - up].join("/"));
                prop_assert!(path.to_fs_path(Path::new("/r")).starts_with("/r"));
            }
        }
    }
}
