//! Repository templates.
//!
//! A template seeds a freshly created repository before the pool hands it
//! out: either by copying a directory tree or by running a setup function
//! against the repository.

use std::fmt;
use std::path::PathBuf;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::repository::Repository;

/// Setup function run against a new repository.
pub type SetupFn = Box<dyn for<'a> FnOnce(&'a Repository) -> BoxFuture<'a, Result<()>> + Send>;

/// How to seed a new repository.
pub enum Template {
    /// Recursively copy this directory's contents into the repository root.
    Directory(PathBuf),
    /// Run this function with the repository.
    Setup(SetupFn),
}

impl Template {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Template::Directory(path.into())
    }

    /// Wrap a setup function.
    ///
    /// ```rust,no_run
    /// use replica_store::{Template, WriteMode};
    ///
    /// let template = Template::setup(|repo| {
    ///     Box::pin(async move {
    ///         let mut writer = repo.open_write("README", WriteMode::Truncate).await?;
    ///         writer.write(b"seeded").await?;
    ///         writer.commit().await?;
    ///         Ok::<_, replica_store::StoreError>(())
    ///     })
    /// });
    /// ```
    pub fn setup<F>(f: F) -> Self
    where
        F: for<'a> FnOnce(&'a Repository) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        Template::Setup(Box::new(f))
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Template::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            Template::Setup(_) => f.write_str("Setup(..)"),
        }
    }
}
