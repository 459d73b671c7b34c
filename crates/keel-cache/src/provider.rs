//! Storage provider trait.

use async_trait::async_trait;
use keel_core::Result;
use std::path::{Path, PathBuf};

/// Files handed back by a retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    /// Absolute paths of the retrieved files.
    pub files: Vec<PathBuf>,
    /// Whether the local manifest satisfied the request without copying.
    pub was_local: bool,
}

/// Trait for build product storage backends.
///
/// `scope` selects a shared folder (usually a game name); `None` uses the
/// default scope. `base` is the folder the files are stored relative to.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store files under `block`. Writes the local manifest, then the shared
    /// block unless `local_only`.
    async fn store(
        &self,
        block: &str,
        files: &[PathBuf],
        local_only: bool,
        scope: Option<&str>,
        base: &Path,
    ) -> Result<()>;

    /// Retrieve the files of `block` into `base`.
    async fn retrieve(&self, block: &str, scope: Option<&str>, base: &Path) -> Result<Retrieved>;

    /// Whether `block` exists locally, or in the shared tier unless `local_only`.
    async fn exists(&self, block: &str, scope: Option<&str>, local_only: bool) -> bool;

    /// Whether a local manifest exists for `block`.
    async fn local_exists(&self, block: &str) -> bool;

    /// Substrings replacing the single `*` in `pattern` for which a block exists.
    async fn find_manifests(
        &self,
        pattern: &str,
        local_only: bool,
        shared_only: bool,
        scope: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Delete old shared blocks of `scope`. Runs at most once per scope.
    async fn clean_shared(&self, scope: Option<&str>);

    /// Delete every local manifest.
    async fn delete_local_manifests(&self) -> Result<()>;

    /// Whether the shared tier is reachable.
    async fn has_shared(&self, for_saving: bool) -> bool;

    /// Default base folder for stored files.
    fn local_root(&self) -> &Path;
}
