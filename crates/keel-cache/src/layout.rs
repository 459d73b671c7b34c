//! On-disk layout of the local and shared tiers.

use crate::config::StorageConfig;
use crate::manifest::MANIFEST_EXTENSION;
use crate::retry::{dir_exists, dir_writable};
use keel_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// File name of the manifest for `block`.
pub fn manifest_file_name(block: &str) -> String {
    format!("{}.{}", block, MANIFEST_EXTENSION)
}

/// Resolves storage paths. Scope folders are resolved once per process.
pub struct Layout {
    config: StorageConfig,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl Layout {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn local_manifest_dir(&self) -> PathBuf {
        self.config.local_manifest_dir()
    }

    pub fn local_manifest_path(&self, block: &str) -> PathBuf {
        self.local_manifest_dir().join(manifest_file_name(block))
    }

    fn shared_root(&self) -> Result<&Path> {
        self.config
            .shared_root
            .as_deref()
            .ok_or_else(|| Error::NoSharedFolder("no shared root configured".to_string()))
    }

    async fn writable(&self, path: &Path) -> bool {
        self.config
            .retry
            .dir_writable
            .wait_for("writable directory", path, || dir_writable(path))
            .await
    }

    /// Folder of `scope` under the shared root.
    ///
    /// Falls back to the scope with a trailing `Game` removed, then to the
    /// default scope. The default scope folder must be writable.
    pub async fn resolve_scope_dir(&self, scope: Option<&str>) -> Result<PathBuf> {
        let scope = scope.unwrap_or_default();
        if let Some(found) = self.resolved.lock().await.get(scope) {
            return Ok(found.clone());
        }

        let root = self.shared_root()?;
        let mut result = root.join(scope);
        if scope.is_empty() || !self.writable(&result).await {
            let short = strip_game_suffix(scope);
            if let Some(short) = short {
                result = root.join(short);
            }
            if short.is_none() || !self.writable(&result).await {
                result = root.join(&self.config.default_scope);
                if !self.writable(&result).await {
                    return Err(Error::NoSharedFolder(result.display().to_string()));
                }
            }
        }

        debug!(scope, dir = %result.display(), "Resolved shared scope folder");
        self.resolved
            .lock()
            .await
            .insert(scope.to_string(), result.clone());
        Ok(result)
    }

    /// Directory holding the storage blocks of `scope`, created on demand.
    pub async fn shared_storage_dir(&self, scope: Option<&str>) -> Result<PathBuf> {
        let dir = self
            .resolve_scope_dir(scope)
            .await?
            .join(&self.config.shared_subdir);
        if !dir_exists(&dir).await {
            tokio::fs::create_dir_all(&dir).await?;
        }
        if !dir_exists(&dir).await {
            return Err(Error::NoSharedFolder(dir.display().to_string()));
        }
        Ok(dir)
    }

    pub async fn shared_block_dir(&self, block: &str, scope: Option<&str>) -> Result<PathBuf> {
        Ok(self.shared_storage_dir(scope).await?.join(block))
    }

    pub async fn shared_manifest_path(&self, block: &str, scope: Option<&str>) -> Result<PathBuf> {
        Ok(self
            .shared_block_dir(block, scope)
            .await?
            .join(manifest_file_name(block)))
    }

    /// Whether the shared tier can be reached, waiting longer when it is
    /// needed for saving.
    pub async fn has_shared(&self, for_saving: bool) -> bool {
        let Ok(root) = self.shared_root() else {
            return false;
        };
        let dir = root
            .join(&self.config.default_scope)
            .join(&self.config.shared_subdir);
        if for_saving {
            let policy = self.config.retry.shared_available;
            let dir = dir.as_path();
            policy
                .wait_for("shared storage", dir, || async move {
                    self.writable(dir).await
                })
                .await
        } else {
            self.config
                .retry
                .dir_writable
                .wait_for("shared storage", &dir, || dir_exists(&dir))
                .await
        }
    }
}

fn strip_game_suffix(scope: &str) -> Option<&str> {
    let split = scope.len().checked_sub(4)?;
    let (short, suffix) = (scope.get(..split)?, scope.get(split..)?);
    (suffix.eq_ignore_ascii_case("game") && !short.is_empty()).then_some(short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;

    fn layout(shared: &Path) -> Layout {
        Layout::new(
            StorageConfig::new("/local", Some(shared.to_path_buf()))
                .with_retry(RetryConfig::immediate()),
        )
    }

    #[test]
    fn test_strip_game_suffix() {
        assert_eq!(strip_game_suffix("ShooterGame"), Some("Shooter"));
        assert_eq!(strip_game_suffix("Shootergame"), Some("Shooter"));
        assert_eq!(strip_game_suffix("Shooter"), None);
        assert_eq!(strip_game_suffix("ame"), None);
        assert_eq!(strip_game_suffix("Game"), None);
    }

    #[test]
    fn test_local_manifest_path() {
        let layout = Layout::new(StorageConfig::new("/local", None));
        assert_eq!(
            layout.local_manifest_path("Main-12-Compile"),
            PathBuf::from("/local/Saved/TempStorage/Main-12-Compile.TempManifest")
        );
    }

    #[tokio::test]
    async fn test_scope_resolution_falls_back() {
        let shared = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(shared.path().join("Default")).unwrap();
        std::fs::create_dir_all(shared.path().join("Shooter")).unwrap();
        std::fs::create_dir_all(shared.path().join("Racing")).unwrap();
        let layout = layout(shared.path());

        assert_eq!(
            layout.resolve_scope_dir(Some("Racing")).await.unwrap(),
            shared.path().join("Racing")
        );
        assert_eq!(
            layout.resolve_scope_dir(Some("ShooterGame")).await.unwrap(),
            shared.path().join("Shooter")
        );
        assert_eq!(
            layout.resolve_scope_dir(Some("Unknown")).await.unwrap(),
            shared.path().join("Default")
        );
        assert_eq!(
            layout.resolve_scope_dir(None).await.unwrap(),
            shared.path().join("Default")
        );
    }

    #[tokio::test]
    async fn test_missing_default_scope_is_an_error() {
        let shared = tempfile::tempdir().unwrap();
        let layout = layout(shared.path());
        let err = layout.resolve_scope_dir(Some("Game")).await.unwrap_err();
        assert!(matches!(err, Error::NoSharedFolder(_)));
    }

    #[tokio::test]
    async fn test_shared_paths_create_storage_dir() {
        let shared = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(shared.path().join("Default")).unwrap();
        let layout = layout(shared.path());

        let manifest = layout.shared_manifest_path("B", None).await.unwrap();
        assert_eq!(
            manifest,
            shared.path().join("Default/TempStorage/B/B.TempManifest")
        );
        assert!(shared.path().join("Default/TempStorage").is_dir());
        assert!(layout.has_shared(true).await);
    }

    #[tokio::test]
    async fn test_no_shared_root() {
        let layout = Layout::new(
            StorageConfig::new("/local", None).with_retry(RetryConfig::immediate()),
        );
        assert!(!layout.has_shared(false).await);
        assert!(layout.shared_block_dir("B", None).await.is_err());
    }
}
