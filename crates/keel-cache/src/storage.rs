//! Two-tier temp storage.
//!
//! Every stored block gets a local manifest describing the files as they
//! sit in the workspace. Unless the store is local only, the files are also
//! copied into a block directory in the shared tier together with a shared
//! manifest. The shared tier is the source of truth; the local manifest only
//! saves a copy when the files are already in place.

use crate::config::StorageConfig;
use crate::copy::copy_files;
use crate::layout::{Layout, manifest_file_name};
use crate::manifest::{MANIFEST_EXTENSION, Manifest, absolute, relative_name, with_suffix};
use crate::provider::{Retrieved, StorageProvider};
use crate::retry::{dir_exists, file_exists};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Filesystem temp storage with a local and a shared tier.
pub struct TempStorage {
    layout: Layout,
    cleaned: Mutex<HashSet<String>>,
}

impl TempStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            layout: Layout::new(config),
            cleaned: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        self.layout.config()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn save_local_manifest(
        &self,
        base: &Path,
        block: &str,
        files: &[PathBuf],
    ) -> Result<Manifest> {
        let config = self.config();
        Manifest::save_verified(
            files,
            base,
            &self.layout.local_manifest_path(block),
            &config.compare,
            &config.retry.file_exists,
        )
        .await
    }

    async fn save_shared_manifest(
        &self,
        block_dir: &Path,
        block: &str,
        files: &[PathBuf],
    ) -> Result<Manifest> {
        let config = self.config();
        Manifest::save_verified(
            files,
            block_dir,
            &block_dir.join(manifest_file_name(block)),
            &config.compare,
            &config.retry.file_exists,
        )
        .await
    }

    pub async fn shared_exists(&self, block: &str, scope: Option<&str>) -> bool {
        match self.layout.shared_manifest_path(block, scope).await {
            Ok(path) => file_exists(&path).await,
            Err(_) => false,
        }
    }

    /// Remove the local manifest of `block`, if any.
    pub async fn delete_local(&self, block: &str) -> Result<()> {
        let path = self.layout.local_manifest_path(block);
        if file_exists(&path).await {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn clean_shared_dir(&self, dir: &Path) -> Result<()> {
        let max_age = chrono::Duration::days(i64::from(self.config().max_age_days));
        let start = Instant::now();
        let mut block_dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                block_dirs.push(entry.path());
            }
        }
        info!(
            dir = %dir.display(),
            count = block_dirs.len(),
            seconds = start.elapsed().as_secs_f64(),
            "Enumerated shared storage blocks"
        );

        for block_dir in block_dirs {
            if !is_expired(&block_dir, max_age).await {
                continue;
            }
            info!(
                dir = %block_dir.display(),
                max_age_days = self.config().max_age_days,
                "Deleting expired shared storage block"
            );
            let start = Instant::now();
            if let Err(e) = tokio::fs::remove_dir_all(&block_dir).await {
                warn!(dir = %block_dir.display(), error = %e, "Failed to delete storage block");
                continue;
            }
            debug!(
                dir = %block_dir.display(),
                seconds = start.elapsed().as_secs_f64(),
                "Deleted storage block"
            );
        }
        Ok(())
    }
}

/// Whether `block_dir` holds a manifest older than `max_age`.
async fn is_expired(block_dir: &Path, max_age: chrono::Duration) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(block_dir).await else {
        return false;
    };
    let now = Utc::now();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        let modified: DateTime<Utc> = modified.into();
        if now - modified > max_age {
            return true;
        }
    }
    false
}

/// Split a wildcard block name into the text before and after its only `*`.
pub fn split_wildcard(pattern: &str) -> Result<(&str, &str)> {
    match pattern.split_once('*') {
        Some((pre, post)) if !post.contains('*') => Ok((pre, post)),
        _ => Err(Error::InvalidWildcard(pattern.to_string())),
    }
}

/// The non-empty text `*` stands for when `name` matches `pre*post`.
fn star_replacement(name: &str, pre: &str, post: &str) -> Option<String> {
    let replacement = name.strip_prefix(pre)?.strip_suffix(post)?;
    (!replacement.is_empty()).then(|| replacement.to_string())
}

fn log_throughput(action: &str, bytes: u64, elapsed: Duration) {
    let seconds = elapsed.as_secs_f64();
    if seconds > 60.0 && bytes > 0 {
        let mb_per_sec = bytes as f64 / (1024.0 * 1024.0) / seconds;
        info!(bytes, seconds, mb_per_sec, "{} shared temp storage", action);
    }
}

#[async_trait]
impl StorageProvider for TempStorage {
    async fn store(
        &self,
        block: &str,
        files: &[PathBuf],
        local_only: bool,
        scope: Option<&str>,
        base: &Path,
    ) -> Result<()> {
        let local = self.save_local_manifest(base, block, files).await?;
        if local_only {
            return Ok(());
        }

        let config = self.config();
        let start = Instant::now();
        let block_dir = self.layout.shared_block_dir(block, scope).await?;
        info!(block, path = %block_dir.display(), "Storing to shared temp storage");
        if dir_exists(&block_dir).await {
            return Err(Error::BlockExists(block_dir.display().to_string()));
        }
        tokio::fs::create_dir_all(&block_dir).await?;

        let mut pairs = Vec::with_capacity(files.len());
        for file in files {
            let src = absolute(file, base);
            config
                .retry
                .file_exists
                .require("file", &src, || file_exists(&src))
                .await?;
            let dst = block_dir.join(relative_name(&src, base)?);
            if file_exists(&dst).await {
                return Err(Error::DestinationExists(dst.display().to_string()));
            }
            pairs.push((src, dst));
        }
        copy_files(&pairs, &config.copy_options()).await?;

        let dest_files: Vec<PathBuf> = pairs.into_iter().map(|(_, dst)| dst).collect();
        let shared = self
            .save_shared_manifest(&block_dir, block, &dest_files)
            .await?;
        if !local.compare(&shared, &config.compare) {
            let manifest = block_dir.join(manifest_file_name(block));
            // Keep it around for inspection, under a name nothing reads.
            if let Err(e) = tokio::fs::rename(&manifest, with_suffix(&manifest, ".broken")).await {
                warn!(path = %manifest.display(), error = %e, "Failed to rename broken manifest");
            }
            return Err(Error::SharedLocalMismatch(block.to_string()));
        }

        log_throughput("Wrote to", shared.total_size(), start.elapsed());
        Ok(())
    }

    async fn retrieve(&self, block: &str, scope: Option<&str>, base: &Path) -> Result<Retrieved> {
        let config = self.config();
        let local_path = self.layout.local_manifest_path(block);
        if file_exists(&local_path).await {
            debug!(path = %local_path.display(), "Found local manifest");
            let local = Manifest::load(&local_path).await?;
            let files = local.files(base, &config.retry.file_exists).await?;
            let on_disk = Manifest::create(&files, base, &config.retry.file_exists).await?;
            if !local.compare(&on_disk, &config.compare) {
                return Err(Error::Tampered(local_path.display().to_string()));
            }
            return Ok(Retrieved {
                files,
                was_local: true,
            });
        }

        let start = Instant::now();
        let block_dir = self.layout.shared_block_dir(block, scope).await?;
        debug!(path = %block_dir.display(), "Attempting to retrieve from shared temp storage");
        if !dir_exists(&block_dir).await {
            return Err(Error::BlockMissing(block_dir.display().to_string()));
        }
        let shared_path = block_dir.join(manifest_file_name(block));
        let found = config
            .retry
            .file_exists
            .wait_for("shared manifest", &shared_path, || file_exists(&shared_path))
            .await;
        if !found {
            return Err(Error::ManifestMissing(shared_path.display().to_string()));
        }

        let shared = Manifest::load(&shared_path).await?;
        let shared_files = shared.files(&block_dir, &config.retry.file_exists).await?;

        let mut pairs = Vec::with_capacity(shared_files.len());
        for src in shared_files {
            let dst = base.join(relative_name(&src, &block_dir)?);
            if file_exists(&dst).await {
                debug!(path = %dst.display(), "Destination exists, overwriting");
                tokio::fs::remove_file(&dst).await?;
            }
            pairs.push((src, dst));
        }
        copy_files(&pairs, &config.copy_options()).await?;

        let dest_files: Vec<PathBuf> = pairs.into_iter().map(|(_, dst)| dst).collect();
        let new_local = self.save_local_manifest(base, block, &dest_files).await?;
        if !new_local.compare(&shared, &config.compare) {
            if let Err(e) = tokio::fs::rename(&local_path, with_suffix(&local_path, ".broken")).await
            {
                warn!(path = %local_path.display(), error = %e, "Failed to rename broken manifest");
            }
            return Err(Error::SharedLocalMismatch(block.to_string()));
        }

        log_throughput("Read from", shared.total_size(), start.elapsed());
        Ok(Retrieved {
            files: dest_files,
            was_local: false,
        })
    }

    async fn exists(&self, block: &str, scope: Option<&str>, local_only: bool) -> bool {
        self.local_exists(block).await || (!local_only && self.shared_exists(block, scope).await)
    }

    async fn local_exists(&self, block: &str) -> bool {
        file_exists(&self.layout.local_manifest_path(block)).await
    }

    async fn find_manifests(
        &self,
        pattern: &str,
        local_only: bool,
        shared_only: bool,
        scope: Option<&str>,
    ) -> Result<Vec<String>> {
        let (pre, post) = split_wildcard(pattern)?;
        let mut found: Vec<String> = Vec::new();

        let local_dir = self.layout.local_manifest_dir();
        if !shared_only && dir_exists(&local_dir).await {
            let manifest_post = format!("{}.{}", post, MANIFEST_EXTENSION);
            let mut entries = tokio::fs::read_dir(&local_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(replacement) = star_replacement(&name, pre, &manifest_post) {
                    debug!(file = %name, "Found local manifest");
                    if !found.contains(&replacement) {
                        found.push(replacement);
                    }
                }
            }
        }

        if !local_only && self.config().shared_root.is_some() {
            match self.layout.shared_storage_dir(scope).await {
                Ok(shared_dir) => match tokio::fs::read_dir(&shared_dir).await {
                    Ok(mut entries) => {
                        while let Some(entry) = entries.next_entry().await? {
                            if !entry.file_type().await?.is_dir() {
                                continue;
                            }
                            let name = entry.file_name().to_string_lossy().into_owned();
                            let Some(replacement) = star_replacement(&name, pre, post) else {
                                continue;
                            };
                            // Names of other blocks that happen to share the prefix.
                            if replacement.contains('-') {
                                continue;
                            }
                            if !found.contains(&replacement) {
                                found.push(replacement);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(dir = %shared_dir.display(), pattern, error = %e, "Unable to list shared storage");
                    }
                },
                Err(e) => warn!(pattern, error = %e, "Unable to resolve shared storage"),
            }
        }

        let mut result = Vec::new();
        for replacement in found {
            let block = pattern.replacen('*', &replacement, 1);
            if self.exists(&block, scope, local_only).await {
                result.push(replacement);
            }
        }
        Ok(result)
    }

    async fn clean_shared(&self, scope: Option<&str>) {
        let key = scope.unwrap_or_default().to_string();
        if !self.cleaned.lock().await.insert(key) {
            return;
        }
        let result = match self.layout.shared_storage_dir(scope).await {
            Ok(dir) => self.clean_shared_dir(&dir).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(scope = scope.unwrap_or_default(), error = %e, "Unable to clean shared storage");
        }
    }

    async fn delete_local_manifests(&self) -> Result<()> {
        let dir = self.layout.local_manifest_dir();
        if dir_exists(&dir).await {
            info!(dir = %dir.display(), "Deleting local manifests");
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn has_shared(&self, for_saving: bool) -> bool {
        self.layout.has_shared(for_saving).await
    }

    fn local_root(&self) -> &Path {
        &self.config().local_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_wildcard() {
        assert_eq!(split_wildcard("Main-*-Compile").unwrap(), ("Main-", "-Compile"));
        assert!(matches!(
            split_wildcard("Main-Compile"),
            Err(Error::InvalidWildcard(_))
        ));
        assert!(split_wildcard("*-*").is_err());
    }

    #[test]
    fn test_star_replacement() {
        assert_eq!(
            star_replacement("Main-120-Compile", "Main-", "-Compile"),
            Some("120".to_string())
        );
        assert_eq!(star_replacement("Main--Compile", "Main-", "-Compile"), None);
        assert_eq!(star_replacement("Other-120-Compile", "Main-", "-Compile"), None);
    }
}
