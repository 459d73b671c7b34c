//! Temp storage manifests.
//!
//! A manifest lists every file of one storage block, grouped by directory
//! relative to the block's base folder. Manifests are the only state Keel
//! persists, so every write is read back and compared before it counts.

use crate::file_info::FileInfo;
use crate::policy::ComparePolicy;
use crate::retry::{RetryPolicy, file_exists};
use indexmap::IndexMap;
use keel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// File extension of manifest files.
pub const MANIFEST_EXTENSION: &str = "TempManifest";

/// Directory to file list map, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    directories: IndexMap<String, Vec<FileInfo>>,
}

impl Manifest {
    /// Build a manifest from files on disk.
    ///
    /// Relative paths are taken relative to `base`. Every file must exist
    /// and live under `base`.
    pub async fn create(files: &[PathBuf], base: &Path, retry: &RetryPolicy) -> Result<Self> {
        let mut manifest = Manifest::default();
        for file in files {
            let path = absolute(file, base);
            retry
                .require("file", &path, || file_exists(&path))
                .await?;

            let name = relative_name(&path, base)?;
            let directory = match name.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            };
            let info = FileInfo::from_path(&path, &name).await?;
            manifest.directories.entry(directory).or_default().push(info);
        }
        manifest.check_unique()?;
        manifest.stats("Created manifest");
        Ok(manifest)
    }

    /// Every relative name may appear once, ignoring ASCII case.
    fn check_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for file in self.directories.values().flat_map(|files| files.iter()) {
            if !seen.insert(file.name.to_ascii_lowercase()) {
                return Err(Error::DuplicateManifestEntry(file.name.clone()));
            }
        }
        Ok(())
    }

    pub fn directories(&self) -> &IndexMap<String, Vec<FileInfo>> {
        &self.directories
    }

    pub fn file_count(&self) -> usize {
        self.directories.values().map(Vec::len).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.directories
            .values()
            .flat_map(|files| files.iter())
            .map(|f| f.size)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0 || self.total_size() == 0
    }

    fn stats(&self, description: &str) {
        debug!(
            directories = self.directories.len(),
            files = self.file_count(),
            size = self.total_size(),
            "{}",
            description
        );
    }

    /// Look up an entry by its relative name.
    pub fn find_file(&self, name: &str) -> Option<&FileInfo> {
        let name = name.replace('\\', "/");
        self.directories
            .values()
            .flat_map(|files| files.iter())
            .find(|f| f.name.eq_ignore_ascii_case(&name))
    }

    /// Compare every directory and file, logging each difference.
    pub fn compare(&self, other: &Manifest, policy: &ComparePolicy) -> bool {
        if self.directories.len() != other.directories.len() {
            error!(
                ours = self.directories.len(),
                theirs = other.directories.len(),
                "Directory count mismatch"
            );
            for key in self.directories.keys() {
                if !other.directories.contains_key(key) {
                    error!(directory = %key, "Missing directory");
                }
            }
            for key in other.directories.keys() {
                if !self.directories.contains_key(key) {
                    error!(directory = %key, "Missing other directory");
                }
            }
            return false;
        }

        let mut result = true;
        for (key, files) in &self.directories {
            let Some(other_files) = other.directories.get(key) else {
                error!(directory = %key, "Missing directory");
                return false;
            };
            if files.len() != other_files.len() {
                error!(
                    directory = %key,
                    ours = files.len(),
                    theirs = other_files.len(),
                    "File count mismatch"
                );
                for f in files {
                    info!("Manifest1: {}", f.name);
                }
                for f in other_files {
                    info!("Manifest2: {}", f.name);
                }
                return false;
            }
            for (file, other_file) in files.iter().zip(other_files) {
                if !file.compare(other_file, policy) {
                    result = false;
                }
            }
        }
        result
    }

    /// Load a manifest file. Empty manifests are rejected.
    pub async fn load(path: &Path) -> Result<Self> {
        let unreadable = |message: String| Error::ManifestUnreadable {
            path: path.display().to_string(),
            message,
        };
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        let manifest: Manifest =
            serde_json::from_str(&contents).map_err(|e| unreadable(e.to_string()))?;

        manifest.stats("Loaded manifest");
        if manifest.is_empty() {
            return Err(Error::EmptyManifest("load"));
        }
        manifest.check_unique()?;
        Ok(manifest)
    }

    /// Write the manifest as JSON. Empty manifests are rejected.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if self.is_empty() {
            return Err(Error::EmptyManifest("save"));
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Absolute paths of every file, rebased onto `base`.
    ///
    /// The first file must exist, which catches manifests pointing at a
    /// folder that was wiped.
    pub async fn files(&self, base: &Path, retry: &RetryPolicy) -> Result<Vec<PathBuf>> {
        let files: Vec<PathBuf> = self
            .directories
            .values()
            .flat_map(|files| files.iter())
            .map(|f| base.join(&f.name))
            .collect();

        let Some(first) = files.first() else {
            return Err(Error::EmptyManifest("read files from"));
        };
        retry.require("file", first, || file_exists(first)).await?;
        Ok(files)
    }

    /// Create a manifest for `files` and write it to `path`, verifying the
    /// result at every step.
    ///
    /// The manifest is written to `<path>.temp`, read back and compared,
    /// renamed into place, then read back and compared again.
    pub async fn save_verified(
        files: &[PathBuf],
        base: &Path,
        path: &Path,
        policy: &ComparePolicy,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let saver = Manifest::create(files, base, retry).await?;
        if saver.file_count() != files.len() {
            return Err(Error::ManifestFileCount {
                actual: saver.file_count(),
                expected: files.len(),
            });
        }

        let temp = with_suffix(path, ".temp");
        if file_exists(&temp).await {
            return Err(Error::TempManifestExists(temp.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        saver.save(&temp).await?;

        let tester = Manifest::load(&temp).await?;
        if !saver.compare(&tester, policy) {
            return Err(Error::ManifestMismatch {
                stage: "Temp",
                path: temp.display().to_string(),
            });
        }

        tokio::fs::rename(&temp, path).await?;
        if file_exists(&temp).await {
            return Err(Error::ManifestMismatch {
                stage: "Lingering temp",
                path: temp.display().to_string(),
            });
        }

        let final_tester = Manifest::load(path).await?;
        if !saver.compare(&final_tester, policy) {
            return Err(Error::ManifestMismatch {
                stage: "Final",
                path: path.display().to_string(),
            });
        }

        info!(
            path = %path.display(),
            files = saver.file_count(),
            size = saver.total_size(),
            "Saved manifest"
        );
        Ok(saver)
    }
}

/// Resolve `path` against `base` when it is relative.
pub fn absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Name of `path` relative to `base`, `/` separated.
pub fn relative_name(path: &Path, base: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .map_err(|_| Error::OutsideBaseFolder {
            path: path.display().to_string(),
            base: base.display().to_string(),
        })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return Err(Error::OutsideBaseFolder {
            path: path.display().to_string(),
            base: base.display().to_string(),
        });
    }
    Ok(parts.join("/"))
}

/// Append `suffix` to the file name of `path`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn write(base: &Path, name: &str, contents: &str) -> PathBuf {
        let path = base.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_create_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "Binaries/a.exe", "aaaa").await;
        let b = write(dir.path(), "Binaries/b.dll", "bb").await;
        let c = write(dir.path(), "readme.txt", "c").await;

        let manifest = Manifest::create(&[a, b, c], dir.path(), &RetryPolicy::immediate())
            .await
            .unwrap();

        let keys: Vec<&String> = manifest.directories().keys().collect();
        assert_eq!(keys, vec!["Binaries", ""]);
        assert_eq!(manifest.file_count(), 3);
        assert_eq!(manifest.total_size(), 7);
        assert!(manifest.find_file("binaries/A.EXE").is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_files_outside_base() {
        let base = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let stray = write(other.path(), "stray.txt", "x").await;

        let err = Manifest::create(&[stray], base.path(), &RetryPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutsideBaseFolder { .. }));
    }

    #[tokio::test]
    async fn test_create_requires_existing_files() {
        let base = tempfile::tempdir().unwrap();
        let missing = base.path().join("missing.txt");
        let err = Manifest::create(&[missing], base.path(), &RetryPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_empty_manifest_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::default()
            .save(&dir.path().join("empty.TempManifest"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Attempt to save empty manifest");

        let zero = write(dir.path(), "zero.bin", "").await;
        let manifest = Manifest::create(&[zero], dir.path(), &RetryPolicy::immediate())
            .await
            .unwrap();
        assert!(manifest.is_empty());
    }

    #[tokio::test]
    async fn test_save_verified_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write(dir.path(), "Out/one.txt", "one").await,
            write(dir.path(), "Out/Nested/two.txt", "two").await,
        ];
        let path = dir.path().join("Saved/TempStorage/block.TempManifest");
        let policy = ComparePolicy::strict();

        let saved = Manifest::save_verified(
            &files,
            dir.path(),
            &path,
            &policy,
            &RetryPolicy::immediate(),
        )
        .await
        .unwrap();

        assert!(!with_suffix(&path, ".temp").exists());
        let loaded = Manifest::load(&path).await.unwrap();
        assert!(saved.compare(&loaded, &policy));
        assert_eq!(saved, loaded);

        let rebased = loaded
            .files(dir.path(), &RetryPolicy::immediate())
            .await
            .unwrap();
        assert_eq!(rebased, files);
    }

    #[tokio::test]
    async fn test_save_verified_refuses_stale_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "a.txt", "a").await;
        let path = dir.path().join("block.TempManifest");
        tokio::fs::write(with_suffix(&path, ".temp"), "{}").await.unwrap();

        let err = Manifest::save_verified(
            &[file],
            dir.path(),
            &path,
            &ComparePolicy::strict(),
            &RetryPolicy::immediate(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TempManifestExists(_)));
    }

    #[tokio::test]
    async fn test_compare_checks_every_directory() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write(dir.path(), "A/one.txt", "one").await,
            write(dir.path(), "B/two.txt", "two").await,
        ];
        let retry = RetryPolicy::immediate();
        let policy = ComparePolicy::strict();
        let before = Manifest::create(&files, dir.path(), &retry).await.unwrap();

        write(dir.path(), "B/two.txt", "changed").await;
        let after = Manifest::create(&files, dir.path(), &retry).await.unwrap();

        assert!(!before.compare(&after, &policy));
    }

    #[tokio::test]
    async fn test_create_rejects_repeated_files() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "Binaries/app.exe", "app").await;

        let err = Manifest::create(
            &[app.clone(), PathBuf::from("Binaries/app.exe")],
            dir.path(),
            &RetryPolicy::immediate(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateManifestEntry(name) if name == "Binaries/app.exe"));
    }

    #[tokio::test]
    async fn test_load_rejects_repeated_entries() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "Binaries/app.exe", "app").await;
        let mut manifest = Manifest::create(&[app], dir.path(), &RetryPolicy::immediate())
            .await
            .unwrap();
        let files = manifest.directories.get_mut("Binaries").unwrap();
        files.push(files[0].clone());

        let path = dir.path().join("dup.TempManifest");
        manifest.save(&path).await.unwrap();
        let err = Manifest::load(&path).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateManifestEntry(_)));
    }

    #[tokio::test]
    async fn test_load_reports_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.TempManifest");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = Manifest::load(&path).await.unwrap_err();
        assert!(matches!(err, Error::ManifestUnreadable { .. }));
    }

    #[test]
    fn test_relative_name() {
        let base = Path::new("/work/root");
        assert_eq!(
            relative_name(Path::new("/work/root/a/b.txt"), base).unwrap(),
            "a/b.txt"
        );
        assert!(relative_name(Path::new("/work/other/b.txt"), base).is_err());
        assert!(relative_name(base, base).is_err());
    }
}
