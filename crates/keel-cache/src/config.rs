//! Temp storage configuration.

use crate::copy::CopyOptions;
use crate::policy::ComparePolicy;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where temp storage lives and how carefully it is checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the local workspace. Local manifests and default base
    /// folders live under it.
    pub local_root: PathBuf,
    /// Local manifest directory, relative to `local_root`.
    #[serde(default = "default_local_manifest_dir")]
    pub local_manifest_dir: PathBuf,
    /// Root of the shared tier. Without one every store is local only.
    #[serde(default)]
    pub shared_root: Option<PathBuf>,
    /// Directory under each scope folder holding the storage blocks.
    #[serde(default = "default_shared_subdir")]
    pub shared_subdir: String,
    /// Scope folder used when a scope has no writable folder of its own.
    #[serde(default = "default_scope")]
    pub default_scope: String,
    #[serde(default)]
    pub compare: ComparePolicy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_copy_workers")]
    pub copy_workers: usize,
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
    /// Blocks older than this are deleted by shared cleanup.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_local_manifest_dir() -> PathBuf {
    PathBuf::from("Saved/TempStorage")
}

fn default_shared_subdir() -> String {
    "TempStorage".to_string()
}

fn default_scope() -> String {
    "Default".to_string()
}

fn default_copy_workers() -> usize {
    8
}

fn default_parallel_threshold() -> usize {
    4
}

fn default_max_age_days() -> u32 {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("."), None)
    }
}

impl StorageConfig {
    pub fn new(local_root: impl Into<PathBuf>, shared_root: Option<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            local_manifest_dir: default_local_manifest_dir(),
            shared_root,
            shared_subdir: default_shared_subdir(),
            default_scope: default_scope(),
            compare: ComparePolicy::default(),
            retry: RetryConfig::default(),
            copy_workers: default_copy_workers(),
            parallel_threshold: default_parallel_threshold(),
            max_age_days: default_max_age_days(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compare(mut self, compare: ComparePolicy) -> Self {
        self.compare = compare;
        self
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> keel_core::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn local_manifest_dir(&self) -> PathBuf {
        self.local_root.join(&self.local_manifest_dir)
    }

    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            workers: self.copy_workers,
            parallel_threshold: self.parallel_threshold,
            retry: self.retry.copy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_defaults() {
        let config: StorageConfig = serde_yaml::from_str("local_root: /work\n").unwrap();
        assert_eq!(config.local_root, PathBuf::from("/work"));
        assert_eq!(
            config.local_manifest_dir(),
            PathBuf::from("/work/Saved/TempStorage")
        );
        assert_eq!(config.shared_root, None);
        assert_eq!(config.shared_subdir, "TempStorage");
        assert_eq!(config.default_scope, "Default");
        assert_eq!(config.copy_workers, 8);
        assert_eq!(config.parallel_threshold, 4);
        assert_eq!(config.max_age_days, 2);
        assert_eq!(config.retry.file_exists.attempts, 60);
        assert_eq!(config.retry.shared_available.delay_ms, 5_000);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
local_root: /work
shared_root: /mnt/share
default_scope: Engine
retry:
  copy:
    attempts: 3
    delay_ms: 10
"#;
        let config: StorageConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.shared_root, Some(PathBuf::from("/mnt/share")));
        assert_eq!(config.default_scope, "Engine");
        assert_eq!(config.retry.copy.attempts, 3);
        assert_eq!(config.retry.file_exists.attempts, 60);
    }
}
