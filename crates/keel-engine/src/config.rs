//! Engine configuration.

use keel_cache::StorageConfig;
use keel_core::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Graph definition file.
    #[serde(default = "default_graph")]
    pub graph: PathBuf,
    /// Branch name. Overrides the one in the graph definition.
    #[serde(default)]
    pub branch: Option<String>,
    /// Prefix of derived store names.
    #[serde(default = "default_store_prefix")]
    pub store_prefix: String,
    /// Log folder, relative to the local root.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Log files whose tails go into failure reports.
    #[serde(default)]
    pub diagnostic_logs: Vec<PathBuf>,
    /// Lines kept from the end of each diagnostic log.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    /// Where planned job steps are written.
    #[serde(default = "default_job_steps_file")]
    pub job_steps_file: PathBuf,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_graph() -> PathBuf {
    PathBuf::from("keel.yaml")
}

fn default_store_prefix() -> String {
    "Keel".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("Saved/Logs")
}

fn default_log_tail_lines() -> usize {
    100
}

fn default_job_steps_file() -> PathBuf {
    PathBuf::from("Saved/Logs/JobSteps.json")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph: default_graph(),
            branch: None,
            store_prefix: default_store_prefix(),
            log_dir: default_log_dir(),
            diagnostic_logs: vec![],
            log_tail_lines: default_log_tail_lines(),
            job_steps_file: default_job_steps_file(),
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `local_root`, with an optional shared tier.
    pub fn new(local_root: impl Into<PathBuf>, shared_root: Option<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::new(local_root, shared_root),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn local_root(&self) -> &Path {
        &self.storage.local_root
    }

    /// Absolute log folder.
    pub fn log_folder(&self) -> PathBuf {
        self.storage.local_root.join(&self.log_dir)
    }

    /// Graph definition path, resolved against the local root when relative.
    pub fn graph_path(&self) -> PathBuf {
        if self.graph.is_absolute() {
            self.graph.clone()
        } else {
            self.storage.local_root.join(&self.graph)
        }
    }

    pub fn job_steps_path(&self) -> PathBuf {
        self.storage.local_root.join(&self.job_steps_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config: EngineConfig = serde_yaml::from_str(
            "branch: Main\nstorage:\n  local_root: /work\n  shared_root: /mnt/shared\n",
        )
        .unwrap();
        assert_eq!(config.branch.as_deref(), Some("Main"));
        assert_eq!(config.store_prefix, "Keel");
        assert_eq!(config.log_tail_lines, 100);
        assert_eq!(config.graph_path(), PathBuf::from("/work/keel.yaml"));
        assert_eq!(config.log_folder(), PathBuf::from("/work/Saved/Logs"));
        assert_eq!(config.storage.shared_root, Some(PathBuf::from("/mnt/shared")));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "graph: /defs/keel.yaml\nlog_tail_lines: 5\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.graph_path(), PathBuf::from("/defs/keel.yaml"));
        assert_eq!(config.log_tail_lines, 5);
    }
}
