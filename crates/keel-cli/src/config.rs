//! CLI configuration management.

use crate::commands::GlobalArgs;
use keel_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    /// Graph definition file.
    #[serde(default)]
    pub graph: Option<PathBuf>,
    /// Root of the local workspace.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    /// Root of shared temp storage.
    #[serde(default)]
    pub shared_root: Option<PathBuf>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = directories::ProjectDirs::from("dev", "keel", "keel")
            .ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let path = || (!value.is_empty()).then(|| PathBuf::from(value));
        match key {
            "graph" => self.graph = path(),
            "local_root" => self.local_root = path(),
            "shared_root" => self.shared_root = path(),
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => return Err(format!("Invalid log format: {}", value)),
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }

    /// Engine configuration for this invocation.
    ///
    /// Starts from the engine configuration file when one is given. Flags
    /// win over the stored CLI configuration, which wins over the file.
    pub fn engine_config(
        &self,
        args: &GlobalArgs,
    ) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        let mut config = match &args.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::new(std::env::current_dir()?, None),
        };

        if let Some(root) = args.local_root.as_ref().or(self.local_root.as_ref()) {
            config.storage.local_root = root.clone();
        }
        if let Some(shared) = args.shared_root.as_ref().or(self.shared_root.as_ref()) {
            config.storage.shared_root = Some(shared.clone());
        }
        if let Some(graph) = args.graph.as_ref().or(self.graph.as_ref()) {
            config.graph = graph.clone();
        }
        if args.branch.is_some() {
            config.branch.clone_from(&args.branch);
        }
        Ok(config)
    }

    /// Log format for this invocation.
    pub fn log_format(&self, args: &GlobalArgs) -> LogFormat {
        args.log_format.unwrap_or(self.log_format)
    }
}
