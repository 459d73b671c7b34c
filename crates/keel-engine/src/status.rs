//! Status markers and failure reports.

use crate::history::NodeHistory;
use async_trait::async_trait;
use keel_cache::StorageProvider;
use keel_core::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const STARTED_SUFFIX: &str = "_Started";
pub const SUCCEEDED_SUFFIX: &str = "_Succeeded";
pub const FAILED_SUFFIX: &str = "_Failed";

/// File name of the report written when a node fails.
pub const FAILURE_REPORT: &str = "LogTailsAndChanges.log";

/// Source of diagnostics for a failed job step.
#[async_trait]
pub trait StepDiagnostics: Send + Sync {
    /// Diagnostics recorded for `job_step_id`, if any.
    async fn diagnostics(&self, job_step_id: &str) -> Option<String>;
}

/// Diagnostics made of the last lines of a set of log files.
#[derive(Debug, Clone)]
pub struct LogTailDiagnostics {
    logs: Vec<PathBuf>,
    lines: usize,
}

impl LogTailDiagnostics {
    pub fn new(logs: Vec<PathBuf>, lines: usize) -> Self {
        Self { logs, lines }
    }

    /// Tails of every readable log, each under a header.
    pub async fn tails(&self) -> String {
        let mut out = String::new();
        for log in &self.logs {
            match tokio::fs::read_to_string(log).await {
                Ok(contents) => {
                    out.push_str(&format!(
                        "********************************* Log file {}\n\n",
                        log.display()
                    ));
                    out.push_str(&tail(&contents, self.lines));
                    out.push_str("\n\n\n");
                }
                Err(e) => warn!(path = %log.display(), error = %e, "Unable to read log for diagnostics"),
            }
        }
        out
    }
}

#[async_trait]
impl StepDiagnostics for LogTailDiagnostics {
    async fn diagnostics(&self, job_step_id: &str) -> Option<String> {
        let tails = self.tails().await;
        if tails.is_empty() {
            None
        } else {
            Some(format!("Job step {}\n\n{}", job_step_id, tails))
        }
    }
}

/// The last `lines` lines of `contents`.
pub fn tail(contents: &str, lines: usize) -> String {
    let all: Vec<&str> = contents.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Path of the marker file for `node` and `suffix` under `log_folder`.
pub fn status_file(log_folder: &Path, node: &str, suffix: &str) -> PathBuf {
    log_folder.join(format!("{}{}.log", node, suffix))
}

/// Where and how status markers are stored.
#[derive(Clone, Copy)]
pub struct StatusStore<'a> {
    pub storage: &'a dyn StorageProvider,
    /// Folder the marker files are written to. Must sit under `base`.
    pub log_folder: &'a Path,
    pub base: &'a Path,
    pub local_only: bool,
}

impl StatusStore<'_> {
    /// Record that `node` reached the state named by `suffix`.
    ///
    /// The marker is a one-file block named `{block}{suffix}`. Its contents
    /// are `diagnostics` when given.
    pub async fn save_status(
        &self,
        node: &str,
        suffix: &str,
        block: &str,
        scope: Option<&str>,
        diagnostics: Option<&str>,
    ) -> Result<()> {
        let path = status_file(self.log_folder, node, suffix);
        tokio::fs::create_dir_all(self.log_folder).await?;
        let contents = match diagnostics {
            Some(text) => text.to_string(),
            None => format!("Just a status record: {}", suffix),
        };
        tokio::fs::write(&path, contents).await?;

        let marker = format!("{}{}", block, suffix);
        self.storage
            .store(&marker, &[path], self.local_only, scope, self.base)
            .await?;
        info!(node, block = %marker, "Saved status");
        Ok(())
    }
}

/// Everything that goes into a failure report.
pub struct FailureReport<'a> {
    pub node: &'a str,
    pub error: &'a str,
    pub history: Option<&'a NodeHistory>,
    pub change_list: u64,
    pub log_tails: &'a str,
}

impl FailureReport<'_> {
    pub fn render(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let mut out = format!(
            "Node {} failed on {} at {}\n{}\n\n",
            self.node,
            host,
            chrono::Utc::now().to_rfc3339(),
            self.error
        );
        if let Some(history) = self.history {
            out.push_str("Changes since last green *********************************\n\n");
            for line in history.detailed_lines(self.change_list) {
                out.push_str("         ");
                out.push_str(&line);
                out.push('\n');
            }
            out.push_str("\n\n");
        }
        out.push_str("********************************* Main log file\n\n");
        out.push_str(self.log_tails);
        out
    }

    /// Write the report to `log_folder`.
    pub async fn write(&self, log_folder: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(log_folder).await?;
        let path = log_folder.join(FAILURE_REPORT);
        tokio::fs::write(&path, self.render()).await?;
        info!(node = %self.node, path = %path.display(), "Wrote failure report");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_cache::{StorageConfig, TempStorage};

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
        assert_eq!(tail("", 5), "");
    }

    #[tokio::test]
    async fn test_save_status_stores_marker_block() {
        let root = tempfile::tempdir().unwrap();
        let storage = TempStorage::new(StorageConfig::new(root.path(), None));
        let log_folder = root.path().join("Saved/Logs");
        let status = StatusStore {
            storage: &storage,
            log_folder: &log_folder,
            base: root.path(),
            local_only: true,
        };

        status
            .save_status("Compile", STARTED_SUFFIX, "Run-Compile", None, None)
            .await
            .unwrap();

        let marker = status_file(&log_folder, "Compile", STARTED_SUFFIX);
        assert_eq!(
            std::fs::read_to_string(&marker).unwrap(),
            "Just a status record: _Started"
        );
        assert!(storage.local_exists("Run-Compile_Started").await);
    }

    #[tokio::test]
    async fn test_diagnostics_replace_status_text() {
        let root = tempfile::tempdir().unwrap();
        let log = root.path().join("build.log");
        std::fs::write(&log, "line 1\nline 2\nerror: boom\n").unwrap();
        let diagnostics = LogTailDiagnostics::new(vec![log, root.path().join("missing.log")], 1);

        let text = diagnostics.diagnostics("42").await.unwrap();
        assert!(text.starts_with("Job step 42"));
        assert!(text.contains("error: boom"));
        assert!(!text.contains("line 2"));

        let storage = TempStorage::new(StorageConfig::new(root.path(), None));
        let log_folder = root.path().join("Saved/Logs");
        let status = StatusStore {
            storage: &storage,
            log_folder: &log_folder,
            base: root.path(),
            local_only: true,
        };
        status
            .save_status("Compile", FAILED_SUFFIX, "Run-Compile", None, Some(&text))
            .await
            .unwrap();
        let marker = status_file(&log_folder, "Compile", FAILED_SUFFIX);
        assert_eq!(std::fs::read_to_string(marker).unwrap(), text);
    }

    #[tokio::test]
    async fn test_failure_report_includes_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = NodeHistory::new(vec![100, 110], vec![100], vec![], 110);
        let report = FailureReport {
            node: "Compile",
            error: "Node Compile failed: exit 1",
            history: Some(&history),
            change_list: 110,
            log_tails: "tail of the log",
        };

        let path = report.write(dir.path()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), FAILURE_REPORT);
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("Node Compile failed on "));
        assert!(text.contains("Changes since last green"));
        assert!(text.contains("100   ok"));
        assert!(text.ends_with("tail of the log"));
    }
}
