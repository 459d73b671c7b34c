//! Bounded retry-with-sleep for network shares.
//!
//! Shares occasionally report files and directories as missing for a while
//! after they were written. Every share check goes through a policy here.

use keel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use tokio::time::{Duration, sleep};
use tracing::info;

/// Number of extra checks after the first one fails, and the pause before each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay_ms: u64) -> Self {
        Self { attempts, delay_ms }
    }

    /// Check once, never wait.
    pub const fn immediate() -> Self {
        Self::new(0, 0)
    }

    /// Run `check` until it returns true or the policy is exhausted.
    pub async fn wait_for<F, Fut>(&self, what: &str, path: &Path, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        if check().await {
            return true;
        }
        for attempt in 1..=self.attempts {
            info!(
                path = %path.display(),
                attempt,
                max_attempts = self.attempts,
                "Retrying {}", what
            );
            sleep(Duration::from_millis(self.delay_ms)).await;
            if check().await {
                return true;
            }
        }
        false
    }

    /// Like [`wait_for`](Self::wait_for) but fails with [`Error::Unavailable`].
    pub async fn require<F, Fut>(&self, what: &'static str, path: &Path, check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        if self.wait_for(what, path, check).await {
            Ok(())
        } else {
            Err(Error::Unavailable {
                what,
                path: path.display().to_string(),
                attempts: self.attempts + 1,
            })
        }
    }
}

/// Retry budgets for each kind of share check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_file_exists")]
    pub file_exists: RetryPolicy,
    #[serde(default = "default_dir_writable")]
    pub dir_writable: RetryPolicy,
    #[serde(default = "default_copy")]
    pub copy: RetryPolicy,
    #[serde(default = "default_shared_available")]
    pub shared_available: RetryPolicy,
}

fn default_file_exists() -> RetryPolicy {
    RetryPolicy::new(60, 10_000)
}

fn default_dir_writable() -> RetryPolicy {
    RetryPolicy::new(60, 1_000)
}

fn default_copy() -> RetryPolicy {
    RetryPolicy::new(60, 1_000)
}

fn default_shared_available() -> RetryPolicy {
    RetryPolicy::new(24, 5_000)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            file_exists: default_file_exists(),
            dir_writable: default_dir_writable(),
            copy: default_copy(),
            shared_available: default_shared_available(),
        }
    }
}

impl RetryConfig {
    /// No retries anywhere. Used for local-only setups and tests.
    pub fn immediate() -> Self {
        Self {
            file_exists: RetryPolicy::immediate(),
            dir_writable: RetryPolicy::immediate(),
            copy: RetryPolicy::immediate(),
            shared_available: RetryPolicy::immediate(),
        }
    }
}

pub async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

pub async fn dir_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub async fn dir_writable(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_for_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, 1);
        let counter = calls.clone();
        let found = policy
            .wait_for("check", Path::new("/nowhere"), move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            })
            .await;
        assert!(found);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_require_reports_attempts() {
        let policy = RetryPolicy::new(2, 1);
        let err = policy
            .require("file", Path::new("/nowhere"), || async { false })
            .await
            .unwrap_err();
        match err {
            Error::Unavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_path_checks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, b"a").await.unwrap();

        assert!(file_exists(&file).await);
        assert!(!file_exists(dir.path()).await);
        assert!(dir_exists(dir.path()).await);
        assert!(dir_writable(dir.path()).await);
        assert!(!dir_writable(&file).await);
    }
}
