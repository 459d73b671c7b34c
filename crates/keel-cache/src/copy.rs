//! File copies that keep write times.
//!
//! Manifests compare write times, so a copy must carry the source's
//! modification time over to the destination.

use crate::retry::{RetryPolicy, file_exists};
use keel_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Worker pool settings for bulk copies.
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Maximum concurrent copies.
    pub workers: usize,
    /// Copies run in parallel only when there are more files than this.
    pub parallel_threshold: usize,
    /// Retries for a failed copy and for the destination check after it.
    pub retry: RetryPolicy,
}

/// Copy one file, creating parent directories and preserving the write time.
pub async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, dst).await?;

    let modified = tokio::fs::metadata(src).await?.modified()?;
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(dst)
        .await?
        .into_std()
        .await;
    file.set_modified(modified)?;
    Ok(())
}

/// Copy with retries. Shares sometimes refuse a write for a few seconds.
pub async fn robust_copy(src: &Path, dst: &Path, retry: &RetryPolicy) -> Result<()> {
    let mut last_error = None;
    for attempt in 0..=retry.attempts {
        if attempt > 0 {
            warn!(path = %dst.display(), attempt, "Retrying copy");
            tokio::time::sleep(tokio::time::Duration::from_millis(retry.delay_ms)).await;
        }
        match copy_file(src, dst).await {
            Ok(()) => {
                return retry
                    .require("copied file", dst, || file_exists(dst))
                    .await;
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Internal(format!("copy of {} never ran", src.display()))))
}

/// Copy `(source, destination)` pairs.
///
/// Above the threshold the copies run on a bounded pool of tasks; below it
/// they run one after another.
pub async fn copy_files(pairs: &[(PathBuf, PathBuf)], options: &CopyOptions) -> Result<()> {
    if options.workers < 2 || pairs.len() <= options.parallel_threshold {
        for (src, dst) in pairs {
            robust_copy(src, dst, &options.retry).await?;
        }
        return Ok(());
    }

    debug!(
        files = pairs.len(),
        workers = options.workers,
        "Copying files in parallel"
    );
    let semaphore = Arc::new(Semaphore::new(options.workers));
    let mut tasks = JoinSet::new();
    for (src, dst) in pairs.iter().cloned() {
        let semaphore = semaphore.clone();
        let retry = options.retry;
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Copy pool closed: {}", e)))?;
            robust_copy(&src, &dst, &retry).await
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Internal(format!("Copy task failed: {}", e)))?;
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
