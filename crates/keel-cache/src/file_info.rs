//! Manifest file entries.

use crate::policy::{ComparePolicy, Leniency};
use chrono::{DateTime, Utc};
use keel_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info, warn};

/// One file recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the manifest base, `/` separated.
    pub name: String,
    /// Last write time.
    pub timestamp: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

impl FileInfo {
    /// Read size and write time of `path`, recording it under `name`.
    pub async fn from_path(path: &Path, name: &str) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let timestamp: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            name: name.replace('\\', "/"),
            timestamp,
            size: metadata.len(),
        })
    }

    /// Compare against another entry, logging every mismatch.
    ///
    /// Names compare case-insensitively. Timestamps must be within the
    /// policy tolerance unless the name may differ; sizes must match unless
    /// the name is on the ok-to-differ list.
    pub fn compare(&self, other: &FileInfo, policy: &ComparePolicy) -> bool {
        if !self.name.eq_ignore_ascii_case(&other.name) {
            error!(name = %self.name, other = %other.name, "File name mismatch");
            return false;
        }

        let leniency = policy.leniency(&self.name);
        let mut ok = true;

        let delta_ms = (self.timestamp - other.timestamp).num_milliseconds();
        if !policy.within_tolerance(delta_ms) {
            log_mismatch(
                leniency,
                &format!(
                    "File date mismatch {} {} {} {}",
                    self.name, self.timestamp, other.name, other.timestamp
                ),
            );
            ok = leniency.timestamp_may_differ();
        }

        if self.size != other.size {
            log_mismatch(
                leniency,
                &format!(
                    "File size mismatch {} {} {} {}",
                    self.name, self.size, other.name, other.size
                ),
            );
            ok = leniency.size_may_differ();
        }

        ok
    }
}

fn log_mismatch(leniency: Leniency, message: &str) {
    if leniency.silent {
        info!("{}", message);
    } else if leniency.ok_to_differ {
        warn!("{}", message);
    } else {
        error!("{}", message);
    }
}
