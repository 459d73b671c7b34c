//! Node history across change lists.
//!
//! Every build of a node leaves status markers in storage, one block per
//! change list. Scanning those markers tells when the node last went green
//! and what has failed or is still running since.

use crate::status::{FAILED_SUFFIX, STARTED_SUFFIX, SUCCEEDED_SUFFIX};
use keel_cache::StorageProvider;
use keel_core::Result;
use keel_scheduler::BuildNode;
use serde::Serialize;
use tracing::{debug, warn};

/// Build outcomes of one node, by change list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeHistory {
    pub all_started: Vec<u64>,
    pub all_succeeded: Vec<u64>,
    pub all_failed: Vec<u64>,
    /// Greatest succeeded change list before the current one, 0 if none.
    pub last_succeeded: u64,
    /// Greatest failed change list before the current one, 0 if none.
    pub last_failed: u64,
    /// Failures after the last success.
    pub failed: Vec<u64>,
    /// Starts after the last success that have not failed.
    pub in_progress: Vec<u64>,
}

impl NodeHistory {
    /// Derive the summary fields from the `all_*` lists.
    pub fn new(
        all_started: Vec<u64>,
        all_succeeded: Vec<u64>,
        all_failed: Vec<u64>,
        change_list: u64,
    ) -> Self {
        let before = |list: &[u64]| {
            list.iter()
                .copied()
                .filter(|&cl| cl < change_list)
                .max()
                .unwrap_or(0)
        };
        let mut history = Self {
            last_succeeded: before(&all_succeeded),
            last_failed: before(&all_failed),
            all_started,
            all_succeeded,
            all_failed,
            ..Self::default()
        };
        if !history.all_succeeded.is_empty() {
            let last = history.last_succeeded;
            history.failed = history
                .all_failed
                .iter()
                .copied()
                .filter(|&cl| cl > last)
                .collect();
            history.in_progress = history
                .all_started
                .iter()
                .copied()
                .filter(|&cl| cl > last && !history.failed.contains(&cl))
                .collect();
        }
        history
    }

    pub fn failed_string(&self) -> String {
        join(&self.failed)
    }

    pub fn in_progress_string(&self) -> String {
        join(&self.in_progress)
    }

    /// One line per started change list since the last success, with the
    /// current change list marked.
    pub fn detailed_lines(&self, change_list: u64) -> Vec<String> {
        let mut lines = Vec::new();
        let mut marked = false;
        for &cl in &self.all_started {
            if cl < self.last_succeeded {
                continue;
            }
            if !marked && change_list < cl {
                lines.push(format!("{}   <<<< local sync", change_list));
                marked = true;
            }
            let status = if self.all_failed.contains(&cl) {
                "FAIL"
            } else if self.all_succeeded.contains(&cl) {
                "ok"
            } else {
                "In Process"
            };
            lines.push(format!("{}   {}", cl, status));
        }
        if !marked {
            lines.push(format!("{}   <<<< local sync", change_list));
        }
        lines
    }
}

fn join(list: &[u64]) -> String {
    list.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse and sort the change lists found for one marker kind.
fn change_lists(found: Vec<String>) -> Vec<u64> {
    let mut result: Vec<u64> = found
        .into_iter()
        .filter_map(|s| match s.parse() {
            Ok(cl) => Some(cl),
            Err(_) => {
                warn!(value = %s, "Ignoring non-numeric change list");
                None
            }
        })
        .collect();
    result.sort_unstable();
    result
}

/// History of `node` from the status markers stored for every change list.
///
/// `None` for triggers, without a change list, or when the store name is
/// not derived from the change list.
pub async fn find_node_history(
    storage: &dyn StorageProvider,
    node: &BuildNode,
    change_list: u64,
    store_name: &str,
    local_only: bool,
) -> Result<Option<NodeHistory>> {
    if node.is_trigger() || change_list == 0 {
        return Ok(None);
    }
    let cl = change_list.to_string();
    if !store_name.contains(&cl) {
        return Ok(None);
    }
    let wildcard = format!("{}-{}", store_name.replacen(&cl, "*", 1), node.name());
    let scope = node.node.scope.as_deref();

    let mut lists = Vec::with_capacity(3);
    for suffix in [STARTED_SUFFIX, SUCCEEDED_SUFFIX, FAILED_SUFFIX] {
        let pattern = format!("{}{}", wildcard, suffix);
        let found = storage
            .find_manifests(&pattern, local_only, !local_only, scope)
            .await?;
        lists.push(change_lists(found));
    }
    let all_failed = lists.pop().unwrap_or_default();
    let all_succeeded = lists.pop().unwrap_or_default();
    let all_started = lists.pop().unwrap_or_default();

    let history = NodeHistory::new(all_started, all_succeeded, all_failed, change_list);
    debug!(
        node = %node.name(),
        last_succeeded = history.last_succeeded,
        failed = %history.failed_string(),
        in_progress = %history.in_progress_string(),
        "Found node history"
    );
    Ok(Some(history))
}
