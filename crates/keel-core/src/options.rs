//! Run options.
//!
//! Every option the front end exposes maps onto one field here. The core
//! never parses command lines itself.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options controlling one orchestration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Nodes, agent sharing groups or aggregates to run, with their dependencies.
    pub node: Vec<String>,
    /// Games whose full aggregates should run.
    pub game: Vec<String>,
    /// Nodes to run without pulling in their dependencies.
    pub only_node: Vec<String>,
    /// CI cadence tick. Zero runs everything.
    pub time_index: u64,
    /// Trigger being approved in this invocation.
    pub trigger_node: Option<String>,
    /// Treat every unapproved trigger as already satisfied.
    pub skip_triggers: bool,
    /// Delete all local manifests before running.
    pub clean_local: bool,
    /// Explicit store name. Derived from the branch and change list when absent.
    pub store: Option<String>,
    /// Appended to the store name.
    pub store_suffix: String,
    /// Replace every build action with its fake build.
    pub fake: bool,
    /// Save success records as a build machine would, but only locally.
    pub fake_job_service: bool,
    /// Fail the named node on purpose.
    pub fake_fail: Option<String>,
    /// Print the plan and stop.
    pub list_only: bool,
    /// Include dependency lines in the plan listing.
    pub show_dependencies: bool,
    /// Write the ordered graph as DOT to this path and stop.
    pub save_graph: Option<PathBuf>,
    /// Drop triggers and everything they control.
    pub preflight: bool,
    /// Check that no node overwrote the stored outputs of its dependencies.
    pub stomp_check: bool,
    /// Plan job steps for the external job service instead of executing.
    pub job_setup: bool,
    /// Print the history of this node and stop.
    pub show_history: Option<String>,
    /// Revision the run builds. Zero when unknown.
    pub change_list: u64,
    /// Running on a build machine.
    pub build_machine: bool,
    /// Job step id used to fetch diagnostics for failure records.
    pub job_step_id: Option<String>,
}

impl RunOptions {
    /// Parse a `+` separated list such as `-Node=A+B`.
    pub fn split_list(value: &str) -> Vec<String> {
        value
            .split('+')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Change list rendered for store names, empty when unknown.
    pub fn change_list_string(&self) -> String {
        if self.change_list == 0 {
            String::new()
        } else {
            self.change_list.to_string()
        }
    }

    /// Whether `name` is the node selected for an injected failure.
    pub fn is_fake_fail(&self, name: &str) -> bool {
        self.fake_fail
            .as_deref()
            .is_some_and(|fail| !fail.is_empty() && fail.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(
            RunOptions::split_list("Editor+ Tools +"),
            vec!["Editor".to_string(), "Tools".to_string()]
        );
        assert!(RunOptions::split_list("").is_empty());
    }

    #[test]
    fn test_fake_fail_is_case_insensitive() {
        let options = RunOptions {
            fake_fail: Some("compile".to_string()),
            ..Default::default()
        };
        assert!(options.is_fake_fail("Compile"));
        assert!(!options.is_fake_fail("Cook"));
    }
}
