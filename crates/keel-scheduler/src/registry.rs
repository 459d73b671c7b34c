//! Extension points registered at startup.

use crate::graph::BuildGraph;
use indexmap::IndexMap;
use keel_core::Result;
use serde::{Deserialize, Serialize};

/// Minutes per CI tick unless a branch overrides it.
pub const DEFAULT_TIME_QUANTUM: u32 = 20;

/// Per-branch adjustments to the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchOptions {
    /// Nodes never added to the graph.
    pub exclude_nodes: Vec<String>,
    /// Nodes whose pseudo-dependencies are dropped before linking.
    pub nodes_to_remove_pseudo_dependencies: Vec<String>,
    /// Upper bound on the frequency shift of everything a node depends on.
    pub frequency_barriers: IndexMap<String, u32>,
    /// Minutes per CI tick.
    pub time_quantum: u32,
}

impl Default for BranchOptions {
    fn default() -> Self {
        Self {
            exclude_nodes: Vec::new(),
            nodes_to_remove_pseudo_dependencies: Vec::new(),
            frequency_barriers: IndexMap::new(),
            time_quantum: DEFAULT_TIME_QUANTUM,
        }
    }
}

impl BranchOptions {
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude_nodes.iter().any(|n| n == name)
    }
}

/// Adds nodes that are not declared in the graph definition.
pub trait NodeAdder: Send + Sync {
    fn add_nodes(&self, graph: &mut BuildGraph, branch: &str, options: &BranchOptions)
    -> Result<()>;
}

/// Adjusts branch options.
pub trait BranchOptionHacker: Send + Sync {
    fn modify_options(&self, options: &mut BranchOptions, branch: &str);
}

/// Adjusts who hears about failures.
pub trait EmailHacker: Send + Sync {
    fn add_emails(&self, _branch: &str, _node: &str, _hint: &str) -> Vec<String> {
        Vec::new()
    }

    fn modify_email(&self, email: &str, _branch: &str, _node: &str) -> Vec<String> {
        vec![email.to_string()]
    }

    /// Return true to stop emailing the people who submitted since the last
    /// success.
    fn veto_emailing_causers(&self, _branch: &str, _node: &str) -> bool {
        false
    }
}

/// Rewrites declared frequency shifts.
pub trait FrequencyHacker: Send + Sync {
    fn node_frequency(&self, branch: &str, node: &str, shift: u32) -> u32;
}

/// Settings for failure email resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailOptions {
    /// Send to this address only.
    pub only_email: Option<String>,
    /// Extra recipients for every node.
    pub add_emails: Vec<String>,
    pub hint: String,
}

/// Recipients for a node and whether submitters are included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipients {
    pub emails: Vec<String>,
    pub include_causers: bool,
}

/// Every registered extension.
#[derive(Default)]
pub struct ExtensionRegistry {
    node_adders: Vec<Box<dyn NodeAdder>>,
    branch_hackers: Vec<Box<dyn BranchOptionHacker>>,
    email_hackers: Vec<Box<dyn EmailHacker>>,
    frequency_hackers: Vec<Box<dyn FrequencyHacker>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node_adder(&mut self, adder: impl NodeAdder + 'static) -> &mut Self {
        self.node_adders.push(Box::new(adder));
        self
    }

    pub fn register_branch_hacker(
        &mut self,
        hacker: impl BranchOptionHacker + 'static,
    ) -> &mut Self {
        self.branch_hackers.push(Box::new(hacker));
        self
    }

    pub fn register_email_hacker(&mut self, hacker: impl EmailHacker + 'static) -> &mut Self {
        self.email_hackers.push(Box::new(hacker));
        self
    }

    pub fn register_frequency_hacker(
        &mut self,
        hacker: impl FrequencyHacker + 'static,
    ) -> &mut Self {
        self.frequency_hackers.push(Box::new(hacker));
        self
    }

    /// Start from `base` and let every branch hacker adjust it in turn.
    pub fn branch_options(&self, branch: &str, base: BranchOptions) -> BranchOptions {
        let mut options = base;
        for hacker in &self.branch_hackers {
            hacker.modify_options(&mut options, branch);
        }
        options
    }

    pub fn add_nodes(
        &self,
        graph: &mut BuildGraph,
        branch: &str,
        options: &BranchOptions,
    ) -> Result<()> {
        for adder in &self.node_adders {
            adder.add_nodes(graph, branch, options)?;
        }
        Ok(())
    }

    /// Pass the shift through every frequency hacker in registration order.
    pub fn hack_frequency(&self, branch: &str, node: &str, shift: u32) -> u32 {
        self.frequency_hackers
            .iter()
            .fold(shift, |shift, hacker| hacker.node_frequency(branch, node, shift))
    }

    pub fn recipients(&self, options: &EmailOptions, branch: &str, node: &str) -> Recipients {
        if let Some(only) = options.only_email.as_deref().filter(|e| !e.is_empty()) {
            return Recipients {
                emails: vec![only.to_string()],
                include_causers: false,
            };
        }

        let mut emails = options.add_emails.clone();
        for hacker in &self.email_hackers {
            emails.extend(hacker.add_emails(branch, node, &options.hint));
        }
        for hacker in &self.email_hackers {
            emails = emails
                .iter()
                .flat_map(|email| hacker.modify_email(email, branch, node))
                .collect();
        }

        Recipients {
            emails,
            include_causers: !self
                .email_hackers
                .iter()
                .any(|hacker| hacker.veto_emailing_causers(branch, node)),
        }
    }

    /// Resolve failure recipients for every node in the graph.
    pub fn assign_recipients(&self, graph: &mut BuildGraph, options: &EmailOptions, branch: &str) {
        let ids: Vec<_> = graph.node_ids().collect();
        for id in ids {
            let recipients = self.recipients(options, branch, graph.name(id));
            let node = graph.node_mut(id);
            node.failure_recipients = recipients.emails;
            node.add_submitters_to_failure_emails = recipients.include_causers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::make_node;
    use pretty_assertions::assert_eq;

    struct TeamEmails;

    impl EmailHacker for TeamEmails {
        fn add_emails(&self, _branch: &str, node: &str, _hint: &str) -> Vec<String> {
            if node.starts_with("Cook") {
                vec!["cooks@example.com".to_string()]
            } else {
                Vec::new()
            }
        }

        fn modify_email(&self, email: &str, branch: &str, _node: &str) -> Vec<String> {
            if branch == "Release" {
                vec![email.to_string(), "release@example.com".to_string()]
            } else {
                vec![email.to_string()]
            }
        }

        fn veto_emailing_causers(&self, branch: &str, _node: &str) -> bool {
            branch == "Release"
        }
    }

    struct Halve;

    impl FrequencyHacker for Halve {
        fn node_frequency(&self, _branch: &str, _node: &str, shift: u32) -> u32 {
            shift / 2
        }
    }

    struct PlusOne;

    impl FrequencyHacker for PlusOne {
        fn node_frequency(&self, _branch: &str, _node: &str, shift: u32) -> u32 {
            shift + 1
        }
    }

    struct NoDocs;

    impl BranchOptionHacker for NoDocs {
        fn modify_options(&self, options: &mut BranchOptions, branch: &str) {
            if branch == "Main" {
                options.exclude_nodes.push("Docs".to_string());
            }
        }
    }

    struct AddPackage;

    impl NodeAdder for AddPackage {
        fn add_nodes(
            &self,
            graph: &mut BuildGraph,
            _branch: &str,
            options: &BranchOptions,
        ) -> Result<()> {
            if !options.is_excluded("Package") {
                graph.add_node(make_node("Package", &[]))?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_branch_options_defaults_and_hackers() {
        let options: BranchOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(options.time_quantum, 20);

        let mut registry = ExtensionRegistry::new();
        registry.register_branch_hacker(NoDocs);
        assert!(registry.branch_options("Main", options.clone()).is_excluded("Docs"));
        assert!(!registry.branch_options("Dev", options).is_excluded("Docs"));
    }

    #[test]
    fn test_frequency_hackers_chain() {
        let mut registry = ExtensionRegistry::new();
        assert_eq!(registry.hack_frequency("Main", "Cook", 4), 4);
        registry
            .register_frequency_hacker(Halve)
            .register_frequency_hacker(PlusOne);
        assert_eq!(registry.hack_frequency("Main", "Cook", 4), 3);
    }

    #[test]
    fn test_node_adders_run() {
        let mut registry = ExtensionRegistry::new();
        registry.register_node_adder(AddPackage);
        let mut graph = BuildGraph::new();
        registry
            .add_nodes(&mut graph, "Main", &BranchOptions::default())
            .unwrap();
        assert!(graph.find("Package").is_some());
    }

    #[test]
    fn test_recipients() {
        let mut registry = ExtensionRegistry::new();
        registry.register_email_hacker(TeamEmails);
        let options = EmailOptions {
            add_emails: vec!["lead@example.com".to_string()],
            ..Default::default()
        };

        let main = registry.recipients(&options, "Main", "CookShooter");
        assert_eq!(main.emails, vec!["lead@example.com", "cooks@example.com"]);
        assert!(main.include_causers);

        let release = registry.recipients(&options, "Release", "Compile");
        assert_eq!(release.emails, vec!["lead@example.com", "release@example.com"]);
        assert!(!release.include_causers);

        let only = EmailOptions {
            only_email: Some("me@example.com".to_string()),
            ..options
        };
        let forced = registry.recipients(&only, "Main", "CookShooter");
        assert_eq!(forced.emails, vec!["me@example.com"]);
        assert!(!forced.include_causers);
    }
}
