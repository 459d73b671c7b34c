//! Graph definition files.
//!
//! A `keel.yaml` declares the nodes, aggregates and games of one branch.
//! Loading it produces a linked [`BuildGraph`] with controlling triggers,
//! frequencies and failure recipients assigned.

use crate::actions::{CleanSharedStorageAction, ShellAction, TriggerAction};
use indexmap::IndexMap;
use keel_core::{Error, Result};
use keel_scheduler::frequency::compute_frequencies;
use keel_scheduler::node::{DEFAULT_PRIORITY, DEFAULT_TIMEOUT_MINUTES};
use keel_scheduler::{
    Aggregate, BranchOptions, BuildAction, BuildGraph, EmailOptions, ExtensionRegistry,
    NoopAction, Node, find_controlling_triggers,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// The built-in node kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Shell,
    Trigger,
    CleanSharedStorage,
    Noop,
}

/// One declared node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub pseudo_dependencies: Vec<String>,
    #[serde(default)]
    pub agent_sharing_group: String,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub frequency_shift: u32,
    #[serde(default = "default_priority")]
    pub priority: f32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
    #[serde(default)]
    pub memory_gb: u32,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,

    // Shell nodes only.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub products: Vec<PathBuf>,
    #[serde(default)]
    pub stale_outputs: Vec<PathBuf>,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

fn default_priority() -> f32 {
    DEFAULT_PRIORITY
}

fn default_timeout_minutes() -> u32 {
    DEFAULT_TIMEOUT_MINUTES
}

impl NodeDefinition {
    fn action(&self) -> Arc<dyn BuildAction> {
        match self.kind {
            NodeKind::Shell => Arc::new(ShellAction {
                commands: self.commands.clone(),
                products: self.products.clone(),
                stale_outputs: self.stale_outputs.clone(),
                workspace: self.workspace.clone(),
            }),
            NodeKind::Trigger => Arc::new(TriggerAction),
            NodeKind::CleanSharedStorage => Arc::new(CleanSharedStorageAction),
            NodeKind::Noop => Arc::new(NoopAction),
        }
    }

    /// Build the node this definition describes.
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(self.name.clone(), self.action());
        node.trigger = self.kind == NodeKind::Trigger;
        node.dependencies = self.dependencies.clone();
        node.pseudo_dependencies = self.pseudo_dependencies.clone();
        node.agent_sharing_group = self.agent_sharing_group.clone();
        node.sticky = self.sticky;
        node.frequency_shift = self.frequency_shift;
        node.priority = self.priority;
        node.timeout_minutes = self.timeout_minutes;
        node.memory_gb = self.memory_gb;
        node.scope = self.scope.clone();
        node.root = self.root.clone();
        node
    }
}

/// The contents of a graph definition file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,
    /// Game name to the nodes of its full aggregate.
    #[serde(default)]
    pub games: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub branch_options: BranchOptions,
    #[serde(default)]
    pub emails: EmailOptions,
}

/// A graph ready for selection and sorting.
#[derive(Debug)]
pub struct LoadedGraph {
    pub graph: BuildGraph,
    pub branch: String,
    pub options: BranchOptions,
}

impl GraphDefinition {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Other(format!("Failed to read graph definition {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Add every node, aggregate and game, then link and schedule the graph.
    ///
    /// `branch` overrides the branch named in the file.
    pub fn build(&self, registry: &ExtensionRegistry, branch: Option<&str>) -> Result<LoadedGraph> {
        let branch = branch.unwrap_or(&self.branch).to_string();
        let options = registry.branch_options(&branch, self.branch_options.clone());
        let mut graph = BuildGraph::new();

        for definition in &self.nodes {
            if options.is_excluded(&definition.name) {
                info!(node = %definition.name, "Excluding node");
                continue;
            }
            graph.add_node(definition.to_node())?;
        }
        for aggregate in &self.aggregates {
            if options.is_excluded(&aggregate.name) {
                info!(aggregate = %aggregate.name, "Excluding aggregate");
                continue;
            }
            graph.add_aggregate(included(aggregate.clone(), &options))?;
        }
        for (game, members) in &self.games {
            graph.add_aggregate(included(Aggregate::full_game(game, members), &options))?;
        }
        registry.add_nodes(&mut graph, &branch, &options)?;

        for name in &options.nodes_to_remove_pseudo_dependencies {
            if !graph.remove_pseudo_dependencies(name) {
                warn!(node = %name, "Cannot remove pseudo-dependencies of unknown node");
            }
        }

        graph.link()?;
        find_controlling_triggers(&mut graph)?;
        compute_frequencies(&mut graph, registry, &branch, &options.frequency_barriers)?;
        registry.assign_recipients(&mut graph, &self.emails, &branch);

        info!(
            branch = %branch,
            nodes = graph.len(),
            aggregates = graph.aggregates().count(),
            "Loaded build graph"
        );
        Ok(LoadedGraph {
            graph,
            branch,
            options,
        })
    }
}

/// Drop excluded members from an aggregate.
fn included(mut aggregate: Aggregate, options: &BranchOptions) -> Aggregate {
    aggregate.dependencies.retain(|name| !options.is_excluded(name));
    aggregate
}
