//! Build nodes and aggregates.

use crate::action::BuildAction;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_PRIORITY: f32 = 100.0;
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 90;

/// Prefix of the aggregate created for every game.
pub const FULL_GAME_AGGREGATE_PREFIX: &str = "FullGameAggregate_";

/// A unit of work in the build graph.
///
/// Scheduling attributes are plain data; what the node actually does lives
/// behind its [`BuildAction`].
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub dependencies: Vec<String>,
    pub pseudo_dependencies: Vec<String>,
    /// Nodes with the same non-empty group run back to back on one agent.
    pub agent_sharing_group: String,
    /// Sticky nodes run first, on the agent that set up the job.
    pub sticky: bool,
    /// Declared CI frequency; the node runs every `1 << shift` ticks.
    pub frequency_shift: u32,
    pub priority: f32,
    pub timeout_minutes: u32,
    pub memory_gb: u32,
    pub trigger: bool,
    /// Storage scope, usually a game name.
    pub scope: Option<String>,
    /// Base folder for stored products. Defaults to the storage root.
    pub root: Option<PathBuf>,
    pub action: Arc<dyn BuildAction>,
}

impl Node {
    pub fn new(name: impl Into<String>, action: Arc<dyn BuildAction>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            pseudo_dependencies: Vec::new(),
            agent_sharing_group: String::new(),
            sticky: false,
            frequency_shift: 0,
            priority: DEFAULT_PRIORITY,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            memory_gb: 0,
            trigger: false,
            scope: None,
            root: None,
            action,
        }
    }

    /// A trigger node: a manual gate that controls everything downstream.
    pub fn trigger(name: impl Into<String>, action: Arc<dyn BuildAction>) -> Self {
        Self {
            trigger: true,
            ..Self::new(name, action)
        }
    }

    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_pseudo_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pseudo_dependencies
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn in_agent_group(mut self, group: impl Into<String>) -> Self {
        self.agent_sharing_group = group.into();
        self
    }

    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }

    pub fn with_frequency_shift(mut self, shift: u32) -> Self {
        self.frequency_shift = shift;
        self
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn is_grouped(&self) -> bool {
        !self.agent_sharing_group.is_empty()
    }
}

/// A named set of dependencies with no work of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub name: String,
    pub dependencies: Vec<String>,
}

impl Aggregate {
    pub fn new<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }

    /// The aggregate collecting every node of `game`.
    pub fn full_game<I, S>(game: &str, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(full_game_aggregate_name(game), dependencies)
    }
}

pub fn full_game_aggregate_name(game: &str) -> String {
    format!("{}{}", FULL_GAME_AGGREGATE_PREFIX, game)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NoopAction;

    #[test]
    fn test_node_defaults() {
        let node = Node::new("Compile", Arc::new(NoopAction));
        assert_eq!(node.priority, 100.0);
        assert_eq!(node.timeout_minutes, 90);
        assert_eq!(node.memory_gb, 0);
        assert!(!node.trigger);
        assert!(!node.is_grouped());
    }

    #[test]
    fn test_builder_attributes() {
        let node = Node::trigger("Ship", Arc::new(NoopAction))
            .with_dependencies(["Cook", "Test"])
            .with_pseudo_dependencies(["Docs"])
            .in_agent_group("Shipping")
            .with_scope("ShooterGame");
        assert!(node.trigger);
        assert_eq!(node.dependencies, vec!["Cook", "Test"]);
        assert_eq!(node.pseudo_dependencies, vec!["Docs"]);
        assert!(node.is_grouped());
        assert_eq!(node.scope.as_deref(), Some("ShooterGame"));
    }

    #[test]
    fn test_full_game_aggregate() {
        let aggregate = Aggregate::full_game("Shooter", ["Cook_Shooter"]);
        assert_eq!(aggregate.name, "FullGameAggregate_Shooter");
        assert_eq!(aggregate.dependencies, vec!["Cook_Shooter"]);
    }
}
