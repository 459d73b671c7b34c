//! Build graph construction and linking.

use crate::node::{Aggregate, Node};
use indexmap::{IndexMap, IndexSet};
use keel_core::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, error};

pub type NodeId = NodeIndex;

/// An ordered set of nodes.
pub type NodeSet = IndexSet<NodeId>;

/// Kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Must finish first. Violations are fatal.
    Dependency,
    /// Runs first when both ends are scheduled together.
    Pseudo,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Dependency => "dependency",
            EdgeKind::Pseudo => "pseudodependency",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node plus everything derived about it during one run.
#[derive(Debug)]
pub struct BuildNode {
    pub node: Node,
    pub dependencies: NodeSet,
    pub pseudo_dependencies: NodeSet,
    /// `dependencies` and `pseudo_dependencies` together.
    pub all_direct_dependencies: NodeSet,
    /// Transitive closure of `all_direct_dependencies`.
    pub all_indirect_dependencies: NodeSet,
    /// Upstream triggers, outermost first.
    pub controlling_triggers: Vec<NodeId>,
    pub frequency_shift: u32,
    pub complete: bool,
    pub explicit_trigger: bool,
    pub failure_recipients: Vec<String>,
    pub add_submitters_to_failure_emails: bool,
}

impl BuildNode {
    fn new(node: Node) -> Self {
        let frequency_shift = node.frequency_shift;
        Self {
            node,
            dependencies: NodeSet::new(),
            pseudo_dependencies: NodeSet::new(),
            all_direct_dependencies: NodeSet::new(),
            all_indirect_dependencies: NodeSet::new(),
            controlling_triggers: Vec::new(),
            frequency_shift,
            complete: false,
            explicit_trigger: false,
            failure_recipients: Vec::new(),
            add_submitters_to_failure_emails: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn is_trigger(&self) -> bool {
        self.node.trigger
    }

    pub fn is_sticky(&self) -> bool {
        self.node.sticky
    }

    pub fn agent_sharing_group(&self) -> &str {
        &self.node.agent_sharing_group
    }

    pub fn is_grouped(&self) -> bool {
        self.node.is_grouped()
    }

    /// Whether `other` is upstream of this node.
    pub fn depends_on(&self, other: NodeId) -> bool {
        self.all_indirect_dependencies.contains(&other)
    }
}

/// The graph of build nodes for one run.
///
/// Nodes and aggregates share one namespace. Edges point from a dependency
/// to its dependent and exist only after [`BuildGraph::link`].
#[derive(Debug, Default)]
pub struct BuildGraph {
    graph: DiGraph<BuildNode, EdgeKind>,
    name_to_index: HashMap<String, NodeId>,
    aggregates: IndexMap<String, Aggregate>,
    linked: bool,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        if self.contains(&node.name) {
            return Err(Error::DuplicateNode(node.name));
        }
        let name = node.name.clone();
        let idx = self.graph.add_node(BuildNode::new(node));
        self.name_to_index.insert(name, idx);
        self.linked = false;
        Ok(idx)
    }

    pub fn add_aggregate(&mut self, aggregate: Aggregate) -> Result<()> {
        if self.contains(&aggregate.name) {
            return Err(Error::DuplicateNode(aggregate.name));
        }
        self.aggregates.insert(aggregate.name.clone(), aggregate);
        self.linked = false;
        Ok(())
    }

    /// Whether a node or aggregate is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name) || self.aggregates.contains_key(name)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.name_to_index.get(name).copied()
    }

    pub fn find_ignore_case(&self, name: &str) -> Option<NodeId> {
        self.find(name).or_else(|| {
            self.node_ids()
                .find(|&id| self.node(id).name().eq_ignore_ascii_case(name))
        })
    }

    pub fn node(&self, id: NodeId) -> &BuildNode {
        &self.graph[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BuildNode {
        &mut self.graph[id]
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.graph[id].name()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.graph.node_weights()
    }

    pub fn all_nodes(&self) -> NodeSet {
        self.node_ids().collect()
    }

    pub fn aggregate(&self, name: &str) -> Option<&Aggregate> {
        self.aggregates.get(name)
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &Aggregate> {
        self.aggregates.values()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub(crate) fn inner(&self) -> &DiGraph<BuildNode, EdgeKind> {
        &self.graph
    }

    /// Drop the declared pseudo-dependencies of `name`. Must run before
    /// linking to have an effect.
    pub fn remove_pseudo_dependencies(&mut self, name: &str) -> bool {
        match self.find(name) {
            Some(id) => {
                self.graph[id].node.pseudo_dependencies.clear();
                true
            }
            None => false,
        }
    }

    /// Controlling trigger chain joined with dots, empty if uncontrolled.
    pub fn dot_name(&self, id: NodeId) -> String {
        self.graph[id]
            .controlling_triggers
            .iter()
            .map(|&t| self.name(t))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Real nodes an aggregate flattens to, or `None` for unknown names.
    pub fn expand_aggregate(&self, name: &str) -> Option<NodeSet> {
        let mut problems = Vec::new();
        let mut visiting = HashSet::new();
        let expanded = self.expand(name, &mut visiting, &mut problems)?;
        problems.is_empty().then_some(expanded)
    }

    fn expand<'a>(
        &'a self,
        name: &'a str,
        visiting: &mut HashSet<&'a str>,
        problems: &mut Vec<String>,
    ) -> Option<NodeSet> {
        if let Some(id) = self.find(name) {
            return Some(NodeSet::from([id]));
        }
        let aggregate = self.aggregates.get(name)?;
        let mut result = NodeSet::new();
        if !visiting.insert(aggregate.name.as_str()) {
            return Some(result);
        }
        for dep in &aggregate.dependencies {
            match self.expand(dep, visiting, problems) {
                Some(found) => result.extend(found),
                None => problems.push(format!(
                    "Node {} is not in the graph. It is a dependency of {}.",
                    dep, aggregate.name
                )),
            }
        }
        visiting.remove(aggregate.name.as_str());
        Some(result)
    }

    /// Resolve every dependency name to nodes, expanding aggregates, and
    /// compute the direct and indirect dependency sets.
    ///
    /// All problems are collected before failing.
    pub fn link(&mut self) -> Result<()> {
        let mut problems = Vec::new();
        let ids: Vec<NodeId> = self.node_ids().collect();

        let mut resolved = Vec::with_capacity(ids.len());
        for &id in &ids {
            let node = &self.graph[id].node;
            let mut dependencies = NodeSet::new();
            let mut pseudo = NodeSet::new();
            for (target, names, kind) in [
                (&mut dependencies, &node.dependencies, EdgeKind::Dependency),
                (&mut pseudo, &node.pseudo_dependencies, EdgeKind::Pseudo),
            ] {
                for dep in names {
                    let mut visiting = HashSet::new();
                    match self.expand(dep, &mut visiting, &mut problems) {
                        Some(found) => target.extend(found),
                        None => problems.push(format!(
                            "Node {} is not in the graph. It is a {} of {}.",
                            dep,
                            kind.as_str(),
                            node.name
                        )),
                    }
                }
            }
            resolved.push((dependencies, pseudo));
        }

        self.graph.clear_edges();
        for (&id, (dependencies, pseudo)) in ids.iter().zip(resolved) {
            for &dep in &dependencies {
                self.graph.add_edge(dep, id, EdgeKind::Dependency);
            }
            for &dep in &pseudo {
                self.graph.add_edge(dep, id, EdgeKind::Pseudo);
            }
            let entry = &mut self.graph[id];
            entry.all_direct_dependencies = dependencies.union(&pseudo).copied().collect();
            entry.dependencies = dependencies;
            entry.pseudo_dependencies = pseudo;
        }

        for &id in &ids {
            let closure = self.closure(id);
            if closure.contains(&id) {
                problems.push(format!("Node {} has a dependency on itself.", self.name(id)));
            }
            self.graph[id].all_indirect_dependencies = closure;
        }

        if !problems.is_empty() {
            for problem in &problems {
                error!("{}", problem);
            }
            return Err(Error::Link {
                count: problems.len(),
                details: problems,
            });
        }

        debug!(
            nodes = self.len(),
            aggregates = self.aggregates.len(),
            edges = self.graph.edge_count(),
            "Linked build graph"
        );
        self.linked = true;
        Ok(())
    }

    fn closure(&self, id: NodeId) -> NodeSet {
        let mut result = NodeSet::new();
        let mut stack: Vec<NodeId> = self.graph[id]
            .all_direct_dependencies
            .iter()
            .rev()
            .copied()
            .collect();
        while let Some(next) = stack.pop() {
            if result.insert(next) {
                stack.extend(self.graph[next].all_direct_dependencies.iter().rev());
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::action::NoopAction;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    pub(crate) fn make_node(name: &str, deps: &[&str]) -> Node {
        Node::new(name, Arc::new(NoopAction)).with_dependencies(deps.iter().copied())
    }

    pub(crate) fn names(graph: &BuildGraph, ids: impl IntoIterator<Item = NodeId>) -> Vec<String> {
        ids.into_iter().map(|id| graph.name(id).to_string()).collect()
    }

    #[test]
    fn test_duplicate_names_share_one_namespace() {
        let mut graph = BuildGraph::new();
        graph.add_node(make_node("Compile", &[])).unwrap();
        assert!(matches!(
            graph.add_node(make_node("Compile", &[])),
            Err(Error::DuplicateNode(name)) if name == "Compile"
        ));
        assert!(matches!(
            graph.add_aggregate(Aggregate::new("Compile", ["Compile"])),
            Err(Error::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_link_chain() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(make_node("A", &[])).unwrap();
        let b = graph.add_node(make_node("B", &["A"])).unwrap();
        let c = graph
            .add_node(make_node("C", &["B"]).with_pseudo_dependencies(["A"]))
            .unwrap();
        graph.link().unwrap();

        assert!(graph.is_linked());
        assert_eq!(names(&graph, graph.node(c).dependencies.clone()), vec!["B"]);
        assert_eq!(
            names(&graph, graph.node(c).pseudo_dependencies.clone()),
            vec!["A"]
        );
        assert_eq!(graph.node(c).all_direct_dependencies.len(), 2);
        assert!(graph.node(c).depends_on(a));
        assert!(graph.node(b).depends_on(a));
        assert!(!graph.node(a).depends_on(c));
        assert_eq!(graph.inner().edge_count(), 3);
    }

    #[test]
    fn test_aggregates_expand_recursively() {
        let mut graph = BuildGraph::new();
        graph.add_node(make_node("Editor", &[])).unwrap();
        graph.add_node(make_node("Tools", &[])).unwrap();
        graph.add_node(make_node("Cook", &[])).unwrap();
        graph
            .add_aggregate(Aggregate::new("Base", ["Editor", "Tools"]))
            .unwrap();
        graph
            .add_aggregate(Aggregate::new("All", ["Base", "Cook", "Editor"]))
            .unwrap();
        let test = graph.add_node(make_node("Test", &["All"])).unwrap();
        graph.link().unwrap();

        assert_eq!(
            names(&graph, graph.node(test).dependencies.clone()),
            vec!["Editor", "Tools", "Cook"]
        );
        assert_eq!(
            names(&graph, graph.expand_aggregate("Base").unwrap()),
            vec!["Editor", "Tools"]
        );
        assert!(graph.expand_aggregate("Missing").is_none());
    }

    #[test]
    fn test_link_reports_every_problem() {
        let mut graph = BuildGraph::new();
        graph
            .add_node(make_node("A", &["Missing"]).with_pseudo_dependencies(["Gone"]))
            .unwrap();
        graph
            .add_aggregate(Aggregate::new("Broken", ["Nowhere"]))
            .unwrap();
        graph.add_node(make_node("B", &["Broken"])).unwrap();

        match graph.link() {
            Err(Error::Link { count, details }) => {
                assert_eq!(count, 3);
                assert_eq!(
                    details,
                    vec![
                        "Node Missing is not in the graph. It is a dependency of A.",
                        "Node Gone is not in the graph. It is a pseudodependency of A.",
                        "Node Nowhere is not in the graph. It is a dependency of Broken.",
                    ]
                );
            }
            other => panic!("expected link error, got {:?}", other),
        }
        assert!(!graph.is_linked());
    }

    #[test]
    fn test_self_dependency_is_reported() {
        let mut graph = BuildGraph::new();
        graph.add_node(make_node("A", &["B"])).unwrap();
        graph.add_node(make_node("B", &["A"])).unwrap();
        match graph.link() {
            Err(Error::Link { details, .. }) => {
                assert_eq!(
                    details,
                    vec![
                        "Node A has a dependency on itself.",
                        "Node B has a dependency on itself.",
                    ]
                );
            }
            other => panic!("expected link error, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_pseudo_dependencies_before_link() {
        let mut graph = BuildGraph::new();
        graph.add_node(make_node("A", &[])).unwrap();
        let b = graph
            .add_node(make_node("B", &[]).with_pseudo_dependencies(["A"]))
            .unwrap();
        assert!(graph.remove_pseudo_dependencies("B"));
        assert!(!graph.remove_pseudo_dependencies("Nope"));
        graph.link().unwrap();
        assert!(graph.node(b).pseudo_dependencies.is_empty());
    }

    #[test]
    fn test_find_ignore_case() {
        let mut graph = BuildGraph::new();
        let id = graph.add_node(make_node("CompileEditor", &[])).unwrap();
        assert_eq!(graph.find_ignore_case("compileeditor"), Some(id));
        assert_eq!(graph.find("compileeditor"), None);
    }
}
