//! Graphviz export of an ordered plan.

use crate::graph::{BuildGraph, EdgeKind, NodeId};
use keel_core::Result;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

struct ExportNode {
    name: String,
    trigger: bool,
    sticky: bool,
    complete: bool,
}

impl fmt::Display for ExportNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl ExportNode {
    fn attributes(&self) -> String {
        let mut attributes = format!("label = {:?}", self.name);
        if self.trigger {
            attributes.push_str(" shape = diamond");
        } else {
            attributes.push_str(" shape = box");
        }
        if self.sticky {
            attributes.push_str(" style = bold");
        }
        if self.complete {
            attributes.push_str(" color = gray");
        }
        attributes
    }
}

/// Render the nodes of `ordered` and the edges between them as DOT.
/// Pseudo-dependencies are drawn dashed.
pub fn to_dot(graph: &BuildGraph, ordered: &[NodeId]) -> String {
    let mut export: DiGraph<ExportNode, EdgeKind> = DiGraph::new();
    let mut index = HashMap::new();
    for &id in ordered {
        let node = graph.node(id);
        let idx = export.add_node(ExportNode {
            name: node.name().to_string(),
            trigger: node.is_trigger(),
            sticky: node.is_sticky(),
            complete: node.complete,
        });
        index.insert(id, idx);
    }
    for edge in graph.inner().edge_references() {
        if let (Some(&from), Some(&to)) = (index.get(&edge.source()), index.get(&edge.target())) {
            export.add_edge(from, to, *edge.weight());
        }
    }

    let dot = Dot::with_attr_getters(
        &export,
        &[Config::EdgeNoLabel, Config::NodeNoLabel],
        &|_, edge| match edge.weight() {
            EdgeKind::Pseudo => "style = dashed".to_string(),
            EdgeKind::Dependency => String::new(),
        },
        &|_, (_, node)| node.attributes(),
    );
    format!("{}", dot)
}

/// Write the DOT rendering of `ordered` to `path`.
pub fn save_graph(graph: &BuildGraph, ordered: &[NodeId], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, to_dot(graph, ordered))?;
    info!(path = %path.display(), nodes = ordered.len(), "Saved build graph");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::make_node;

    fn graph() -> BuildGraph {
        let mut graph = BuildGraph::new();
        graph.add_node(make_node("Compile", &[]).sticky()).unwrap();
        graph.add_node(make_node("Test", &["Compile"])).unwrap();
        graph
            .add_node(make_node("Docs", &[]).with_pseudo_dependencies(["Compile"]))
            .unwrap();
        graph.link().unwrap();
        graph
    }

    #[test]
    fn test_dot_output() {
        let graph = graph();
        let ordered: Vec<NodeId> = graph.node_ids().collect();
        let dot = to_dot(&graph, &ordered);

        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("label = \"Compile\" shape = box style = bold"));
        assert!(dot.contains("label = \"Test\" shape = box"));
        assert_eq!(dot.matches("->").count(), 2);
        assert_eq!(dot.matches("style = dashed").count(), 1);
    }

    #[test]
    fn test_edges_outside_the_plan_are_dropped() {
        let graph = graph();
        let ordered = vec![graph.find("Test").unwrap(), graph.find("Docs").unwrap()];
        let dot = to_dot(&graph, &ordered);
        assert!(!dot.contains("Compile"));
        assert_eq!(dot.matches("->").count(), 0);
    }

    #[test]
    fn test_save_graph_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graphs/plan.dot");
        let graph = graph();
        let ordered: Vec<NodeId> = graph.node_ids().collect();
        save_graph(&graph, &ordered, &path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("Docs"));
    }
}
