//! Choosing which nodes a run covers.

use crate::frequency::is_eligible;
use crate::graph::{BuildGraph, NodeId, NodeSet};
use crate::node::full_game_aggregate_name;
use keel_core::{Error, Result, RunOptions};
use tracing::{debug, info};

/// Suffix of node names that only exist to gate other jobs.
pub const PRECONDITION_ONLY_SUFFIX: &str = "_PreconditionOnly";

fn is_placeholder(name: &str) -> bool {
    name.eq_ignore_ascii_case("Noop") || name.ends_with(PRECONDITION_ONLY_SUFFIX)
}

/// Nodes matching `name`: by node name, agent sharing group or aggregate,
/// ignoring case.
pub fn resolve_name(graph: &BuildGraph, name: &str) -> Result<NodeSet> {
    let mut found: NodeSet = graph
        .node_ids()
        .filter(|&id| {
            let node = graph.node(id);
            node.name().eq_ignore_ascii_case(name)
                || (node.is_grouped() && node.agent_sharing_group().eq_ignore_ascii_case(name))
        })
        .collect();
    let mut matched = !found.is_empty();
    for aggregate in graph.aggregates() {
        if aggregate.name.eq_ignore_ascii_case(name) {
            matched = true;
            if let Some(expanded) = graph.expand_aggregate(&aggregate.name) {
                found.extend(expanded);
            }
        }
    }
    if !matched {
        return Err(Error::UnknownNode(name.to_string()));
    }
    Ok(found)
}

/// The nodes a run should consider, in graph order.
///
/// `node` and `game` selections pull in everything they depend on;
/// `only_node` selections do not. With nothing named every node is selected.
/// Returns `None` when the run was asked for placeholder nodes only and has
/// nothing to do.
pub fn select_nodes(graph: &BuildGraph, options: &RunOptions) -> Result<Option<NodeSet>> {
    let mut names: Vec<String> = options.node.clone();
    names.extend(options.game.iter().map(|game| full_game_aggregate_name(game)));

    let requested = names.len() + options.only_node.len();
    let placeholders = names
        .iter()
        .chain(&options.only_node)
        .filter(|name| is_placeholder(name))
        .count();
    if requested > 0 && placeholders == requested {
        info!("Only placeholder nodes requested, nothing to do");
        return Ok(None);
    }

    let mut selected = NodeSet::new();
    for name in names.iter().filter(|name| !is_placeholder(name)) {
        for id in resolve_name(graph, name)? {
            selected.insert(id);
            selected.extend(graph.node(id).all_indirect_dependencies.iter().copied());
        }
    }
    for name in options.only_node.iter().filter(|name| !is_placeholder(name)) {
        selected.extend(resolve_name(graph, name)?);
    }
    if requested == 0 {
        selected = graph.all_nodes();
    }

    let selected: NodeSet = graph.node_ids().filter(|id| selected.contains(id)).collect();
    check_outside_dependencies(graph, &selected)?;
    Ok(Some(selected))
}

/// Dependencies left out of a selection must already be complete.
fn check_outside_dependencies(graph: &BuildGraph, selected: &NodeSet) -> Result<()> {
    for &id in selected {
        for &dep in &graph.node(id).dependencies {
            if !selected.contains(&dep) && !graph.node(dep).complete {
                return Err(Error::DependencyNotComplete {
                    dependency: graph.name(dep).to_string(),
                    node: graph.name(id).to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Drop nodes that do not run on tick `time_index`.
pub fn cull_for_time_index(graph: &BuildGraph, nodes: &mut NodeSet, time_index: u64) {
    if time_index == 0 {
        return;
    }
    nodes.retain(|&id| {
        let node = graph.node(id);
        let keep = is_eligible(node.frequency_shift, time_index);
        if !keep {
            debug!(node = %node.name(), shift = node.frequency_shift, time_index, "Culling node for time index");
        }
        keep
    });
}

/// Drop triggers and everything downstream of one.
pub fn cull_for_preflight(graph: &BuildGraph, nodes: &mut NodeSet, preflight: bool) {
    if !preflight {
        return;
    }
    nodes.retain(|&id| {
        let node = graph.node(id);
        let keep = !node.is_trigger() && node.controlling_triggers.is_empty();
        if !keep {
            debug!(node = %node.name(), "Culling node downstream of trigger in preflight");
        }
        keep
    });
}

/// Mark the trigger being approved, or every trigger when triggers are
/// skipped, so that none of them counts as late.
pub fn resolve_explicit_trigger(
    graph: &mut BuildGraph,
    trigger_node: Option<&str>,
    skip_triggers: bool,
) -> Result<Option<NodeId>> {
    let triggers: Vec<NodeId> = graph
        .node_ids()
        .filter(|&id| graph.node(id).is_trigger())
        .collect();

    match trigger_node.filter(|name| !name.is_empty()) {
        Some(name) => {
            let id = triggers
                .iter()
                .copied()
                .find(|&id| graph.name(id).eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::UnknownTrigger(name.to_string()))?;
            graph.node_mut(id).explicit_trigger = true;
            Ok(Some(id))
        }
        None => {
            if skip_triggers {
                for id in triggers {
                    graph.node_mut(id).explicit_trigger = true;
                }
            }
            Ok(None)
        }
    }
}

/// Incomplete triggers in `ordered`, other than the one being approved.
pub fn find_unfinished_triggers(
    graph: &BuildGraph,
    ordered: &[NodeId],
    explicit_trigger: Option<NodeId>,
    skip_triggers: bool,
) -> Vec<NodeId> {
    if skip_triggers {
        return Vec::new();
    }
    ordered
        .iter()
        .copied()
        .filter(|&id| {
            let node = graph.node(id);
            node.is_trigger() && !node.complete && explicit_trigger != Some(id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NoopAction;
    use crate::graph::tests::{make_node, names};
    use crate::node::{Aggregate, Node};
    use crate::triggers::find_controlling_triggers;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn graph() -> BuildGraph {
        let mut graph = BuildGraph::new();
        graph.add_node(make_node("Editor", &[])).unwrap();
        graph
            .add_node(make_node("Tools", &[]).with_frequency_shift(1))
            .unwrap();
        graph
            .add_node(make_node("CookShooter", &["Editor"]).in_agent_group("Shooter"))
            .unwrap();
        graph
            .add_node(
                make_node("TestShooter", &["CookShooter", "Tools"])
                    .in_agent_group("Shooter")
                    .with_frequency_shift(2),
            )
            .unwrap();
        graph
            .add_node(Node::trigger("Publish", Arc::new(NoopAction)).with_dependencies(["TestShooter"]))
            .unwrap();
        graph.add_node(make_node("Upload", &["Publish"])).unwrap();
        graph
            .add_aggregate(Aggregate::full_game("Shooter", ["CookShooter", "TestShooter"]))
            .unwrap();
        graph.link().unwrap();
        find_controlling_triggers(&mut graph).unwrap();
        graph
    }

    fn select(graph: &BuildGraph, options: RunOptions) -> Vec<String> {
        names(graph, select_nodes(graph, &options).unwrap().unwrap())
    }

    #[test]
    fn test_nothing_named_selects_everything() {
        let graph = graph();
        assert_eq!(select(&graph, RunOptions::default()).len(), 6);
    }

    #[test]
    fn test_node_selection_closes_over_dependencies() {
        let graph = graph();
        let options = RunOptions {
            node: vec!["testshooter".to_string()],
            ..Default::default()
        };
        assert_eq!(
            select(&graph, options),
            vec!["Editor", "Tools", "CookShooter", "TestShooter"]
        );
    }

    #[test]
    fn test_group_and_game_names() {
        let graph = graph();
        let by_group = RunOptions {
            node: vec!["shooter".to_string()],
            ..Default::default()
        };
        let by_game = RunOptions {
            game: vec!["Shooter".to_string()],
            ..Default::default()
        };
        assert_eq!(select(&graph, by_group.clone()), select(&graph, by_game));
        assert_eq!(select(&graph, by_group).len(), 4);
    }

    #[test]
    fn test_unknown_name_fails() {
        let graph = graph();
        let options = RunOptions {
            node: vec!["Nope".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            select_nodes(&graph, &options),
            Err(Error::UnknownNode(name)) if name == "Nope"
        ));
    }

    #[test]
    fn test_placeholders_select_nothing() {
        let graph = graph();
        for name in ["Noop", "Shooter_PreconditionOnly"] {
            let options = RunOptions {
                node: vec![name.to_string()],
                ..Default::default()
            };
            assert!(select_nodes(&graph, &options).unwrap().is_none());
        }
    }

    #[test]
    fn test_only_node_requires_complete_dependencies() {
        let mut graph = graph();
        let options = RunOptions {
            only_node: vec!["CookShooter".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            select_nodes(&graph, &options),
            Err(Error::DependencyNotComplete { dependency, .. }) if dependency == "Editor"
        ));

        let editor = graph.find("Editor").unwrap();
        graph.node_mut(editor).complete = true;
        assert_eq!(select(&graph, options), vec!["CookShooter"]);
    }

    #[test]
    fn test_cull_for_time_index() {
        let graph = graph();
        let mut nodes = graph.all_nodes();
        cull_for_time_index(&graph, &mut nodes, 0);
        assert_eq!(nodes.len(), 6);

        cull_for_time_index(&graph, &mut nodes, 2);
        assert_eq!(
            names(&graph, nodes),
            vec!["Editor", "Tools", "CookShooter", "Publish", "Upload"]
        );
    }

    #[test]
    fn test_cull_for_preflight() {
        let graph = graph();
        let mut nodes = graph.all_nodes();
        cull_for_preflight(&graph, &mut nodes, true);
        assert_eq!(
            names(&graph, nodes),
            vec!["Editor", "Tools", "CookShooter", "TestShooter"]
        );
    }

    #[test]
    fn test_explicit_trigger_and_unfinished_triggers() {
        let mut graph = graph();
        let ordered: Vec<NodeId> = graph.node_ids().collect();
        let publish = graph.find("Publish").unwrap();

        assert_eq!(find_unfinished_triggers(&graph, &ordered, None, false), vec![publish]);
        assert!(find_unfinished_triggers(&graph, &ordered, None, true).is_empty());

        let explicit = resolve_explicit_trigger(&mut graph, Some("publish"), false).unwrap();
        assert_eq!(explicit, Some(publish));
        assert!(graph.node(publish).explicit_trigger);
        assert!(find_unfinished_triggers(&graph, &ordered, explicit, false).is_empty());

        assert!(matches!(
            resolve_explicit_trigger(&mut graph, Some("Upload"), false),
            Err(Error::UnknownTrigger(_))
        ));
    }

    #[test]
    fn test_skip_triggers_marks_every_trigger() {
        let mut graph = graph();
        assert_eq!(resolve_explicit_trigger(&mut graph, None, true).unwrap(), None);
        let publish = graph.find("Publish").unwrap();
        assert!(graph.node(publish).explicit_trigger);
    }
}
