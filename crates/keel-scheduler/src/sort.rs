//! Tie-break topological sort.

use crate::graph::{BuildGraph, EdgeKind, NodeId, NodeSet};
use indexmap::IndexMap;
use keel_core::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info};

#[derive(Clone, Copy)]
struct Candidate {
    id: NodeId,
    pseudo_ready: bool,
}

/// Order `nodes` so that dependencies come first.
///
/// Among ready nodes the winner has, in order of precedence: the smaller
/// controlling trigger dot name, stickiness, all pseudo-dependencies placed,
/// not being a late trigger, the higher priority, the smaller name.
///
/// Outside a sub-sort each agent sharing group is sorted on its own and then
/// placed as one block.
pub fn topological_sort(
    graph: &BuildGraph,
    nodes: &NodeSet,
    explicit_trigger: Option<NodeId>,
    sub_sort: bool,
    ignore_completion: bool,
) -> Result<Vec<NodeId>> {
    let started = Instant::now();
    let mut to_do = nodes.clone();
    let mut ordered = Vec::with_capacity(nodes.len());

    let mut chains: IndexMap<String, Vec<NodeId>> = IndexMap::new();
    if !sub_sort {
        let mut groups: IndexMap<String, NodeSet> = IndexMap::new();
        for &id in nodes {
            let node = graph.node(id);
            if node.is_grouped() {
                groups
                    .entry(node.agent_sharing_group().to_string())
                    .or_default()
                    .insert(id);
            }
        }
        for (group, members) in groups {
            let chain = topological_sort(graph, &members, explicit_trigger, true, ignore_completion)?;
            check_group_triggers(graph, &group, &chain)?;
            chains.insert(group, chain);
        }
    }
    let grouped = |id: NodeId| {
        if sub_sort {
            None
        } else {
            chains.get(graph.node(id).agent_sharing_group())
        }
    };

    while !to_do.is_empty() {
        let mut group_readiness: HashMap<&str, (bool, bool)> = HashMap::new();
        let mut best: Option<Candidate> = None;

        for &id in &to_do {
            let node = graph.node(id);
            let (ready, pseudo_ready) = match grouped(id) {
                Some(chain) => *group_readiness
                    .entry(node.agent_sharing_group())
                    .or_insert_with(|| group_ready(graph, chain, &to_do)),
                None => (
                    !node.dependencies.iter().any(|dep| to_do.contains(dep)),
                    !node.pseudo_dependencies.iter().any(|dep| to_do.contains(dep)),
                ),
            };
            if !ready {
                continue;
            }
            let candidate = Candidate { id, pseudo_ready };
            let replace = match best {
                None => true,
                Some(current) => {
                    beats(graph, candidate, current, explicit_trigger, ignore_completion)
                }
            };
            if replace {
                best = Some(candidate);
            }
        }

        let Some(best) = best else {
            let remaining = cycle_report(graph, &to_do, &grouped);
            error!("Cycle in build graph, could not resolve:");
            for line in &remaining {
                error!("{}", line);
            }
            return Err(Error::Cycle { remaining });
        };

        match grouped(best.id) {
            Some(chain) => {
                for &member in chain {
                    ordered.push(member);
                    to_do.shift_remove(&member);
                }
            }
            None => {
                ordered.push(best.id);
                to_do.shift_remove(&best.id);
            }
        }
    }

    if !sub_sort {
        info!(
            nodes = ordered.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sorted build graph"
        );
    }
    Ok(ordered)
}

/// Readiness of a whole sharing group: no member may wait on an unplaced
/// node outside the group.
fn group_ready(graph: &BuildGraph, chain: &[NodeId], to_do: &NodeSet) -> (bool, bool) {
    let waits = |deps: &NodeSet| {
        deps.iter()
            .any(|dep| !chain.contains(dep) && to_do.contains(dep))
    };
    let ready = !chain.iter().any(|&m| waits(&graph.node(m).dependencies));
    let pseudo_ready = !chain.iter().any(|&m| waits(&graph.node(m).pseudo_dependencies));
    (ready, pseudo_ready)
}

fn is_late_trigger(
    graph: &BuildGraph,
    id: NodeId,
    explicit_trigger: Option<NodeId>,
    ignore_completion: bool,
) -> bool {
    let node = graph.node(id);
    !ignore_completion && node.is_trigger() && explicit_trigger != Some(id) && !node.complete
}

fn beats(
    graph: &BuildGraph,
    candidate: Candidate,
    best: Candidate,
    explicit_trigger: Option<NodeId>,
    ignore_completion: bool,
) -> bool {
    let (a, b) = (graph.node(candidate.id), graph.node(best.id));

    match graph.dot_name(candidate.id).cmp(&graph.dot_name(best.id)) {
        Ordering::Less => return true,
        Ordering::Greater => return false,
        Ordering::Equal => {}
    }
    if a.is_sticky() != b.is_sticky() {
        return a.is_sticky();
    }
    if candidate.pseudo_ready != best.pseudo_ready {
        return candidate.pseudo_ready;
    }
    let a_late = is_late_trigger(graph, candidate.id, explicit_trigger, ignore_completion);
    let b_late = is_late_trigger(graph, best.id, explicit_trigger, ignore_completion);
    if a_late != b_late {
        return !a_late;
    }
    match a.node.priority.partial_cmp(&b.node.priority) {
        Some(Ordering::Greater) => return true,
        Some(Ordering::Less) => return false,
        _ => {}
    }
    a.name() < b.name()
}

fn check_group_triggers(graph: &BuildGraph, group: &str, chain: &[NodeId]) -> Result<()> {
    let mut dot_names: Vec<String> = chain.iter().map(|&id| graph.dot_name(id)).collect();
    dot_names.sort();
    dot_names.dedup();
    if dot_names.len() <= 1 {
        return Ok(());
    }
    let triggers = dot_names
        .iter()
        .map(|dot| {
            let members: Vec<&str> = chain
                .iter()
                .filter(|&&id| &graph.dot_name(id) == dot)
                .map(|&id| graph.name(id))
                .collect();
            format!("'{}' ({})", dot, members.join("+"))
        })
        .collect::<Vec<_>>()
        .join(", ");
    Err(Error::AgentGroupMultipleTriggers {
        group: group.to_string(),
        triggers,
    })
}

fn cycle_report<'a>(
    graph: &BuildGraph,
    to_do: &NodeSet,
    grouped: &impl Fn(NodeId) -> Option<&'a Vec<NodeId>>,
) -> Vec<String> {
    to_do
        .iter()
        .map(|&id| {
            let node = graph.node(id);
            let mut deps = String::new();
            if let Some(chain) = grouped(id) {
                for &member in chain {
                    for &dep in &graph.node(member).dependencies {
                        if !chain.contains(&dep) && to_do.contains(&dep) {
                            deps.push_str(&format!(
                                "{}[{}->{}] ",
                                graph.name(dep),
                                graph.name(member),
                                node.agent_sharing_group()
                            ));
                        }
                    }
                }
            }
            for &dep in node.dependencies.iter().chain(&node.pseudo_dependencies) {
                if to_do.contains(&dep) {
                    deps.push_str(graph.name(dep));
                    deps.push(' ');
                }
            }
            format!("  {}    deps: {}", node.name(), deps)
        })
        .collect()
}

/// Verify that every dependency in `ordered` comes before its dependent.
///
/// Sticky or complete triggers are skipped. Dependencies missing from the
/// list are not checked.
pub fn check_sort_order(graph: &BuildGraph, ordered: &[NodeId]) -> Result<()> {
    let position: HashMap<NodeId, usize> =
        ordered.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    for (index, &id) in ordered.iter().enumerate() {
        let node = graph.node(id);
        if node.is_trigger() && (node.is_sticky() || node.complete) {
            continue;
        }
        for (deps, kind) in [
            (&node.dependencies, EdgeKind::Dependency),
            (&node.pseudo_dependencies, EdgeKind::Pseudo),
        ] {
            for dep in deps {
                if let Some(&dep_index) = position.get(dep) {
                    if dep_index >= index {
                        return Err(Error::SortOrder {
                            node: node.name().to_string(),
                            dependency: graph.name(*dep).to_string(),
                            kind: kind.as_str(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}
