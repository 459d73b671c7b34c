//! CI frequency shifts and tick eligibility.

use crate::graph::{BuildGraph, NodeId};
use crate::registry::ExtensionRegistry;
use indexmap::IndexMap;
use keel_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Whether a node with `shift` runs on tick `time_index`. Tick 0 runs
/// everything.
pub fn is_eligible(shift: u32, time_index: u64) -> bool {
    time_index == 0 || time_index % (1u64 << shift.min(63)) == 0
}

/// Minutes between runs of a node with `shift`.
pub fn interval_minutes(time_quantum: u32, shift: u32) -> u64 {
    u64::from(time_quantum) << shift.min(32)
}

/// `45m` or `2h40m`.
pub fn interval_string(minutes: u64) -> String {
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h{}m", minutes / 60, minutes % 60)
    }
}

/// Per-node caps implied by the barriers.
///
/// Everything a barrier node depends on, through real and pseudo
/// dependencies and aggregates, is capped at the barrier value. A node under
/// several barriers gets the smallest cap.
pub fn barrier_overrides(
    graph: &BuildGraph,
    barriers: &IndexMap<String, u32>,
) -> Result<HashMap<NodeId, u32>> {
    let mut overrides: HashMap<NodeId, u32> = HashMap::new();
    for (barrier, &cap) in barriers {
        let mut included: HashSet<&str> = HashSet::new();
        let mut search: Vec<&str> = vec![barrier.as_str()];
        while let Some(name) = search.pop() {
            if !included.insert(name) {
                continue;
            }
            if let Some(id) = graph.find(name) {
                let node = &graph.node(id).node;
                search.extend(node.dependencies.iter().map(String::as_str));
                search.extend(node.pseudo_dependencies.iter().map(String::as_str));
            } else if let Some(aggregate) = graph.aggregate(name) {
                search.extend(aggregate.dependencies.iter().map(String::as_str));
            } else {
                return Err(Error::UnknownBarrier(name.to_string()));
            }
        }

        for name in included {
            if let Some(id) = graph.find(name) {
                overrides
                    .entry(id)
                    .and_modify(|current| *current = (*current).min(cap))
                    .or_insert(cap);
            }
        }
    }
    Ok(overrides)
}

/// Assign every node its effective frequency shift.
///
/// Declared shifts go through the frequency hackers, are capped by the
/// barriers, and are then raised to the largest shift found upstream so a
/// node never runs more often than what it depends on.
pub fn compute_frequencies(
    graph: &mut BuildGraph,
    registry: &ExtensionRegistry,
    branch: &str,
    barriers: &IndexMap<String, u32>,
) -> Result<()> {
    let overrides = barrier_overrides(graph, barriers)?;
    let ids: Vec<NodeId> = graph.node_ids().collect();
    for &id in &ids {
        let node = graph.node(id);
        let mut shift = registry.hack_frequency(branch, node.name(), node.node.frequency_shift);
        if let Some(&cap) = overrides.get(&id) {
            if shift > cap {
                debug!(node = %node.name(), shift, cap, "Frequency capped by barrier");
                shift = cap;
            }
        }
        graph.node_mut(id).frequency_shift = shift;
    }
    compute_dependent_frequencies(graph);
    Ok(())
}

/// Raise each node's shift to the maximum over its indirect dependencies.
pub fn compute_dependent_frequencies(graph: &mut BuildGraph) {
    let base: HashMap<NodeId, u32> = graph
        .node_ids()
        .map(|id| (id, graph.node(id).frequency_shift))
        .collect();
    let ids: Vec<NodeId> = graph.node_ids().collect();
    for id in ids {
        let node = graph.node(id);
        let shift = node
            .all_indirect_dependencies
            .iter()
            .filter_map(|dep| base.get(dep).copied())
            .fold(node.frequency_shift, u32::max);
        graph.node_mut(id).frequency_shift = shift;
    }
}
