//! Controlling trigger propagation.

use crate::graph::{BuildGraph, NodeId, NodeSet};
use keel_core::{Error, Result};
use std::collections::HashMap;

/// Compute the controlling trigger chain of every node.
///
/// A node is controlled by the nearest trigger upstream of it along real
/// and pseudo dependencies. Two unrelated controlling triggers are an error.
pub fn find_controlling_triggers(graph: &mut BuildGraph) -> Result<()> {
    let mut memo: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let ids: Vec<NodeId> = graph.node_ids().collect();
    for &id in &ids {
        chain_for(graph, id, &mut memo)?;
    }
    for id in ids {
        if let Some(chain) = memo.remove(&id) {
            graph.node_mut(id).controlling_triggers = chain;
        }
    }
    Ok(())
}

fn chain_for(
    graph: &BuildGraph,
    id: NodeId,
    memo: &mut HashMap<NodeId, Vec<NodeId>>,
) -> Result<Vec<NodeId>> {
    if let Some(chain) = memo.get(&id) {
        return Ok(chain.clone());
    }

    let mut candidates = NodeSet::new();
    for &dep in &graph.node(id).all_direct_dependencies {
        if graph.node(dep).is_trigger() {
            candidates.insert(dep);
        } else if let Some(&last) = chain_for(graph, dep, memo)?.last() {
            candidates.insert(last);
        }
    }

    let mut chains = Vec::with_capacity(candidates.len());
    for &candidate in &candidates {
        chains.push(chain_for(graph, candidate, memo)?);
    }
    let survivors: Vec<NodeId> = candidates
        .iter()
        .copied()
        .filter(|candidate| !chains.iter().any(|chain| chain.contains(candidate)))
        .collect();

    let chain = match survivors.as_slice() {
        [] => Vec::new(),
        [trigger] => {
            let mut chain = chain_for(graph, *trigger, memo)?;
            chain.push(*trigger);
            chain
        }
        _ => {
            return Err(Error::MultipleControllingTriggers {
                node: graph.name(id).to_string(),
                triggers: survivors
                    .iter()
                    .map(|&t| graph.name(t).to_string())
                    .collect(),
            });
        }
    };
    memo.insert(id, chain.clone());
    Ok(chain)
}

/// Last trigger of the node's chain, if any.
pub fn last_controlling_trigger(graph: &BuildGraph, id: NodeId) -> Option<NodeId> {
    graph.node(id).controlling_triggers.last().copied()
}
