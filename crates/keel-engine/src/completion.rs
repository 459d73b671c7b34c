//! Completion tracking.

use keel_cache::StorageProvider;
use keel_scheduler::{BuildGraph, NodeId};
use tracing::{debug, info};

/// Storage block holding the products of `node` for a store.
pub fn node_block(store_name: &str, node: &str) -> String {
    format!("{}-{}", store_name, node)
}

/// Whether the products of `id` are already stored.
///
/// Local-only runs look at local manifests. Otherwise the node's scope is
/// tried first, then the default scope.
pub async fn is_complete(
    graph: &BuildGraph,
    id: NodeId,
    storage: &dyn StorageProvider,
    store_name: &str,
    local_only: bool,
) -> bool {
    let node = graph.node(id);
    let block = node_block(store_name, node.name());
    if local_only {
        return storage.local_exists(&block).await;
    }
    let scope = node.node.scope.as_deref();
    if storage.exists(&block, scope, false).await {
        return true;
    }
    scope.is_some() && storage.exists(&block, None, false).await
}

/// Set the completion flag of every node. Returns how many are complete.
pub async fn find_completion_state(
    graph: &mut BuildGraph,
    storage: &dyn StorageProvider,
    store_name: &str,
    local_only: bool,
) -> usize {
    let ids: Vec<NodeId> = graph.node_ids().collect();
    let mut complete = 0;
    for id in ids {
        let done = is_complete(graph, id, storage, store_name, local_only).await;
        let node = graph.node(id);
        if node.is_trigger() {
            if done {
                info!(node = %node.name(), store = %store_name, "Trigger was already triggered");
            } else {
                info!(node = %node.name(), store = %store_name, "Trigger was not yet triggered");
            }
        } else {
            debug!(node = %node.name(), complete = done, "Completion state");
        }
        graph.node_mut(id).complete = done;
        complete += usize::from(done);
    }
    complete
}
