//! In-process node execution.

use crate::completion::node_block;
use crate::history::{NodeHistory, find_node_history};
use crate::status::{
    FAILED_SUFFIX, FailureReport, LogTailDiagnostics, STARTED_SUFFIX, SUCCEEDED_SUFFIX,
    StatusStore, StepDiagnostics,
};
use indexmap::IndexSet;
use keel_cache::StorageProvider;
use keel_core::{Error, Result, RunOptions};
use keel_scheduler::{BuildContext, BuildGraph, NodeId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What a processed node leaves behind for its dependents.
#[derive(Debug, Clone, Default)]
struct ProcessedNode {
    all_dependencies: IndexSet<String>,
    products: Vec<PathBuf>,
    dependency_products: IndexSet<PathBuf>,
}

impl ProcessedNode {
    /// Accumulate a processed dependency called `name`.
    fn inherit(&mut self, name: &str, done: &ProcessedNode) {
        self.all_dependencies.insert(name.to_string());
        self.all_dependencies
            .extend(done.all_dependencies.iter().cloned());
        self.dependency_products.extend(done.products.iter().cloned());
        self.dependency_products
            .extend(done.dependency_products.iter().cloned());
    }
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    /// Nodes that ran.
    pub built: Vec<String>,
    /// Nodes whose products were retrieved from storage.
    pub retrieved: Vec<String>,
}

/// Runs ordered nodes one after another, storing and retrieving their
/// products.
pub struct NodeExecutor<'a> {
    graph: &'a BuildGraph,
    storage: &'a dyn StorageProvider,
    options: &'a RunOptions,
    store_name: &'a str,
    save_shared: bool,
    log_folder: PathBuf,
    diagnostics: Option<Arc<dyn StepDiagnostics>>,
    log_tails: LogTailDiagnostics,
    processed: HashMap<NodeId, ProcessedNode>,
    product_owners: HashMap<PathBuf, String>,
}

impl<'a> NodeExecutor<'a> {
    pub fn new(
        graph: &'a BuildGraph,
        storage: &'a dyn StorageProvider,
        options: &'a RunOptions,
        store_name: &'a str,
    ) -> Self {
        Self {
            graph,
            storage,
            options,
            store_name,
            save_shared: false,
            log_folder: storage.local_root().join("Saved").join("Logs"),
            diagnostics: None,
            log_tails: LogTailDiagnostics::new(Vec::new(), 0),
            processed: HashMap::new(),
            product_owners: HashMap::new(),
        }
    }

    /// Also write products and status markers to the shared tier.
    pub fn with_shared_saves(mut self, save_shared: bool) -> Self {
        self.save_shared = save_shared;
        self
    }

    /// Folder for status markers and failure reports. Must sit under the
    /// storage root.
    pub fn with_log_folder(mut self, log_folder: PathBuf) -> Self {
        self.log_folder = log_folder;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn StepDiagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Logs whose tails go into failure reports.
    pub fn with_log_tails(mut self, log_tails: LogTailDiagnostics) -> Self {
        self.log_tails = log_tails;
        self
    }

    fn local_only(&self) -> bool {
        !self.save_shared
    }

    fn status_store(&self) -> StatusStore<'_> {
        StatusStore {
            storage: self.storage,
            log_folder: &self.log_folder,
            base: self.storage.local_root(),
            local_only: self.local_only(),
        }
    }

    /// Folder a node's products live under.
    fn node_root(&self, id: NodeId) -> PathBuf {
        let local_root = self.storage.local_root();
        // Fake runs only produce success records, which live under the root.
        if self.options.fake {
            return local_root.to_path_buf();
        }
        match &self.graph.node(id).node.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => local_root.join(root),
            None => local_root.to_path_buf(),
        }
    }

    fn context<'b>(
        &'b self,
        id: NodeId,
        root: &'b Path,
        dependency_products: &'b [PathBuf],
    ) -> BuildContext<'b> {
        let node = self.graph.node(id);
        BuildContext {
            node: node.name(),
            root,
            scope: node.node.scope.as_deref(),
            dependency_products,
            storage: self.storage,
            build_machine: self.options.build_machine,
        }
    }

    /// Execute every node of `ordered`.
    ///
    /// Dependencies outside `ordered` must be complete; their products are
    /// retrieved the first time a node needs them.
    pub async fn execute(&mut self, ordered: &[NodeId]) -> Result<ExecutionSummary> {
        let start = Instant::now();
        let in_plan: HashSet<NodeId> = ordered.iter().copied().collect();
        let mut summary = ExecutionSummary::default();

        for &id in ordered {
            let name = self.graph.name(id).to_string();
            if self.execute_node(id, &in_plan).await? {
                summary.built.push(name);
            } else {
                summary.retrieved.push(name);
            }
        }

        info!(
            store = %self.store_name,
            built = summary.built.len(),
            retrieved = summary.retrieved.len(),
            seconds = start.elapsed().as_secs_f64(),
            "Executed nodes"
        );
        Ok(summary)
    }

    /// Returns whether the node was built rather than retrieved.
    async fn execute_node(&mut self, id: NodeId, in_plan: &HashSet<NodeId>) -> Result<bool> {
        let graph = self.graph;
        let node = graph.node(id);
        let name = node.name();
        if self.processed.contains_key(&id) {
            return Err(Error::AlreadyProcessed {
                node: name.to_string(),
            });
        }

        for &dep in &node.dependencies {
            if self.is_outside(dep, in_plan) {
                self.load_outside_dependency(dep, in_plan).await?;
            }
        }

        let mut processed = ProcessedNode::default();
        for &dep in &node.dependencies {
            let Some(done) = self.processed.get(&dep) else {
                return Err(Error::NodeNotProcessed {
                    dependency: graph.name(dep).to_string(),
                    node: name.to_string(),
                });
            };
            processed.inherit(graph.name(dep), done);
        }

        let block = node_block(self.store_name, name);
        let root = self.node_root(id);
        let save_success_records = (self.options.build_machine || self.options.fake_job_service)
            && (!node.is_trigger() || node.is_sticky());
        let dependency_products: Vec<PathBuf> =
            processed.dependency_products.iter().cloned().collect();

        info!(node = %name, scope = ?node.node.scope, block = %block, "Running node");
        let built = !node.complete;
        processed.products = if node.complete {
            info!(node = %name, block = %block, "Retrieving node");
            self.retrieve_products(id, &block, &root, &dependency_products)
                .await?
        } else {
            let scope = node.node.scope.as_deref();
            if save_success_records {
                self.status_store()
                    .save_status(name, STARTED_SUFFIX, &block, scope, None)
                    .await?;
            }
            match self
                .build_node(id, &block, &root, &dependency_products, &processed.all_dependencies)
                .await
            {
                Ok(products) => {
                    if save_success_records {
                        if let Some(history) = self.history(id).await {
                            info!(
                                node = %name,
                                last_succeeded = history.last_succeeded,
                                failed = %history.failed_string(),
                                "Node history"
                            );
                        }
                        self.status_store()
                            .save_status(name, SUCCEEDED_SUFFIX, &block, scope, None)
                            .await?;
                    }
                    products
                }
                Err(e) => {
                    error!(node = %name, error = %e, "Node failed");
                    if save_success_records {
                        self.record_failure(id, &block, &e).await;
                    }
                    return Err(e);
                }
            }
        };

        for product in &processed.products {
            if let Some(first) = self.product_owners.get(product) {
                return Err(Error::OverlappingBuildProduct {
                    first: first.clone(),
                    second: name.to_string(),
                    product: product.display().to_string(),
                });
            }
            self.product_owners.insert(product.clone(), name.to_string());
        }
        self.processed.insert(id, processed);
        Ok(built)
    }

    /// A complete dependency that is neither planned nor loaded yet.
    fn is_outside(&self, id: NodeId, in_plan: &HashSet<NodeId>) -> bool {
        !self.processed.contains_key(&id) && !in_plan.contains(&id) && self.graph.node(id).complete
    }

    /// Outside dependencies reachable from `id`, dependencies first.
    fn outside_closure(
        &self,
        id: NodeId,
        in_plan: &HashSet<NodeId>,
        visited: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        for &dep in &self.graph.node(id).dependencies {
            if self.is_outside(dep, in_plan) {
                self.outside_closure(dep, in_plan, visited, order);
            }
        }
        order.push(id);
    }

    /// Retrieve a complete dependency that is not part of the plan, along
    /// with the complete dependencies behind it.
    async fn load_outside_dependency(
        &mut self,
        id: NodeId,
        in_plan: &HashSet<NodeId>,
    ) -> Result<()> {
        let mut order = Vec::new();
        self.outside_closure(id, in_plan, &mut HashSet::new(), &mut order);

        for id in order {
            let graph = self.graph;
            let name = graph.name(id);
            let mut processed = ProcessedNode::default();
            for &dep in &graph.node(id).dependencies {
                match self.processed.get(&dep) {
                    Some(done) => processed.inherit(graph.name(dep), done),
                    None => warn!(
                        node = %name,
                        dependency = %graph.name(dep),
                        "Outside dependency has an incomplete dependency"
                    ),
                }
            }

            let block = node_block(self.store_name, name);
            let root = self.node_root(id);
            let dependency_products: Vec<PathBuf> =
                processed.dependency_products.iter().cloned().collect();
            info!(node = %name, block = %block, "Retrieving dependency outside the plan");
            processed.products = self
                .retrieve_products(id, &block, &root, &dependency_products)
                .await?;
            self.processed.insert(id, processed);
        }
        Ok(())
    }

    async fn retrieve_products(
        &self,
        id: NodeId,
        block: &str,
        root: &Path,
        dependency_products: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        let node = self.graph.node(id);
        let scope = node.node.scope.as_deref();
        let retrieved = match self.storage.retrieve(block, scope, root).await {
            Ok(retrieved) => retrieved,
            Err(e) if scope.is_some() => {
                warn!(node = %node.name(), scope = ?scope, error = %e, "Scoped retrieve failed, trying unscoped");
                self.storage
                    .retrieve(block, None, root)
                    .await
                    .map_err(|e| {
                        error!(node = %node.name(), error = %e, "Retrieve failed");
                        Error::BuildProductsMissing(node.name().to_string())
                    })?
            }
            Err(e) => {
                error!(node = %node.name(), error = %e, "Retrieve failed");
                return Err(Error::BuildProductsMissing(node.name().to_string()));
            }
        };
        if !retrieved.was_local {
            let ctx = self.context(id, root, dependency_products);
            node.node.action.post_load(&ctx, &retrieved.files).await?;
        }
        Ok(retrieved.files)
    }

    async fn build_node(
        &self,
        id: NodeId,
        block: &str,
        root: &Path,
        dependency_products: &[PathBuf],
        all_dependencies: &IndexSet<String>,
    ) -> Result<Vec<PathBuf>> {
        let node = self.graph.node(id);
        let name = node.name();
        if self.options.is_fake_fail(name) {
            return Err(Error::FakeFail(name.to_string()));
        }

        let ctx = self.context(id, root, dependency_products);
        let products = if self.options.fake {
            info!(node = %name, block = %block, "Fake building node");
            node.node.action.fake_build(&ctx).await?
        } else {
            info!(node = %name, block = %block, kind = node.node.action.kind(), "Building node");
            node.node.action.build(&ctx).await?
        };
        self.storage
            .store(block, &products, self.local_only(), ctx.scope, root)
            .await?;

        if self.options.stomp_check {
            self.check_stomps(name, all_dependencies).await?;
        }
        Ok(products)
    }

    /// Every dependency stored locally must still match its manifest.
    async fn check_stomps(&self, name: &str, all_dependencies: &IndexSet<String>) -> Result<()> {
        for dependency in all_dependencies {
            let Some(dep) = self.graph.find(dependency) else {
                continue;
            };
            let block = node_block(self.store_name, dependency);
            if !self.storage.local_exists(&block).await {
                continue;
            }
            let root = self.node_root(dep);
            let scope = self.graph.node(dep).node.scope.as_deref();
            let stomped = |message: String| Error::Stomped {
                node: name.to_string(),
                dependency: dependency.clone(),
                message,
            };
            match self.storage.retrieve(&block, scope, &root).await {
                Ok(retrieved) if retrieved.was_local => {}
                Ok(_) => {
                    return Err(stomped(
                        "local files were replaced from shared storage".to_string(),
                    ));
                }
                Err(e) => return Err(stomped(e.to_string())),
            }
        }
        info!(node = %name, dependencies = all_dependencies.len(), "Stomp check passed");
        Ok(())
    }

    async fn history(&self, id: NodeId) -> Option<NodeHistory> {
        let node = self.graph.node(id);
        match find_node_history(
            self.storage,
            node,
            self.options.change_list,
            self.store_name,
            self.local_only(),
        )
        .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(node = %node.name(), error = %e, "Unable to find node history");
                None
            }
        }
    }

    /// Save the failure marker and report. Problems here are logged so the
    /// build error is the one reported.
    async fn record_failure(&self, id: NodeId, block: &str, failure: &Error) {
        let node = self.graph.node(id);
        let name = node.name();
        let history = self.history(id).await;

        let mut diagnostics = None;
        let step = self.options.job_step_id.as_deref();
        if let (Some(step), Some(source)) = (step, &self.diagnostics) {
            diagnostics = source.diagnostics(step).await;
        }
        if let Err(e) = self
            .status_store()
            .save_status(
                name,
                FAILED_SUFFIX,
                block,
                node.node.scope.as_deref(),
                diagnostics.as_deref(),
            )
            .await
        {
            warn!(node = %name, error = %e, "Failed to save failure status");
        }

        let tails = self.log_tails.tails().await;
        let error = failure.to_string();
        let report = FailureReport {
            node: name,
            error: &error,
            history: history.as_ref(),
            change_list: self.options.change_list,
            log_tails: &tails,
        };
        if let Err(e) = report.write(&self.log_folder).await {
            warn!(node = %name, error = %e, "Failed to write failure report");
        }
    }
}
