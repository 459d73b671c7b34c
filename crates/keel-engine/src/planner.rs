//! Run orchestration.
//!
//! A run loads the graph definition, decides where products are stored,
//! caches completion state, selects and orders the nodes, and then either
//! plans job steps, saves the graph, lists the plan or executes it.

use crate::completion::find_completion_state;
use crate::config::EngineConfig;
use crate::definition::{GraphDefinition, LoadedGraph};
use crate::executor::{ExecutionSummary, NodeExecutor};
use crate::history::find_node_history;
use crate::listing::{ListingEntry, ListingOptions, plan_listing};
use crate::status::LogTailDiagnostics;
use keel_cache::{StorageProvider, TempStorage};
use keel_core::{Error, Result, RunOptions};
use keel_scheduler::export::save_graph;
use keel_scheduler::job_service::{filter_for_job_service, plan_job_steps};
use keel_scheduler::selection::{
    cull_for_preflight, cull_for_time_index, find_unfinished_triggers, resolve_explicit_trigger,
    select_nodes,
};
use keel_scheduler::{
    BranchOptions, BuildGraph, ExtensionRegistry, JobStep, JobStepSink, NodeId, check_sort_order,
    topological_sort,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Where this run's products go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSettings {
    /// Prefix of every node's storage block.
    pub name: String,
    /// Completion is judged from local manifests only.
    pub local_only: bool,
    /// Products and status markers are also written to the shared tier.
    pub save_shared: bool,
}

/// Branch name made safe for block names.
pub fn escape_branch(branch: &str) -> String {
    branch.replace(['/', '\\'], "+")
}

/// Pick the store name and storage tiers for a run.
///
/// An explicit store is always local. Otherwise a known change list gives a
/// shared store named after the branch and change list, saved to by build
/// machines only.
pub async fn resolve_store(
    storage: &dyn StorageProvider,
    options: &RunOptions,
    prefix: &str,
    branch: &str,
) -> Result<StoreSettings> {
    let mut settings = match options.store.as_deref().filter(|s| !s.is_empty()) {
        Some(store) => StoreSettings {
            name: store.to_string(),
            local_only: true,
            save_shared: false,
        },
        None if options.change_list != 0 => StoreSettings {
            name: format!(
                "{}-{}-CL-{}-{}",
                prefix,
                escape_branch(branch),
                options.change_list,
                options.store_suffix
            ),
            local_only: false,
            save_shared: options.build_machine,
        },
        None => StoreSettings {
            name: format!("TempLocal-{}", options.store_suffix),
            local_only: true,
            save_shared: false,
        },
    };

    if options.fake_job_service {
        settings.local_only = true;
        settings.save_shared = false;
    }
    if settings.save_shared {
        if !storage.has_shared(true).await {
            return Err(Error::NoSharedFolder(
                "shared storage is required to save build products".to_string(),
            ));
        }
    } else if !settings.local_only && !storage.has_shared(false).await {
        warn!(store = %settings.name, "Shared storage is unavailable, using local storage only");
        settings.local_only = true;
    }
    info!(
        store = %settings.name,
        local_only = settings.local_only,
        save_shared = settings.save_shared,
        "Resolved store"
    );
    Ok(settings)
}

/// Collects planned job steps and writes them as a JSON array.
#[derive(Debug)]
pub struct JsonStepFile {
    path: PathBuf,
    steps: Vec<JobStep>,
}

impl JsonStepFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            steps: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[JobStep] {
        &self.steps
    }

    /// Write every collected step.
    pub fn finish(self) -> Result<PathBuf> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.steps)?)?;
        info!(path = %self.path.display(), steps = self.steps.len(), "Wrote job steps");
        Ok(self.path)
    }
}

impl JobStepSink for JsonStepFile {
    fn emit(&mut self, step: JobStep) -> Result<()> {
        info!(step = %step.name, kind = ?step.kind, "Planned job step");
        self.steps.push(step);
        Ok(())
    }
}

/// A sorted, listed plan ready to be carried out.
#[derive(Debug)]
pub struct Plan {
    pub graph: BuildGraph,
    pub branch: String,
    pub branch_options: BranchOptions,
    pub store: StoreSettings,
    pub ordered: Vec<NodeId>,
    pub explicit_trigger: Option<NodeId>,
    pub unfinished_triggers: Vec<NodeId>,
    pub listing: Vec<ListingEntry>,
}

impl Plan {
    pub fn node_names(&self) -> Vec<String> {
        self.ordered
            .iter()
            .map(|&id| self.graph.name(id).to_string())
            .collect()
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Only placeholder nodes were requested.
    NothingToDo,
    History { node: String, lines: Vec<String> },
    JobSteps { count: usize, path: PathBuf },
    GraphSaved { path: PathBuf },
    Listed,
    Executed(ExecutionSummary),
}

/// Runs graphs against one storage.
pub struct Engine {
    config: EngineConfig,
    registry: ExtensionRegistry,
    storage: Arc<dyn StorageProvider>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let storage = Arc::new(TempStorage::new(config.storage.clone()));
        Self {
            config,
            registry: ExtensionRegistry::new(),
            storage,
        }
    }

    pub fn with_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = storage;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn StorageProvider {
        self.storage.as_ref()
    }

    /// Load the graph definition named by the configuration.
    pub fn load(&self) -> Result<LoadedGraph> {
        let definition = GraphDefinition::from_file(&self.config.graph_path())?;
        definition.build(&self.registry, self.config.branch.as_deref())
    }

    /// Build the plan for `options`. `None` when there is nothing to do.
    pub async fn plan(&self, options: &RunOptions) -> Result<Option<Plan>> {
        let start = Instant::now();
        let LoadedGraph {
            mut graph,
            branch,
            options: branch_options,
        } = self.load()?;

        let store = resolve_store(
            self.storage(),
            options,
            &self.config.store_prefix,
            &branch,
        )
        .await?;
        if options.clean_local {
            info!("Deleting local manifests");
            self.storage.delete_local_manifests().await?;
        }
        let complete =
            find_completion_state(&mut graph, self.storage(), &store.name, store.local_only).await;
        info!(nodes = graph.len(), complete, "Cached completion state");

        let Some(mut nodes) = select_nodes(&graph, options)? else {
            return Ok(None);
        };
        cull_for_time_index(&graph, &mut nodes, options.time_index);
        cull_for_preflight(&graph, &mut nodes, options.preflight);

        let explicit_trigger = if options.job_setup {
            resolve_explicit_trigger(
                &mut graph,
                options.trigger_node.as_deref(),
                options.skip_triggers,
            )?
        } else {
            None
        };

        let ordered = topological_sort(&graph, &nodes, explicit_trigger, false, false)?;
        let unfinished_triggers =
            find_unfinished_triggers(&graph, &ordered, explicit_trigger, options.skip_triggers);
        let listing = plan_listing(
            &graph,
            &ordered,
            Some(&unfinished_triggers),
            ListingOptions {
                time_quantum: branch_options.time_quantum,
                show_dependencies: options.show_dependencies,
            },
        );
        check_sort_order(&graph, &ordered)?;

        info!(
            branch = %branch,
            nodes = ordered.len(),
            unfinished_triggers = unfinished_triggers.len(),
            seconds = start.elapsed().as_secs_f64(),
            "Planned run"
        );
        Ok(Some(Plan {
            graph,
            branch,
            branch_options,
            store,
            ordered,
            explicit_trigger,
            unfinished_triggers,
            listing,
        }))
    }

    /// Carry out a plan according to `options`.
    pub async fn execute(&self, plan: &Plan, options: &RunOptions) -> Result<RunOutcome> {
        if let Some(name) = options.show_history.as_deref() {
            return self.show_history(plan, options, name).await;
        }
        if options.job_setup {
            return self.setup_job_steps(plan, options);
        }
        if let Some(path) = &options.save_graph {
            save_graph(&plan.graph, &plan.ordered, path)?;
            return Ok(RunOutcome::GraphSaved { path: path.clone() });
        }
        if options.list_only {
            info!("List only, done");
            return Ok(RunOutcome::Listed);
        }

        let tails = LogTailDiagnostics::new(
            self.config
                .diagnostic_logs
                .iter()
                .map(|log| self.resolve(log))
                .collect(),
            self.config.log_tail_lines,
        );
        let mut executor = NodeExecutor::new(
            &plan.graph,
            self.storage(),
            options,
            &plan.store.name,
        )
        .with_shared_saves(plan.store.save_shared)
        .with_log_folder(self.config.log_folder())
        .with_diagnostics(Arc::new(tails.clone()))
        .with_log_tails(tails);
        let summary = executor.execute(&plan.ordered).await?;
        Ok(RunOutcome::Executed(summary))
    }

    /// Plan and execute in one go.
    pub async fn run(&self, options: &RunOptions) -> Result<RunOutcome> {
        match self.plan(options).await? {
            Some(plan) => self.execute(&plan, options).await,
            None => {
                info!("Request for placeholder nodes only, done");
                Ok(RunOutcome::NothingToDo)
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.local_root().join(path)
        }
    }

    async fn show_history(
        &self,
        plan: &Plan,
        options: &RunOptions,
        name: &str,
    ) -> Result<RunOutcome> {
        let id = plan
            .graph
            .find_ignore_case(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        let node = plan.graph.node(id);
        let history = find_node_history(
            self.storage(),
            node,
            options.change_list,
            &plan.store.name,
            plan.store.local_only,
        )
        .await?
        .ok_or_else(|| Error::Other(format!("Couldn't get history for {}", node.name())))?;
        Ok(RunOutcome::History {
            node: node.name().to_string(),
            lines: history.detailed_lines(options.change_list),
        })
    }

    fn setup_job_steps(&self, plan: &Plan, options: &RunOptions) -> Result<RunOutcome> {
        let filtered = filter_for_job_service(
            &plan.graph,
            &plan.ordered,
            &plan.unfinished_triggers,
            plan.explicit_trigger,
            options.preflight,
            options.skip_triggers,
        );
        info!(
            nodes = filtered.len(),
            dropped = plan.ordered.len() - filtered.len(),
            "Filtered nodes for the job service"
        );
        let mut sink = JsonStepFile::new(self.config.job_steps_path());
        let count = plan_job_steps(
            &plan.graph,
            &filtered,
            plan.explicit_trigger,
            options.skip_triggers,
            &mut sink,
        )?;
        let path = sink.finish()?;
        Ok(RunOutcome::JobSteps { count, path })
    }
}
