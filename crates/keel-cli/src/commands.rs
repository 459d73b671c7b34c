//! CLI command definitions.

use crate::config::LogFormat;
use clap::{Args, Subcommand};
use keel_core::RunOptions;
use std::path::PathBuf;

/// Settings shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Engine configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Graph definition file
    #[arg(long, global = true)]
    pub graph: Option<PathBuf>,

    /// Root of the local workspace
    #[arg(long, global = true)]
    pub local_root: Option<PathBuf>,

    /// Root of shared temp storage
    #[arg(long, global = true)]
    pub shared_root: Option<PathBuf>,

    /// Branch name, overriding the graph definition
    #[arg(long, global = true)]
    pub branch: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a starter graph definition
    Init {
        /// Path to write
        #[arg(default_value = "keel.yaml")]
        path: PathBuf,
    },

    /// Check that the graph definition loads and links
    Validate,

    /// Plan and run build nodes
    Run(RunArgs),

    /// Print the plan without running anything
    List(RunArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Flags of a run. Lists are `+` separated.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// YAML file of run options; flags given here take precedence
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Nodes, agent sharing groups or aggregates to run with their dependencies
    #[arg(short, long)]
    pub node: Option<String>,

    /// Games whose full aggregates should run
    #[arg(long)]
    pub game: Option<String>,

    /// Nodes to run without their dependencies
    #[arg(long)]
    pub only_node: Option<String>,

    /// CI tick; keeps only the nodes due on it
    #[arg(long)]
    pub time_index: Option<u64>,

    /// Trigger being approved
    #[arg(long)]
    pub trigger_node: Option<String>,

    /// Treat every unapproved trigger as satisfied
    #[arg(long)]
    pub skip_triggers: bool,

    /// Delete every local manifest first
    #[arg(long)]
    pub clean_local: bool,

    /// Explicit store name
    #[arg(long)]
    pub store: Option<String>,

    /// Suffix appended to derived store names
    #[arg(long)]
    pub store_suffix: Option<String>,

    /// Fake build every node
    #[arg(long)]
    pub fake: bool,

    /// Save status markers without a job service
    #[arg(long)]
    pub fake_job_service: bool,

    /// Node to fail on purpose
    #[arg(long)]
    pub fake_fail: Option<String>,

    /// Print the plan and stop
    #[arg(long)]
    pub list_only: bool,

    /// List dependencies under each node
    #[arg(long)]
    pub show_dependencies: bool,

    /// Write the ordered graph as DOT
    #[arg(long)]
    pub save_graph: Option<PathBuf>,

    /// Leave out triggers and everything behind them
    #[arg(long)]
    pub preflight: bool,

    /// Check that no node rewrites its dependencies' products
    #[arg(long)]
    pub stomp_check: bool,

    /// Plan job steps instead of running
    #[arg(long)]
    pub job_setup: bool,

    /// Print the history of one node
    #[arg(long)]
    pub show_history: Option<String>,

    /// Change list being built
    #[arg(long, visible_alias = "cl")]
    pub change_list: Option<u64>,

    /// Running on a build machine
    #[arg(long)]
    pub build_machine: bool,

    /// Job step this run belongs to
    #[arg(long)]
    pub job_step_id: Option<String>,
}

impl RunArgs {
    /// Run options from the options file, if any, overlaid with the flags.
    pub fn to_options(&self) -> Result<RunOptions, Box<dyn std::error::Error>> {
        let mut options = match &self.options {
            Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
            None => RunOptions::default(),
        };

        if let Some(node) = &self.node {
            options.node = RunOptions::split_list(node);
        }
        if let Some(game) = &self.game {
            options.game = RunOptions::split_list(game);
        }
        if let Some(only) = &self.only_node {
            options.only_node = RunOptions::split_list(only);
        }
        if let Some(time_index) = self.time_index {
            options.time_index = time_index;
        }
        if let Some(change_list) = self.change_list {
            options.change_list = change_list;
        }
        if let Some(suffix) = &self.store_suffix {
            options.store_suffix = suffix.clone();
        }
        if let Some(path) = &self.save_graph {
            options.save_graph = Some(path.clone());
        }

        for (flag, value) in [
            (&self.trigger_node, &mut options.trigger_node),
            (&self.store, &mut options.store),
            (&self.fake_fail, &mut options.fake_fail),
            (&self.show_history, &mut options.show_history),
            (&self.job_step_id, &mut options.job_step_id),
        ] {
            if flag.is_some() {
                value.clone_from(flag);
            }
        }

        options.skip_triggers |= self.skip_triggers;
        options.clean_local |= self.clean_local;
        options.fake |= self.fake;
        options.fake_job_service |= self.fake_job_service;
        options.list_only |= self.list_only;
        options.show_dependencies |= self.show_dependencies;
        options.preflight |= self.preflight;
        options.stomp_check |= self.stomp_check;
        options.job_setup |= self.job_setup;
        options.build_machine |= self.build_machine;
        Ok(options)
    }
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
