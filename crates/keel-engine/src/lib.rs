//! Keel Engine
//!
//! Loads graph definitions, caches which nodes are already complete, and
//! runs the ordered plan against temp storage.

pub mod actions;
pub mod completion;
pub mod config;
pub mod definition;
pub mod executor;
pub mod history;
pub mod listing;
pub mod planner;
pub mod status;

pub use actions::{CleanSharedStorageAction, ShellAction, TriggerAction};
pub use config::EngineConfig;
pub use definition::{GraphDefinition, LoadedGraph, NodeDefinition, NodeKind};
pub use executor::{ExecutionSummary, NodeExecutor};
pub use history::NodeHistory;
pub use listing::{ListingEntry, ListingOptions, plan_listing};
pub use planner::{Engine, JsonStepFile, Plan, RunOutcome, StoreSettings};
