//! Build graph scheduling for Keel.
//!
//! Nodes and aggregates are added to a [`BuildGraph`], linked, assigned
//! controlling triggers and CI frequencies, then ordered by
//! [`topological_sort`] for execution or job planning.

pub mod action;
pub mod export;
pub mod frequency;
pub mod graph;
pub mod job_service;
pub mod node;
pub mod registry;
pub mod selection;
pub mod sort;
pub mod triggers;

pub use action::{BuildAction, BuildContext, NoopAction};
pub use graph::{BuildGraph, BuildNode, EdgeKind, NodeId, NodeSet};
pub use job_service::{JobStep, JobStepKind, JobStepSink};
pub use node::{Aggregate, Node};
pub use registry::{BranchOptions, EmailOptions, ExtensionRegistry};
pub use sort::{check_sort_order, topological_sort};
pub use triggers::find_controlling_triggers;
