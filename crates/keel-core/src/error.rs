//! Error types for Keel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Graph errors
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Failed to link graph ({count} errors):\n{}", .details.join("\n"))]
    Link { count: usize, details: Vec<String> },

    #[error("Node {node} has multiple controlling triggers: {}", .triggers.join(", "))]
    MultipleControllingTriggers { node: String, triggers: Vec<String> },

    #[error("Agent sharing group '{group}' has multiple controlling triggers: {triggers}")]
    AgentGroupMultipleTriggers { group: String, triggers: String },

    #[error("Cycle in build graph, could not resolve:\n{}", .remaining.join("\n"))]
    Cycle { remaining: Vec<String> },

    #[error("Topological sort error, node {node} has a {kind} of {dependency} which sorted after it")]
    SortOrder {
        node: String,
        dependency: String,
        kind: &'static str,
    },

    #[error("Could not find node named {0}")]
    UnknownNode(String),

    #[error("Could not find trigger node named {0}")]
    UnknownTrigger(String),

    #[error("Couldn't find referenced node {0} in graph")]
    UnknownBarrier(String),

    #[error("Node {node} is not complete and does not depend on explicit trigger {trigger}; everything before the trigger should already be handled")]
    TriggerTooLate { node: String, trigger: String },

    #[error("Sticky and non-sticky nodes did not sort right at {0}")]
    StickyOrder(String),

    #[error("Node {0} is both agent sharing and sticky")]
    StickyAgentGroup(String),

    #[error("No nodes to do")]
    NothingToDo,

    #[error("Node {dependency} is needed by {node} but is neither selected nor complete")]
    DependencyNotComplete { dependency: String, node: String },

    // Cache consistency errors
    #[error("Manifest file not found: {0}")]
    ManifestMissing(String),

    #[error("Attempt to {0} empty manifest")]
    EmptyManifest(&'static str),

    #[error("Unable to load manifest file {path}: {message}")]
    ManifestUnreadable { path: String, message: String },

    #[error("{stage} manifest differs {path}")]
    ManifestMismatch { stage: &'static str, path: String },

    #[error("Manifest has wrong number of files {actual} != {expected}")]
    ManifestFileCount { actual: usize, expected: usize },

    #[error("File {0} is listed more than once in manifest")]
    DuplicateManifestEntry(String),

    #[error("Temp manifest file already exists {0}")]
    TempManifestExists(String),

    #[error("Storage Block Already Exists! {0}")]
    BlockExists(String),

    #[error("Storage Block Does Not Exist! {0}")]
    BlockMissing(String),

    #[error("Dest file {0} already exists")]
    DestinationExists(String),

    #[error("Could not add {path} to manifest because it does not start with the base folder {base}")]
    OutsideBaseFolder { path: String, base: String },

    #[error("Shared and Local manifest mismatch for {0}")]
    SharedLocalMismatch(String),

    #[error("Local files in manifest {0} were tampered with")]
    Tampered(String),

    #[error("Wildcard {0} either has no star or it has more than one")]
    InvalidWildcard(String),

    #[error("Build Products cannot be found for node {0}")]
    BuildProductsMissing(String),

    // Infrastructure errors
    #[error("{what} is unavailable after {attempts} attempts: {path}")]
    Unavailable {
        what: &'static str,
        path: String,
        attempts: u32,
    },

    #[error("Could not find an appropriate shared temp folder {0}")]
    NoSharedFolder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Build errors
    #[error("Node {node} failed: {message}")]
    BuildFailed { node: String, message: String },

    #[error("Failing node {0} by request")]
    FakeFail(String),

    #[error("Node {node} was already processed")]
    AlreadyProcessed { node: String },

    #[error("Node {dependency} was not processed yet? Processing {node}")]
    NodeNotProcessed { dependency: String, node: String },

    #[error("Overlapping build product: {first} and {second} both produce {product}")]
    OverlappingBuildProduct {
        first: String,
        second: String,
        product: String,
    },

    #[error("Node {node} stomped Node {dependency}: {message}")]
    Stomped {
        node: String,
        dependency: String,
        message: String,
    },

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
