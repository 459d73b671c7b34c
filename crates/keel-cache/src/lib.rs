//! Temp storage for build products.
//!
//! Build products are stored as blocks described by manifests, in a
//! disposable local tier and a shared tier that other machines read from.

pub mod config;
pub mod copy;
pub mod file_info;
pub mod layout;
pub mod manifest;
pub mod policy;
pub mod provider;
pub mod retry;
pub mod storage;

pub use config::StorageConfig;
pub use file_info::FileInfo;
pub use manifest::Manifest;
pub use policy::{ComparePolicy, NameRule};
pub use provider::{Retrieved, StorageProvider};
pub use retry::{RetryConfig, RetryPolicy};
pub use storage::TempStorage;
