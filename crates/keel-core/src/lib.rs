//! Keel Core
//!
//! Error handling and run options shared by every Keel crate.

pub mod error;
pub mod options;

pub use error::{Error, Result};
pub use options::RunOptions;
