//! EdgeMesh Core Types
//!
//! Shared data structures for the EdgeMesh tunnel overlay: configuration,
//! proxy request options, discovery kinds and the common error type.

mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;
