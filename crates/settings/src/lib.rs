//! EdgeMesh Settings
//!
//! Settings file handling for the tunnel agent.
//!
//! ## Features
//!
//! - `modules.edgeTunnel` section holding the tunnel configuration
//! - JSON load/save with per-field defaults
//! - Polling watcher that reports edits to the settings file
//!
//! ## Usage
//!
//! ```no_run
//! use edgemesh_settings::Settings;
//!
//! let mut settings = Settings::load_from("/etc/edgemesh/edgemesh-tunnel.json")?;
//! settings.modules.edge_tunnel.node_name = "edge-1".to_string();
//! settings.save()?;
//! # Ok::<(), edgemesh_settings::SettingsError>(())
//! ```

mod config;
mod watcher;

pub use config::{Modules, Settings};
pub use watcher::{ConfigWatcher, DEFAULT_POLL_INTERVAL};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Default settings file path
pub fn default_settings_path() -> PathBuf {
    PathBuf::from("/etc/edgemesh/edgemesh-tunnel.json")
}
