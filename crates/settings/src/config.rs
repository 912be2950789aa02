//! Settings file layout

use std::path::{Path, PathBuf};

use edgemesh_core::TunnelConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Root of the settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub modules: Modules,

    /// Where the settings were loaded from (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

/// Per-module sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modules {
    #[serde(default)]
    pub edge_tunnel: TunnelConfig,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(default_settings_path())
    }

    /// Load settings from `path`; a missing file yields defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings = Self::from_json(&content)?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(SettingsError::ParseError)
    }

    /// Save settings to the path they were loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(path)
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Check the tunnel section
    pub fn validate(&self) -> Result<()> {
        self.modules
            .edge_tunnel
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))
    }
}
