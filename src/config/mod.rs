//! Configuration module for llamakeep
//!
//! Loads config from `$XDG_CONFIG_HOME/llamakeep/config.toml` or
//! `~/.config/llamakeep/config.toml`. Falls back to defaults if the file
//! doesn't exist; partial configs are merged with defaults via serde's
//! default attributes.

pub mod schema;

pub use schema::Config;

use std::path::PathBuf;

use crate::error::{KeepError, Result};

impl Config {
    /// Load config from the user config directory, defaulting when absent.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| KeepError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Path of the config file.
    pub fn path() -> Result<PathBuf> {
        let config_dir = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg)
        } else {
            dirs::home_dir()
                .ok_or_else(|| KeepError::Config("HOME env var not set".to_string()))?
                .join(".config")
        };
        Ok(config_dir.join("llamakeep").join("config.toml"))
    }
}
