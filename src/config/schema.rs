use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KeepError, Result};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct StorageConfig {
    /// Where model artifacts live. Defaults to the per-user data directory.
    pub models_dir: Option<PathBuf>,
    /// Catalog JSON path. Defaults to the per-user config directory.
    pub catalog: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EngineConfig {
    /// Engine binary. When unset, `llama-server` is looked up in PATH.
    pub binary: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-process cap on simultaneously loaded models.
    #[serde(default = "default_models_max")]
    pub models_max: u32,
    /// Bind 0.0.0.0 instead of loopback.
    #[serde(default)]
    pub expose_network: bool,
    /// When set, the engine evicts idle models after this many seconds and
    /// the status loop reconciles the eviction locally.
    #[serde(default)]
    pub idle_sleep_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_health_poll_attempts")]
    pub health_poll_attempts: u32,
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    #[serde(default = "default_memory_poll_interval_ms")]
    pub memory_poll_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    /// Per-request timeout. Generous: artifacts are multi-gigabyte.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// Default value functions
fn default_port() -> u16 {
    8711
}
fn default_models_max() -> u32 {
    1
}
fn default_health_poll_interval_ms() -> u64 {
    2000
}
fn default_health_poll_attempts() -> u32 {
    15
}
fn default_status_poll_interval_ms() -> u64 {
    2000
}
fn default_memory_poll_interval_ms() -> u64 {
    2000
}
fn default_stop_grace_ms() -> u64 {
    2000
}
fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            port: default_port(),
            models_max: default_models_max(),
            expose_network: false,
            idle_sleep_secs: None,
            log_file: None,
            health_poll_interval_ms: default_health_poll_interval_ms(),
            health_poll_attempts: default_health_poll_attempts(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            memory_poll_interval_ms: default_memory_poll_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Resolved model directory (created by callers, not here).
    pub fn models_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.models_dir {
            return Ok(dir.clone());
        }
        let data = dirs::data_dir()
            .ok_or_else(|| KeepError::Config("cannot determine data directory".to_string()))?;
        Ok(data.join("llamakeep").join("models"))
    }

    /// Resolved catalog path.
    pub fn catalog_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.catalog {
            return Ok(path.clone());
        }
        let config = dirs::config_dir()
            .ok_or_else(|| KeepError::Config("cannot determine config directory".to_string()))?;
        Ok(config.join("llamakeep").join("catalog.json"))
    }
}
