//! Engine launch preparation: binary resolution, generated launch config,
//! and command assembly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::catalog::Catalog;
use crate::compat;
use crate::config::schema::EngineConfig;
use crate::error::{KeepError, Result};

/// Engine launch config, regenerated on every start so it always reflects
/// the current installed set.
#[derive(Debug, Serialize)]
pub struct LaunchConfig {
    pub generated_at: String,
    pub models: Vec<PresetModel>,
}

#[derive(Debug, Serialize)]
pub struct PresetModel {
    pub id: String,
    pub path: PathBuf,
    pub ctx_size: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Resolve the engine binary: explicit config path first, then PATH lookup.
/// Fails before anything is spawned.
pub fn resolve_binary(config: &EngineConfig) -> Result<PathBuf> {
    if let Some(binary) = &config.binary {
        if !binary.exists() {
            return Err(KeepError::Launch(format!(
                "configured engine binary does not exist: {}",
                binary.display()
            )));
        }
        return Ok(binary.clone());
    }
    which::which("llama-server")
        .map_err(|_| KeepError::Launch("llama-server not found in PATH".to_string()))
}

/// Build the launch config from the currently installed variants, sizing each
/// model's context to what this host can afford.
#[must_use]
pub fn build_launch_config(catalog: &Catalog, models_dir: &Path, host_mb: u64) -> LaunchConfig {
    let models = catalog
        .variants()
        .iter()
        .filter(|v| v.is_installed(models_dir))
        .filter_map(|v| {
            let ctx = compat::usable_context_window(v, host_mb, v.max_context)?;
            Some(PresetModel {
                id: v.id.clone(),
                path: v.sources()[0].final_path(models_dir),
                ctx_size: ctx,
                args: v.launch_args.clone(),
            })
        })
        .collect();

    LaunchConfig {
        generated_at: chrono::Utc::now().to_rfc3339(),
        models,
    }
}

/// Write the launch config atomically (temp file + rename).
pub fn write_launch_config(config: &LaunchConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| KeepError::Launch(format!("cannot serialize launch config: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    debug!("wrote launch config to {}", path.display());
    Ok(())
}

/// Assemble the engine command. Stdout/stderr are piped so the supervisor
/// can forward engine output to the log stream.
#[must_use]
pub fn build_command(binary: &Path, config: &EngineConfig, launch_config: &Path) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("--config")
        .arg(launch_config)
        .arg("--port")
        .arg(config.port.to_string())
        .arg("--models-max")
        .arg(config.models_max.to_string());

    if config.expose_network {
        cmd.arg("--host").arg("0.0.0.0");
    }
    if let Some(secs) = config.idle_sleep_secs {
        cmd.arg("--sleep-idle-seconds").arg(secs.to_string());
    }
    if let Some(log_file) = &config.log_file {
        cmd.arg("--log-file").arg(log_file);
    }

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(false);
    cmd
}
