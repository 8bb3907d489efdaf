use thiserror::Error;

/// Main error type for llamakeep
#[derive(Error, Debug)]
pub enum KeepError {
    #[error("Model '{model}' does not fit this machine: {reason}\n\nTroubleshooting:\n- Pick a smaller variant or a lower quantization\n- Close memory-hungry applications and retry\n- Check `llamakeep list` for builds marked compatible")]
    Incompatible { model: String, reason: String },

    #[error("Insufficient disk space: need {required} bytes, {available} available\n\nTroubleshooting:\n- Free space on the volume holding the model directory\n- Delete unused models: llamakeep delete <model>\n- Point storage.models_dir at a larger volume")]
    DiskSpace { required: u64, available: u64 },

    #[error("Download error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("Downloaded file failed validation at {path}: {reason}\n\nThe file was removed; re-run the download.")]
    Validation { path: String, reason: String },

    #[error("Failed to launch engine: {0}\n\nTroubleshooting:\n- Install llama-server and ensure it is in PATH\n- Or set engine.binary in ~/.config/llamakeep/config.toml")]
    Launch(String),

    #[error("Engine control plane error: {0}")]
    ControlPlane(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/llamakeep/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deletion incomplete for '{model}': {reason}\n\nThe model record is retained; retry the deletion.")]
    DeleteFailed { model: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KeepError>;
