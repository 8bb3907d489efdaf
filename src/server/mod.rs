//! Engine process supervision and its HTTP control plane.

pub mod control;
pub mod launch;
pub mod supervisor;

pub use control::ControlPlaneClient;
pub use supervisor::ProcessSupervisor;

use std::fmt;

/// Engine lifecycle. `Errored` is terminal until the next `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    /// Process spawned, readiness probe in progress.
    Loading,
    Running,
    Errored(EngineFault),
}

/// Why the engine left `Running`/`Loading` without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFault {
    /// The readiness probe never saw a healthy response.
    HealthCheckFailed,
    /// The process exited on its own. `None` means killed by signal.
    Crashed(Option<i32>),
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Loading => write!(f, "loading"),
            EngineState::Running => write!(f, "running"),
            EngineState::Errored(fault) => write!(f, "errored ({fault})"),
        }
    }
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFault::HealthCheckFailed => write!(f, "health check failed"),
            EngineFault::Crashed(Some(code)) => write!(f, "exited with code {code}"),
            EngineFault::Crashed(None) => write!(f, "killed by signal"),
        }
    }
}

/// Per-model status as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Loaded,
    Loading,
    Unloaded,
}

impl ModelStatus {
    /// Parse the engine's status string. Unrecognized values map to
    /// `Unloaded`, the safest assumption.
    #[must_use]
    pub fn from_value(value: &str) -> Self {
        match value {
            "loaded" => ModelStatus::Loaded,
            "loading" => ModelStatus::Loading,
            _ => ModelStatus::Unloaded,
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelStatus::Loaded => write!(f, "loaded"),
            ModelStatus::Loading => write!(f, "loading"),
            ModelStatus::Unloaded => write!(f, "unloaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_status_parsing() {
        assert_eq!(ModelStatus::from_value("loaded"), ModelStatus::Loaded);
        assert_eq!(ModelStatus::from_value("loading"), ModelStatus::Loading);
        assert_eq!(ModelStatus::from_value("unloaded"), ModelStatus::Unloaded);
        assert_eq!(ModelStatus::from_value("banana"), ModelStatus::Unloaded);
    }

    #[test]
    fn test_fault_display() {
        assert_eq!(
            EngineState::Errored(EngineFault::Crashed(Some(137))).to_string(),
            "errored (exited with code 137)"
        );
        assert_eq!(
            EngineState::Errored(EngineFault::HealthCheckFailed).to_string(),
            "errored (health check failed)"
        );
    }
}
