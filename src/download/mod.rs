//! Resumable, concurrent model downloads.

mod job;
mod orchestrator;
mod transfer;

pub use job::DownloadJob;
pub use orchestrator::DownloadOrchestrator;
