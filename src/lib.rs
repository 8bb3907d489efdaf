//! llamakeep - single-host manager for local inference models
//!
//! Keeps a catalog of model builds, judges which ones fit this machine,
//! downloads them resumably, tracks what is installed, and supervises the
//! inference engine process that serves them.

pub mod catalog;
pub mod compat;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod inventory;
pub mod server;

pub use catalog::{Catalog, ModelVariant};
pub use config::Config;
pub use download::DownloadOrchestrator;
pub use error::{KeepError, Result};
pub use events::{Event, EventReceiver, EventSender};
pub use inventory::InventoryTracker;
pub use server::{EngineState, ProcessSupervisor};
