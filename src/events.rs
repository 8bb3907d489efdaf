//! Typed cross-component events.
//!
//! Components publish structured payloads over a tokio broadcast channel;
//! consumers (CLI, future UI layers) subscribe and filter. Send failures are
//! ignored; no subscriber simply means nobody is watching right now.

use tokio::sync::broadcast;

use crate::server::EngineState;

/// Everything the outer layers can observe.
#[derive(Debug, Clone)]
pub enum Event {
    /// Engine lifecycle transition.
    EngineStateChanged(EngineState),
    /// Fresh resident-memory sample for the engine process.
    EngineMemoryChanged { resident_bytes: u64 },
    /// Aggregated progress for one download job.
    DownloadProgress {
        model: String,
        completed: u64,
        total: u64,
    },
    /// All files of a job landed at their final paths.
    DownloadCompleted { model: String },
    /// A job was removed after an unrecoverable failure.
    DownloadFailed { model: String, reason: String },
    /// The installed set may have changed; re-query.
    InventoryChanged,
}

pub type EventSender = broadcast::Sender<Event>;
pub type EventReceiver = broadcast::Receiver<Event>;

/// Create the shared event channel. 256 slots: progress events are throttled
/// at the source, so a lagging receiver only ever skips stale progress.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}

/// Fire-and-forget publish helper.
pub fn emit(tx: &EventSender, event: Event) {
    let _ = tx.send(event);
}
