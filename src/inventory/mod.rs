//! Installed-model tracking.
//!
//! There is no installed-set database: the filesystem is the source of
//! truth and every query scans it fresh, so files added or removed behind
//! our back are picked up on the next look.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ModelVariant};
use crate::download::DownloadOrchestrator;
use crate::error::{KeepError, Result};
use crate::events::{emit, Event, EventSender};
use crate::server::ProcessSupervisor;

#[derive(Debug, Default)]
struct ScanState {
    running: bool,
    /// A refresh arrived while a scan was in flight; run once more.
    dirty: bool,
}

pub struct InventoryTracker {
    models_dir: PathBuf,
    events: EventSender,
    scan: Arc<Mutex<ScanState>>,
}

impl InventoryTracker {
    #[must_use]
    pub fn new(models_dir: PathBuf, events: EventSender) -> Self {
        Self {
            models_dir,
            events,
            scan: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    #[must_use]
    pub fn models_dir(&self) -> &PathBuf {
        &self.models_dir
    }

    /// Fresh filesystem check: every required file of the variant exists.
    #[must_use]
    pub fn is_installed(&self, variant: &ModelVariant) -> bool {
        variant.is_installed(&self.models_dir)
    }

    /// All catalog variants currently installed.
    #[must_use]
    pub fn installed<'a>(&self, catalog: &'a Catalog) -> Vec<&'a ModelVariant> {
        catalog
            .variants()
            .iter()
            .filter(|v| self.is_installed(v))
            .collect()
    }

    /// Trigger a rescan. Non-blocking; a burst of triggers collapses into
    /// one scan (plus one follow-up if more arrived mid-scan), each ending
    /// in a single `InventoryChanged`.
    pub fn refresh(&self) {
        {
            let mut state = self.scan.lock().unwrap_or_else(|e| e.into_inner());
            if state.running {
                state.dirty = true;
                return;
            }
            state.running = true;
        }

        let models_dir = self.models_dir.clone();
        let events = self.events.clone();
        let scan = Arc::clone(&self.scan);
        tokio::spawn(async move {
            loop {
                let dir = models_dir.clone();
                let count = tokio::task::spawn_blocking(move || scan_dir(&dir))
                    .await
                    .unwrap_or(0);
                debug!("inventory scan found {count} artifact(s)");
                emit(&events, Event::InventoryChanged);

                let mut state = scan.lock().unwrap_or_else(|e| e.into_inner());
                if state.dirty {
                    state.dirty = false;
                } else {
                    state.running = false;
                    return;
                }
            }
        });
    }

    /// Remove a variant's local files. The engine is stopped first when the
    /// variant is active, and an in-flight download is cancelled with its
    /// partial data discarded. Partial failure leaves the surviving files
    /// (and thus the installed record) in place for a retry.
    pub async fn delete(
        &self,
        variant: &ModelVariant,
        supervisor: &ProcessSupervisor,
        downloads: &DownloadOrchestrator,
    ) -> Result<()> {
        if supervisor.model_is_active(&variant.id) {
            info!("{} is active, stopping the engine before deletion", variant.id);
            supervisor.stop().await?;
        }
        if downloads.is_downloading(&variant.id) {
            downloads.cancel(&variant.id, true)?;
        }

        let mut failures = Vec::new();
        for source in variant.sources() {
            for path in [
                source.final_path(&self.models_dir),
                source.temp_path(&self.models_dir),
            ] {
                if !path.exists() {
                    continue;
                }
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("cannot remove {}: {e}", path.display());
                    failures.push(format!("{}: {e}", path.display()));
                }
            }
        }

        emit(&self.events, Event::InventoryChanged);

        if failures.is_empty() {
            info!("deleted {}", variant.id);
            Ok(())
        } else {
            Err(KeepError::DeleteFailed {
                model: variant.id.clone(),
                reason: failures.join("; "),
            })
        }
    }
}

fn scan_dir(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
        })
        .count()
}
