//! Download orchestration.
//!
//! One dispatcher task is the single writer of all job state. Transfer
//! workers stream bytes and report over an mpsc channel; `enqueue` and
//! `cancel` take the same jobs lock the dispatcher uses, so every mutation
//! is serialized and progress snapshots are always internally consistent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ModelVariant;
use crate::compat;
use crate::config::schema::DownloadConfig;
use crate::download::job::{DownloadJob, Subtask};
use crate::download::transfer::{self, TransferEvent, TransferSpec};
use crate::error::{KeepError, Result};
use crate::events::{emit, Event, EventSender};

/// Heuristic floor for files without an exact declared size: at least 1 MB,
/// and at least half the declared size up to a 10 MB cap.
fn minimum_plausible_size(declared: Option<u64>) -> u64 {
    const MB: u64 = 1_048_576;
    match declared {
        Some(size) => MB.max((size / 2).min(10 * MB)),
        None => MB,
    }
}

type Jobs = Arc<Mutex<HashMap<String, DownloadJob>>>;

pub struct DownloadOrchestrator {
    models_dir: PathBuf,
    host_mb: u64,
    jobs: Jobs,
    transfer_tx: UnboundedSender<TransferEvent>,
    events: EventSender,
    client: reqwest::Client,
    next_transfer_id: AtomicU64,
}

impl DownloadOrchestrator {
    /// Create the orchestrator and spawn its dispatcher task. The dispatcher
    /// exits when the orchestrator (and with it the channel sender) drops.
    pub fn new(
        models_dir: PathBuf,
        host_mb: u64,
        events: EventSender,
        config: &DownloadConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| KeepError::Network {
                url: String::new(),
                reason: format!("cannot build HTTP client: {e}"),
            })?;

        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let jobs: Jobs = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(dispatch_loop(
            transfer_rx,
            Arc::clone(&jobs),
            events.clone(),
        ));

        Ok(Self {
            models_dir,
            host_mb,
            jobs,
            transfer_tx,
            events,
            client,
            next_transfer_id: AtomicU64::new(1),
        })
    }

    /// Start acquiring a variant. Idempotent: a second enqueue for an
    /// in-flight model is a no-op. Compatibility and disk space are checked
    /// before any job state exists.
    pub fn enqueue(&self, variant: &ModelVariant) -> Result<()> {
        let verdict = compat::check(variant, self.host_mb, compat::MIN_CONTEXT_TOKENS);
        if !verdict.is_compatible() {
            return Err(KeepError::Incompatible {
                model: variant.id.clone(),
                reason: verdict.to_string(),
            });
        }

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&variant.id) {
            debug!("download of {} already in flight", variant.id);
            return Ok(());
        }

        let missing: Vec<_> = variant
            .sources()
            .into_iter()
            .filter(|s| !s.final_path(&self.models_dir).exists())
            .collect();

        if missing.is_empty() {
            info!("all files of {} already present", variant.id);
            emit(
                &self.events,
                Event::DownloadCompleted {
                    model: variant.id.clone(),
                },
            );
            return Ok(());
        }

        self.check_disk_space(variant, &missing)?;

        // Publish the job before any worker can call back, so every
        // callback finds it.
        let mut job = DownloadJob::new();
        let mut specs = Vec::with_capacity(missing.len());
        for source in &missing {
            let transfer_id = self.next_transfer_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let discard = Arc::new(AtomicBool::new(false));

            job.insert_subtask(
                transfer_id,
                Subtask {
                    url: source.url.clone(),
                    temp_path: source.temp_path(&self.models_dir),
                    final_path: source.final_path(&self.models_dir),
                    declared_size: source.declared_size,
                    exact_size: source.declared_size.is_some(),
                    sha256: matches!(source.kind, crate::catalog::ArtifactKind::Main)
                        .then(|| variant.sha256.clone())
                        .flatten(),
                    bytes_received: 0,
                    expected_bytes: source.declared_size,
                    cancel: cancel.clone(),
                    discard_on_cancel: Arc::clone(&discard),
                },
            );
            specs.push(TransferSpec {
                model: variant.id.clone(),
                transfer_id,
                url: source.url.clone(),
                temp_path: source.temp_path(&self.models_dir),
                cancel,
                discard_on_cancel: discard,
            });
        }

        info!("downloading {} ({} file(s))", variant.id, specs.len());
        jobs.insert(variant.id.clone(), job);
        drop(jobs);

        for spec in specs {
            tokio::spawn(transfer::run(
                self.client.clone(),
                spec,
                self.transfer_tx.clone(),
            ));
        }
        Ok(())
    }

    /// Cancel a job. With `discard`, partial files are removed; otherwise
    /// they stay behind as resume tokens for a later enqueue.
    pub fn cancel(&self, model_id: &str, discard: bool) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut job) = jobs.remove(model_id) else {
            return Err(KeepError::NotFound(format!(
                "no active download for '{model_id}'"
            )));
        };
        info!("cancelling download of {model_id} (discard: {discard})");
        job.cancel_all(discard);
        Ok(())
    }

    /// Aggregated (completed, total) bytes for an active job.
    #[must_use]
    pub fn progress(&self, model_id: &str) -> Option<(u64, u64)> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(model_id).map(DownloadJob::progress)
    }

    #[must_use]
    pub fn is_downloading(&self, model_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.contains_key(model_id)
    }

    /// Ids of all jobs currently in flight.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.keys().cloned().collect()
    }

    /// Preflight: the volume must hold the still-missing bytes. Shard sizes
    /// are not individually declared, so the check works from the variant
    /// total minus whatever is already on disk, final or partial.
    fn check_disk_space(
        &self,
        variant: &ModelVariant,
        missing: &[crate::catalog::ArtifactSource],
    ) -> Result<()> {
        let mut present: u64 = 0;
        for source in variant.sources() {
            let final_path = source.final_path(&self.models_dir);
            if final_path.exists() {
                present += std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
            }
        }
        for source in missing {
            let temp = source.temp_path(&self.models_dir);
            if temp.exists() {
                present += std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
            }
        }

        let required = variant.file_size_bytes.saturating_sub(present);
        let available = free_space(&self.models_dir)?;
        if available < required {
            return Err(KeepError::DiskSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}

/// Free bytes on the volume holding `path`.
fn free_space(path: &Path) -> Result<u64> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|e| KeepError::Config(format!("statvfs failed for {}: {e}", path.display())))?;
    Ok(stats.blocks_available() as u64 * stats.block_size() as u64)
}

/// Single consumer of worker callbacks; the only code path that advances,
/// finalizes, or fails jobs.
async fn dispatch_loop(mut rx: UnboundedReceiver<TransferEvent>, jobs: Jobs, events: EventSender) {
    while let Some(event) = rx.recv().await {
        match event {
            TransferEvent::Started {
                model,
                transfer_id,
                expected_bytes,
            } => {
                let mut map = jobs.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = map.get_mut(&model) {
                    job.record_expected(transfer_id, expected_bytes);
                }
            }
            TransferEvent::Written {
                model,
                transfer_id,
                bytes_received,
                expected_bytes,
            } => {
                let mut map = jobs.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = map.get_mut(&model) {
                    job.record_written(transfer_id, bytes_received, expected_bytes);
                    if job.should_notify(false) {
                        let (completed, total) = job.progress();
                        emit(
                            &events,
                            Event::DownloadProgress {
                                model: model.clone(),
                                completed,
                                total,
                            },
                        );
                    }
                }
            }
            TransferEvent::Finished { model, transfer_id } => {
                finalize_transfer(&jobs, &events, &model, transfer_id).await;
            }
            TransferEvent::Failed {
                model,
                transfer_id,
                reason,
            } => {
                fail_job(&jobs, &events, &model, transfer_id, reason);
            }
            TransferEvent::Cancelled { model, transfer_id } => {
                // Usually the job is already gone (cancel removed it); a
                // straggler entry is dropped without touching its temp file.
                let mut map = jobs.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = map.get_mut(&model) {
                    job.take_subtask(transfer_id);
                    if job.is_empty() {
                        map.remove(&model);
                    }
                }
            }
        }
    }
}

/// Validate a finished file, move it into place, and complete the job when
/// it was the last one. Validation failures are fatal for the whole job and
/// remove the offending file so a retry starts clean.
async fn finalize_transfer(jobs: &Jobs, events: &EventSender, model: &str, transfer_id: u64) {
    let subtask = {
        let mut map = jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = map.get_mut(model) else {
            return; // cancelled while the worker was finishing
        };
        job.take_subtask(transfer_id)
    };
    let Some(sub) = subtask else { return };

    let size = match tokio::fs::metadata(&sub.temp_path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            fail_job(
                jobs,
                events,
                model,
                transfer_id,
                format!("finished file missing: {e}"),
            );
            return;
        }
    };

    if let Err(e) = validate(&sub, size).await {
        warn!("{model}: {} failed validation: {e}", sub.url);
        let _ = tokio::fs::remove_file(&sub.temp_path).await;
        fail_job(jobs, events, model, transfer_id, e.to_string());
        return;
    }

    // Atomic move into place; a stale final file from an earlier install is
    // replaced by the rename.
    if let Err(e) = tokio::fs::rename(&sub.temp_path, &sub.final_path).await {
        fail_job(
            jobs,
            events,
            model,
            transfer_id,
            format!("cannot move {} into place: {e}", sub.temp_path.display()),
        );
        return;
    }
    debug!("{model}: {} installed", sub.final_path.display());

    let mut map = jobs.lock().unwrap_or_else(|e| e.into_inner());
    let Some(job) = map.get_mut(model) else { return };
    job.commit_bytes(size);
    let (completed, total) = job.progress();
    let done = job.is_empty();
    if done || job.should_notify(done) {
        emit(
            events,
            Event::DownloadProgress {
                model: model.to_string(),
                completed,
                total,
            },
        );
    }
    if done {
        map.remove(model);
        drop(map);
        info!("download of {model} complete ({completed} bytes)");
        emit(
            events,
            Event::DownloadCompleted {
                model: model.to_string(),
            },
        );
        emit(events, Event::InventoryChanged);
    }
}

/// Size and checksum validation for one finished file.
async fn validate(sub: &Subtask, size: u64) -> Result<()> {
    let fail = |reason: String| KeepError::Validation {
        path: sub.temp_path.display().to_string(),
        reason,
    };

    if sub.exact_size {
        if let Some(declared) = sub.declared_size {
            if size != declared {
                return Err(fail(format!(
                    "size mismatch: got {size} bytes, expected {declared}"
                )));
            }
        }
    } else {
        let floor = minimum_plausible_size(sub.declared_size);
        if size < floor {
            return Err(fail(format!(
                "implausibly small: {size} bytes, expected at least {floor}"
            )));
        }
    }

    if let Some(expected) = &sub.sha256 {
        let actual = sha256_of(&sub.temp_path)
            .await
            .map_err(|e| fail(format!("cannot hash file: {e}")))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(fail(format!(
                "sha256 mismatch: got {actual}, expected {expected}"
            )));
        }
    }
    Ok(())
}

async fn sha256_of(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Remove a failed job, cancel its siblings (keeping their temp files as
/// resume tokens), and report the failure once.
fn fail_job(jobs: &Jobs, events: &EventSender, model: &str, transfer_id: u64, reason: String) {
    let mut map = jobs.lock().unwrap_or_else(|e| e.into_inner());
    let Some(mut job) = map.remove(model) else { return };
    job.take_subtask(transfer_id);
    job.cancel_all(false);
    drop(map);
    warn!("download of {model} failed: {reason}");
    emit(
        events,
        Event::DownloadFailed {
            model: model.to_string(),
            reason,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_plausible_size_floor_is_1mb() {
        assert_eq!(minimum_plausible_size(None), 1_048_576);
        assert_eq!(minimum_plausible_size(Some(1000)), 1_048_576);
    }

    #[test]
    fn test_minimum_plausible_size_half_declared() {
        assert_eq!(minimum_plausible_size(Some(8_000_000)), 4_000_000);
    }

    #[test]
    fn test_minimum_plausible_size_capped_at_10mb() {
        assert_eq!(
            minimum_plausible_size(Some(4_000_000_000)),
            10 * 1_048_576
        );
    }
}
