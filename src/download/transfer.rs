//! Single-file streaming transfer.
//!
//! Each worker owns exactly one temp file and reports to the dispatcher over
//! an mpsc channel; it never touches shared job state. Resume tokens are the
//! temp files themselves: the byte count already on disk becomes the Range
//! offset of the next request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Written events are rate-limited at the source; the dispatcher throttles
/// again per job, this just keeps the channel quiet.
const REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Worker-to-dispatcher callback. The dispatcher is the only consumer and
/// the only writer of job state.
#[derive(Debug)]
pub(crate) enum TransferEvent {
    Started {
        model: String,
        transfer_id: u64,
        expected_bytes: Option<u64>,
    },
    Written {
        model: String,
        transfer_id: u64,
        bytes_received: u64,
        expected_bytes: Option<u64>,
    },
    Finished {
        model: String,
        transfer_id: u64,
    },
    Failed {
        model: String,
        transfer_id: u64,
        reason: String,
    },
    Cancelled {
        model: String,
        transfer_id: u64,
    },
}

pub(crate) struct TransferSpec {
    pub model: String,
    pub transfer_id: u64,
    pub url: String,
    pub temp_path: PathBuf,
    pub cancel: CancellationToken,
    pub discard_on_cancel: Arc<AtomicBool>,
}

enum Outcome {
    Finished,
    Cancelled,
}

/// Drive one transfer to completion, reporting every outcome exactly once.
pub(crate) async fn run(
    client: reqwest::Client,
    spec: TransferSpec,
    tx: UnboundedSender<TransferEvent>,
) {
    let model = spec.model.clone();
    let transfer_id = spec.transfer_id;

    match stream_to_temp(&client, &spec, &tx).await {
        Ok(Outcome::Finished) => {
            let _ = tx.send(TransferEvent::Finished { model, transfer_id });
        }
        Ok(Outcome::Cancelled) => {
            if spec.discard_on_cancel.load(Ordering::SeqCst) {
                let _ = tokio::fs::remove_file(&spec.temp_path).await;
            }
            let _ = tx.send(TransferEvent::Cancelled { model, transfer_id });
        }
        Err(reason) => {
            warn!("transfer of {} failed: {reason}", spec.url);
            let _ = tx.send(TransferEvent::Failed {
                model,
                transfer_id,
                reason,
            });
        }
    }
}

async fn stream_to_temp(
    client: &reqwest::Client,
    spec: &TransferSpec,
    tx: &UnboundedSender<TransferEvent>,
) -> std::result::Result<Outcome, String> {
    if spec.cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    // Bytes already on disk from an earlier attempt.
    let resume_from = match tokio::fs::metadata(&spec.temp_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(&spec.url);
    if resume_from > 0 {
        debug!("resuming {} from byte {resume_from}", spec.url);
        request = request.header("Range", format!("bytes={resume_from}-"));
    }

    let response = tokio::select! {
        res = request.send() => res.map_err(|e| format!("request failed: {e}"))?,
        () = spec.cancel.cancelled() => return Ok(Outcome::Cancelled),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(format!("server returned {status}"));
    }

    // A 200 to a ranged request means the server ignored the Range header
    // and is sending the whole file; start over.
    let resumed = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
    let base = if resumed { resume_from } else { 0 };

    let expected_bytes = response.content_length().map(|len| base + len);
    let _ = tx.send(TransferEvent::Started {
        model: spec.model.clone(),
        transfer_id: spec.transfer_id,
        expected_bytes,
    });

    let mut file = OpenOptions::new()
        .create(true)
        .append(resumed)
        .write(true)
        .truncate(!resumed)
        .open(&spec.temp_path)
        .await
        .map_err(|e| format!("cannot open {}: {e}", spec.temp_path.display()))?;

    let mut received = base;
    let mut last_report = Instant::now();
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            () = spec.cancel.cancelled() => {
                file.flush().await.ok();
                return Ok(Outcome::Cancelled);
            }
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| format!("stream error: {e}"))?;

        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write failed: {e}"))?;
        received += chunk.len() as u64;

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            let _ = tx.send(TransferEvent::Written {
                model: spec.model.clone(),
                transfer_id: spec.transfer_id,
                bytes_received: received,
                expected_bytes,
            });
        }
    }

    file.flush()
        .await
        .map_err(|e| format!("flush failed: {e}"))?;

    // Final count, never throttled.
    let _ = tx.send(TransferEvent::Written {
        model: spec.model.clone(),
        transfer_id: spec.transfer_id,
        bytes_received: received,
        expected_bytes,
    });

    Ok(Outcome::Finished)
}
