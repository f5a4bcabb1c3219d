use crate::common::{FaceAuthError, Result};
use crate::core::types::Frame;
use crate::liveness::engine::RejectReason;
use crate::service::stats::StatsRegistry;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use image::ImageFormat;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

const LOG_FILE: &str = "attempts.log";
const SNAPSHOT_DIR: &str = "snapshots";

/// Evidence for one failed attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_id: u64,
    pub reason: RejectReason,
    pub frames: usize,
    pub finished_at: SystemTime,
    pub snapshot: Option<Frame>,
}

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: String,
    attempt_id: u64,
    reason: &'a str,
    frames: usize,
    snapshot: Option<String>,
}

enum LogCmd {
    Record(Box<AttemptRecord>),
    Flush(Sender<()>),
}

/// Asynchronous writer for failed-attempt records. Callers never block:
/// when the queue is full the record is dropped and counted.
pub struct AttemptLog {
    tx: Option<Sender<LogCmd>>,
    stats: Arc<StatsRegistry>,
    dir: PathBuf,
    worker: Option<thread::JoinHandle<()>>,
}

impl AttemptLog {
    pub fn start(dir: impl Into<PathBuf>, queue_depth: usize, stats: Arc<StatsRegistry>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SNAPSHOT_DIR))?;

        let (tx, rx) = bounded::<LogCmd>(queue_depth.max(1));
        let worker_dir = dir.clone();
        let worker = thread::Builder::new()
            .name("faceguard-attempt-log".into())
            .spawn(move || {
                for cmd in rx.iter() {
                    match cmd {
                        LogCmd::Record(record) => {
                            if let Err(e) = write_record(&worker_dir, &record) {
                                tracing::error!(attempt_id = record.attempt_id, "Failed to write attempt record: {}", e);
                            }
                        }
                        LogCmd::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;

        tracing::debug!("Attempt log at {}", dir.join(LOG_FILE).display());
        Ok(Self { tx: Some(tx), stats, dir, worker: Some(worker) })
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Queues a record. Returns false if it was dropped.
    pub fn record(&self, record: AttemptRecord) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        let attempt_id = record.attempt_id;
        match tx.try_send(LogCmd::Record(Box::new(record))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.record_log_dropped();
                tracing::warn!(attempt_id, "Attempt log queue full, record dropped");
                false
            }
        }
    }

    /// Blocks until every queued record is on disk.
    pub fn flush(&self) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| FaceAuthError::Other(anyhow::anyhow!("attempt log closed")))?;
        let (done_tx, done_rx) = bounded(1);
        tx.send(LogCmd::Flush(done_tx))
            .map_err(|_| FaceAuthError::Other(anyhow::anyhow!("attempt log writer stopped")))?;
        done_rx
            .recv()
            .map_err(|_| FaceAuthError::Other(anyhow::anyhow!("attempt log writer stopped")))
    }
}

impl Drop for AttemptLog {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish the backlog and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_record(dir: &Path, record: &AttemptRecord) -> Result<()> {
    let finished: DateTime<Utc> = record.finished_at.into();

    let snapshot = match &record.snapshot {
        Some(frame) => {
            let path = dir
                .join(SNAPSHOT_DIR)
                .join(format!("attempt-{}-{}.jpg", record.attempt_id, finished.format("%Y%m%dT%H%M%S")));
            frame.to_image()?.save_with_format(&path, ImageFormat::Jpeg)?;
            Some(path.display().to_string())
        }
        None => None,
    };

    let line = LogLine {
        timestamp: finished.to_rfc3339(),
        attempt_id: record.attempt_id,
        reason: record.reason.code(),
        frames: record.frames,
        snapshot,
    };
    let json = serde_json::to_string(&line)
        .map_err(|e| FaceAuthError::Other(anyhow::anyhow!("Failed to encode attempt record: {}", e)))?;

    let mut file = OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE))?;
    writeln!(file, "{}", json)?;
    Ok(())
}
