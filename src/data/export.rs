//! Background export of sample batches.
//!
//! Batches are written one at a time, in submission order, on the blocking
//! pool so acquisition never waits on the disk. When the target cannot be written (typically because another
//! program holds the file open) the batch goes to a timestamped sibling file
//! instead, exactly once. The outcome comes back on the worker's result
//! channel so the caller can switch to the fallback file for later batches.

use super::storage::SampleSink;
use crate::core::Sample;
use crate::error::DaqError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcome of one export batch.
#[derive(Debug)]
pub enum ExportResult {
    /// The batch was appended to the requested file.
    Written {
        /// File written
        path: PathBuf,
        /// Rows appended
        rows: usize,
    },
    /// The requested file failed; the batch went to a fallback file.
    Fallback {
        /// File that could not be written
        requested: PathBuf,
        /// File written instead
        written: PathBuf,
        /// Rows appended
        rows: usize,
    },
    /// Both the requested and the fallback file failed.
    Failed(DaqError),
}

impl ExportResult {
    /// File later batches should go to, when this result changes it.
    pub fn redirect(&self) -> Option<&Path> {
        match self {
            ExportResult::Fallback { written, .. } => Some(written.as_path()),
            _ => None,
        }
    }
}

/// `<stem>_<YYYYmmdd_HHMMSS>.<ext>` next to `target`.
pub fn fallback_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "samples".to_string());
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let name = match target.extension() {
        Some(ext) => format!("{}_{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}_{}", stem, stamp),
    };
    target.with_file_name(name)
}

/// Writes `samples` to `target`, or to one fallback file if that fails.
pub fn export_batch(sink: &dyn SampleSink, target: &Path, samples: &[Sample]) -> ExportResult {
    let first_error = match sink.write_batch(target, samples) {
        Ok(rows) => {
            return ExportResult::Written {
                path: target.to_path_buf(),
                rows,
            }
        }
        Err(e) => e,
    };

    let fallback = fallback_path(target);
    warn!(
        path = %target.display(),
        fallback = %fallback.display(),
        "Export failed ({:#}), retrying with fallback file",
        first_error
    );
    match sink.write_batch(&fallback, samples) {
        Ok(rows) => ExportResult::Fallback {
            requested: target.to_path_buf(),
            written: fallback,
            rows,
        },
        Err(e) => ExportResult::Failed(DaqError::ExportFailure {
            target: target.to_path_buf(),
            reason: format!("{:#}; fallback '{}': {:#}", first_error, fallback.display(), e),
        }),
    }
}

struct ExportJob {
    samples: Vec<Sample>,
    target: PathBuf,
}

/// Runs export batches off the acquisition path.
///
/// One task owns the sink and takes batches from a queue, so two batches for
/// the same file never interleave.
pub struct ExportWorker {
    jobs: mpsc::UnboundedSender<ExportJob>,
    task: JoinHandle<()>,
}

impl ExportWorker {
    /// Starts a worker and returns the receiver its results are delivered on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sink: Arc<dyn SampleSink>) -> (Self, mpsc::UnboundedReceiver<ExportResult>) {
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (results, result_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(sink, job_rx, results));
        (Self { jobs, task }, result_rx)
    }

    /// Queues `samples` for `target`; returns immediately.
    pub fn submit(&self, samples: Vec<Sample>, target: PathBuf) -> Result<(), DaqError> {
        self.jobs
            .send(ExportJob { samples, target })
            .map_err(|rejected| DaqError::ExportFailure {
                target: rejected.0.target,
                reason: "export worker has stopped".to_string(),
            })
    }

    /// Writes every queued batch, then stops the worker.
    pub async fn finish(self) {
        drop(self.jobs);
        if let Err(e) = self.task.await {
            error!(error = %e, "Export worker ended abnormally");
        }
    }
}

async fn run(
    sink: Arc<dyn SampleSink>,
    mut jobs: mpsc::UnboundedReceiver<ExportJob>,
    results: mpsc::UnboundedSender<ExportResult>,
) {
    while let Some(job) = jobs.recv().await {
        let target = job.target.clone();
        let sink = Arc::clone(&sink);
        let result = tokio::task::spawn_blocking(move || {
            export_batch(sink.as_ref(), &job.target, &job.samples)
        })
        .await
        .unwrap_or_else(|e| {
            ExportResult::Failed(DaqError::ExportFailure {
                target,
                reason: format!("export task panicked: {}", e),
            })
        });
        if let ExportResult::Written { path, rows } = &result {
            info!(path = %path.display(), rows, "Exported sample batch");
        }
        // The receiver is gone only during shutdown.
        let _ = results.send(result);
    }
}
