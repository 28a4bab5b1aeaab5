//! 🎬 The Ingestion Coordinator: one file, one job, one status entry, start to finish.
//!
//! ```text
//!  start_ingestion ─┬─ bad pattern / no columns ──▶ Err(IngestRejection)   (synchronous)
//!                   └─ spawn ─▶ checksum ─▶ create entry (Enqueued)
//!                                   │              └─ already tracked ─▶ Rejected
//!                                   ▼
//!                             acquire gate ─▶ Processing
//!                                   │
//!          reader ──lines──▶ [bounded queue] ──▶ N workers ──batches──▶ bulk index
//!                                   │
//!                       close queue, join workers, refresh
//!                                   ▼
//!                           Complete | Error ─▶ release gate
//! ```
//!
//! Per-job failures end up in the status entry. The caller of `start_ingestion` only
//! ever hears about input it got wrong.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_channel::Sender;
use futures::future::join_all;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app_config::RuntimeConfig;
use crate::backends::{Backend, SearchEngine};
use crate::bulk::BulkWriter;
use crate::checksum::compute_file_checksum;
use crate::common::{Status, StatusEntry};
use crate::gate::BusyGate;
use crate::parser::ParserConfig;
use crate::progress::ProgressMetrics;
use crate::status::StatusStore;
use crate::workers::{IngestWorker, Worker, WorkerStats};

// 📊 redraw progress every this many lines
const PROGRESS_EVERY_LINES: u64 = 10_000;

/// 🚫 Input refused before any work starts. Travels inside `anyhow::Error`; downcast to
/// tell it apart from infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestRejection {
    InvalidPattern { pattern: String, reason: String },
    NoColumns,
}

impl fmt::Display for IngestRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestRejection::InvalidPattern { pattern, reason } => {
                write!(f, "invalid pattern '{pattern}': {reason}")
            }
            IngestRejection::NoColumns => f.write_str("no columns selected"),
        }
    }
}

impl std::error::Error for IngestRejection {}

/// 📏 Read one line into `buf`, keeping at most `max` bytes of it plus the newline. A longer
/// line is consumed to its end without being buffered and comes back as `oversized`.
/// Returns the bytes consumed, 0 at end of input.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let mut read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if buf.len() <= max || buf.last() == Some(&b'\n') {
        return Ok((read, false));
    }

    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            match available.iter().position(|&b| b == b'\n') {
                Some(newline) => (newline + 1, true),
                None => (available.len(), available.is_empty()),
            }
        };
        reader.consume(used);
        read += used;
        if done {
            break;
        }
    }
    buf.clear();
    Ok((read, true))
}

/// 🏁 How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// the job ran; this is the final status it recorded
    Finished(Status),
    /// the checksum is already tracked; the existing entry was left alone
    Rejected { existing: Option<Status> },
    /// no status entry could be created, so there was nothing to track the job with
    Aborted,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Finished(status) => write!(f, "finished ({status})"),
            JobOutcome::Rejected { existing: Some(status) } => {
                write!(f, "rejected, already tracked as {status}")
            }
            JobOutcome::Rejected { existing: None } => f.write_str("rejected, already tracked"),
            JobOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub checksum: Option<String>,
    pub outcome: JobOutcome,
    pub stats: WorkerStats,
}

impl JobReport {
    fn aborted(checksum: Option<String>) -> Self {
        Self {
            checksum,
            outcome: JobOutcome::Aborted,
            stats: WorkerStats::default(),
        }
    }
}

/// 🎟️ A running job. Dropping it detaches the job; it keeps going regardless.
#[derive(Debug)]
pub struct JobHandle {
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// ⏳ Wait for the job to end.
    pub async fn wait(self) -> Result<JobReport> {
        self.task
            .await
            .context("💀 The ingestion task died before it could report back")
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    backend: Arc<Backend>,
    status: StatusStore,
    records: BulkWriter,
    gate: BusyGate,
    runtime: RuntimeConfig,
}

impl Coordinator {
    pub fn new(
        backend: Arc<Backend>,
        status: StatusStore,
        records: BulkWriter,
        gate: BusyGate,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            backend,
            status,
            records,
            gate,
            runtime,
        }
    }

    /// 🚀 Validate the input, then run the job on its own task and return right away.
    pub fn start_ingestion(
        &self,
        file_path: impl Into<PathBuf>,
        pattern: &str,
        columns: &[usize],
        original_filename: impl Into<String>,
    ) -> Result<JobHandle> {
        if columns.is_empty() {
            return Err(IngestRejection::NoColumns.into());
        }
        let parser = ParserConfig::new(pattern, columns).map_err(|err| IngestRejection::InvalidPattern {
            pattern: pattern.to_string(),
            reason: format!("{err:#}"),
        })?;

        let job = self.clone();
        let file_path = file_path.into();
        let original_filename = original_filename.into();
        let task = tokio::spawn(async move { job.run_job(file_path, parser, original_filename).await });
        Ok(JobHandle { task })
    }

    async fn run_job(self, file_path: PathBuf, parser: ParserConfig, filename: String) -> JobReport {
        let checksum = match compute_file_checksum(&file_path).await {
            Ok(checksum) => checksum,
            Err(err) => {
                error!("💀 ingestion of '{}' aborted, no checksum: {err:#}", file_path.display());
                return JobReport::aborted(None);
            }
        };

        let entry = StatusEntry::new(checksum.clone(), filename.clone(), Status::Enqueued);
        match self.status.create(&entry).await {
            Ok(true) => info!("📥 '{filename}' enqueued as {checksum}"),
            Ok(false) => {
                let existing = self.status.get(&checksum).await.ok().flatten().map(|e| e.status);
                warn!("🚫 '{filename}' is already tracked as {checksum}, not ingesting it again");
                return JobReport {
                    checksum: Some(checksum),
                    outcome: JobOutcome::Rejected { existing },
                    stats: WorkerStats::default(),
                };
            }
            Err(err) => {
                error!("💀 ingestion of '{filename}' aborted, status entry not created: {err:#}");
                return JobReport::aborted(Some(checksum));
            }
        }

        let _pass = self.gate.acquire().await;
        let (status, stats) = self.process(&file_path, parser, &filename, &checksum).await;

        if let Err(err) = self.status.set_status(&checksum, status).await {
            // 🚑 left as Processing; the next startup sweep turns it into Error
            error!("💀 could not record final status {status} for '{checksum}': {err:#}");
        }
        info!(
            "🏁 '{filename}' ({checksum}) is {status}: {} indexed, {} skipped, {} batches failed",
            stats.records_indexed, stats.lines_skipped, stats.failed_batches
        );
        JobReport {
            checksum: Some(checksum),
            outcome: JobOutcome::Finished(status),
            stats,
        }
    }

    /// 🏭 Everything between acquiring the gate and the final status.
    async fn process(&self, path: &Path, parser: ParserConfig, filename: &str, checksum: &str) -> (Status, WorkerStats) {
        if let Err(err) = self.status.set_status(checksum, Status::Processing).await {
            error!("💀 could not mark '{checksum}' as processing: {err:#}");
            return (Status::Error, WorkerStats::default());
        }

        let (stats, pumped) = self.pump(path, Arc::new(parser), filename, checksum).await;
        let mut status = Status::Complete;
        if let Err(err) = pumped {
            error!("💀 ingestion of '{filename}' failed: {err:#}");
            status = Status::Error;
        }
        if stats.failed_batches > 0 {
            error!(
                "💀 '{filename}' lost {} batches ({} records)",
                stats.failed_batches, stats.records_dropped
            );
            status = Status::Error;
        }

        // 🔄 refresh even after a failure, so whatever did land can be found and deleted
        if let Err(err) = self.backend.refresh(self.records.index()).await {
            error!("💀 refresh after '{filename}' failed: {err:#}");
            status = Status::Error;
        }
        (status, stats)
    }

    /// 🚰 Read the file into the queue, then close it and join every worker. Workers
    /// are joined even when reading fails halfway.
    async fn pump(&self, path: &Path, parser: Arc<ParserConfig>, filename: &str, checksum: &str) -> (WorkerStats, Result<()>) {
        let file = match File::open(path)
            .await
            .with_context(|| format!("💀 Could not open '{}'", path.display()))
        {
            Ok(file) => file,
            Err(err) => return (WorkerStats::default(), Err(err)),
        };

        let workers = self.runtime.effective_workers();
        let (tx, rx) = async_channel::bounded(self.runtime.effective_queue_capacity());
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                IngestWorker::new(
                    id,
                    rx.clone(),
                    Arc::clone(&parser),
                    self.records.clone(),
                    filename.to_string(),
                    checksum.to_string(),
                )
                .start()
            })
            .collect();
        drop(rx);
        debug!("🧵 {workers} workers started for '{filename}'");

        let mut stats = WorkerStats::default();
        let mut result = self
            .feed_lines(file, parser.start_line, filename, &tx)
            .await
            .map(|oversized| stats.lines_skipped += oversized);
        // 📪 closing the queue is the quit signal
        drop(tx);

        for (id, joined) in join_all(handles).await.into_iter().enumerate() {
            let failure = match joined {
                Ok(Ok(worker_stats)) => {
                    stats += worker_stats;
                    continue;
                }
                Ok(Err(err)) => err.context(format!("💀 Worker {id} failed")),
                Err(join_err) => anyhow::Error::new(join_err).context(format!("💀 Worker {id} panicked")),
            };
            error!("{failure:#}");
            if result.is_ok() {
                result = Err(failure);
            }
        }
        (stats, result)
    }

    /// 📖 Send every line from `start_line` on to the workers. Returns how many lines were
    /// too long to keep.
    async fn feed_lines(&self, file: File, start_line: usize, filename: &str, tx: &Sender<String>) -> Result<u64> {
        let total_size = file.metadata().await.map_or(0, |m| m.len());
        let mut progress = ProgressMetrics::new(filename.to_string(), total_size);
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_number = 0usize;
        let mut oversized_lines = 0u64;
        let (mut pending_bytes, mut pending_lines) = (0u64, 0u64);

        loop {
            let (read, oversized) = read_capped_line(&mut reader, &mut buf, self.runtime.max_line_bytes)
                .await
                .with_context(|| format!("💀 Read failed at line {line_number} of '{filename}'"))?;
            if read == 0 {
                break;
            }
            if line_number >= start_line && oversized {
                warn!(
                    "✂️ line {line_number} of '{filename}' is longer than {} bytes, skipping it",
                    self.runtime.max_line_bytes
                );
                oversized_lines += 1;
            } else if line_number >= start_line {
                // 🧹 dumps are rarely valid UTF-8 all the way through
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    bail!("💀 Every worker is gone, nobody is left to take lines from '{filename}'");
                }
            }
            line_number += 1;
            pending_bytes += read as u64;
            pending_lines += 1;
            if pending_lines >= PROGRESS_EVERY_LINES {
                progress.update(pending_bytes, pending_lines);
                (pending_bytes, pending_lines) = (0, 0);
            }
        }

        progress.update(pending_bytes, pending_lines);
        progress.finish();
        debug!(
            "📖 read {} lines ({} bytes) of '{filename}'",
            progress.lines_read(),
            progress.bytes_read()
        );
        Ok(oversized_lines)
    }
}
