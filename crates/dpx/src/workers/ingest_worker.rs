//! 🏭 The ingest worker: lines in, records out, one bulk request per full chunk.
//!
//! A closed, drained channel is the quit signal. The partial chunk is flushed on the
//! way out. A failed batch is logged and dropped; the coordinator turns a nonzero
//! `failed_batches` into a job-level `Error`.

use std::sync::Arc;

use anyhow::Result;
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bulk::BulkWriter;
use crate::common::Record;
use crate::parser::ParserConfig;
use crate::workers::{Worker, WorkerStats};

#[derive(Debug)]
pub(crate) struct IngestWorker {
    id: usize,
    lines: Receiver<String>,
    parser: Arc<ParserConfig>,
    writer: BulkWriter,
    origin: String,
    origin_id: String,
}

impl IngestWorker {
    pub(crate) fn new(
        id: usize,
        lines: Receiver<String>,
        parser: Arc<ParserConfig>,
        writer: BulkWriter,
        origin: String,
        origin_id: String,
    ) -> Self {
        Self {
            id,
            lines,
            parser,
            writer,
            origin,
            origin_id,
        }
    }

    async fn run(self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        let mut chunk = self.writer.chunk();

        while let Ok(line) = self.lines.recv().await {
            let Some(data) = self.parser.parse_line(&line) else {
                stats.lines_skipped += 1;
                continue;
            };
            let record = Record {
                origin: self.origin.clone(),
                origin_id: self.origin_id.clone(),
                data,
            };
            if let Some(batch) = chunk.push(record) {
                self.flush(batch, &mut stats).await;
            }
        }

        if let Some(rest) = chunk.drain() {
            self.flush(rest, &mut stats).await;
        }
        debug!("🏁 worker {} done: {:?}", self.id, stats);
        Ok(stats)
    }

    async fn flush(&self, batch: Vec<Record>, stats: &mut WorkerStats) {
        let size = batch.len() as u64;
        match self.writer.insert_batch(&batch).await {
            Ok(()) => stats.records_indexed += size,
            Err(err) => {
                warn!("⚠️ worker {} dropped a batch of {} records: {:#}", self.id, size, err);
                stats.failed_batches += 1;
                stats.records_dropped += size;
            }
        }
    }
}

impl Worker for IngestWorker {
    fn start(self) -> JoinHandle<Result<WorkerStats>> {
        tokio::spawn(self.run())
    }
}
