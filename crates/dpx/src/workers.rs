//! 🧵 Background workers. Each one owns a receiver, does its thing until the channel
//! closes, and hands back what it accomplished.

use std::ops::AddAssign;

use anyhow::Result;
use tokio::task::JoinHandle;

mod ingest_worker;
pub(crate) use ingest_worker::IngestWorker;

/// A background worker, that does work. duh.
pub trait Worker {
    fn start(self) -> JoinHandle<Result<WorkerStats>>;
}

/// 📊 What a worker did with the lines it got.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// ✅ records in batches the engine accepted
    pub records_indexed: u64,
    /// 🙈 lines the parser had nothing to say about
    pub lines_skipped: u64,
    /// 💀 bulk requests that failed
    pub failed_batches: u64,
    /// 🗑️ records lost with those failed batches
    pub records_dropped: u64,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.records_indexed += other.records_indexed;
        self.lines_skipped += other.lines_skipped;
        self.failed_batches += other.failed_batches;
        self.records_dropped += other.records_dropped;
    }
}
