//! 🧹 The Cleanup Sweeper: cursor scans that fix things up after the fact.
//!
//! Two jobs, one technique:
//! - **recovery**: find status entries stuck in a transient state (the process died
//!   mid-job) and mark them `Error`.
//! - **deletion**: find every record of one file, page by page, and bulk delete them.
//!
//! Both walk a [`Cursor`] page by page. The full result set is never held in memory,
//! which matters when one file is 200 million records. 🦆

use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{error, info, warn};

use crate::backends::{Backend, Hit, Query, SearchEngine};
use crate::bulk::BulkWriter;
use crate::common::Status;
use crate::gate::BusyGate;
use crate::status::StatusStore;

// 🔁 passes over the records of one file before giving up on a purge
const MAX_PURGE_PASSES: usize = 5;

/// 📜 A lazy sequence of pages over one query. Opens on the first `next_page`, can be
/// restarted from a fresh snapshot, and must be `close`d to free the server-side context.
#[derive(Debug)]
pub struct Cursor {
    backend: Arc<Backend>,
    index: String,
    query: Query,
    page_size: usize,
    scroll_id: Option<String>,
    opened: bool,
    exhausted: bool,
}

impl Cursor {
    pub fn new(backend: Arc<Backend>, index: impl Into<String>, query: Query, page_size: usize) -> Self {
        Self {
            backend,
            index: index.into(),
            query,
            page_size: page_size.max(1),
            scroll_id: None,
            opened: false,
            exhausted: false,
        }
    }

    /// 📄 The next non-empty page, or `None` once the scan is done.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Hit>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = if !self.opened {
            self.opened = true;
            self.backend
                .open_scroll(&self.index, &self.query, self.page_size)
                .await?
        } else {
            match self.scroll_id {
                Some(ref scroll_id) => self.backend.continue_scroll(scroll_id).await?,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        };

        if page.scroll_id.is_some() {
            self.scroll_id = page.scroll_id;
        }
        if page.hits.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(page.hits))
    }

    /// 🔄 Drop the current snapshot; the next `next_page` opens a new one.
    pub async fn restart(&mut self) -> Result<()> {
        self.release().await?;
        self.opened = false;
        self.exhausted = false;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.release().await
    }

    async fn release(&mut self) -> Result<()> {
        match self.scroll_id.take() {
            Some(scroll_id) => self.backend.clear_scroll(&scroll_id).await,
            None => Ok(()),
        }
    }
}

/// 🧾 How a deletion request ended, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// ✅ status entry gone, along with this many records
    Deleted { records: usize },
    /// 🤷 no status entry for that checksum
    NotFound,
    /// 🚫 a job owns the entry right now
    Refused(Status),
}

impl fmt::Display for DeleteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteOutcome::Deleted { records } => write!(f, "deleted ({records} records)"),
            DeleteOutcome::NotFound => f.write_str("not found"),
            DeleteOutcome::Refused(status) => write!(f, "refused, entry is {status}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    backend: Arc<Backend>,
    status: StatusStore,
    records: BulkWriter,
    gate: BusyGate,
    page_size: usize,
}

impl Sweeper {
    pub fn new(
        backend: Arc<Backend>,
        status: StatusStore,
        records: BulkWriter,
        gate: BusyGate,
        page_size: usize,
    ) -> Self {
        Self {
            backend,
            status,
            records,
            gate,
            page_size,
        }
    }

    /// 🔀 Rewrite every status entry in `target` to `replacement`. Entries that fail to
    /// update are logged and skipped; the count is of entries actually rewritten.
    pub async fn sweep(&self, target: Status, replacement: Status) -> Result<usize> {
        let mut cursor = Cursor::new(
            Arc::clone(&self.backend),
            self.status.index(),
            Query::term("status", u8::from(target)),
            self.page_size,
        );

        let scanned = async {
            let mut rewritten = 0;
            while let Some(hits) = cursor.next_page().await? {
                for hit in hits {
                    match self.status.set_status(&hit.id, replacement).await {
                        Ok(()) => rewritten += 1,
                        Err(err) => warn!("⚠️ could not move '{}' from {target} to {replacement}: {err:#}", hit.id),
                    }
                }
            }
            Ok::<_, anyhow::Error>(rewritten)
        }
        .await;

        if let Err(err) = cursor.close().await {
            warn!("⚠️ could not clear the status scroll: {err:#}");
        }
        let rewritten = scanned?;
        if rewritten > 0 {
            info!("🧹 swept {rewritten} status entries from {target} to {replacement}");
        }
        Ok(rewritten)
    }

    /// 🚑 Startup recovery: whatever was in flight when the process died is now `Error`.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for stuck in [Status::Processing, Status::Enqueued, Status::Deleting] {
            recovered += self.sweep(stuck, Status::Error).await?;
        }
        Ok(recovered)
    }

    /// 🗑️ Delete one file: all its records, then its status entry. Holds the gate for the
    /// whole operation. Any failure leaves the entry in `Error`.
    pub async fn delete_all_for(&self, checksum: &str) -> Result<DeleteOutcome> {
        let _pass = self.gate.acquire().await;

        let Some(entry) = self.status.get(checksum).await? else {
            return Ok(DeleteOutcome::NotFound);
        };
        // 🚫 Enqueued means a job is waiting for this very gate
        if matches!(entry.status, Status::Enqueued | Status::Processing) {
            warn!("🚫 refusing to delete '{checksum}', it is {}", entry.status);
            return Ok(DeleteOutcome::Refused(entry.status));
        }

        match self.run_deletion(checksum).await {
            Ok(records) => {
                info!("🗑️ deleted '{checksum}' ({}) and {records} records", entry.filename);
                Ok(DeleteOutcome::Deleted { records })
            }
            Err(err) => {
                error!("💀 deletion of '{checksum}' failed: {err:#}");
                if let Err(status_err) = self.status.set_status(checksum, Status::Error).await {
                    error!("💀 and '{checksum}' could not even be marked as error: {status_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn run_deletion(&self, checksum: &str) -> Result<usize> {
        self.status.set_status(checksum, Status::Deleting).await?;
        let records = self.purge_records(checksum).await?;
        self.status.remove(checksum).await?;
        Ok(records)
    }

    /// 🔥 Remove every record whose `origin_id` is `checksum`. Each pass refreshes, scans
    /// and bulk deletes; a pass that finds nothing ends the purge.
    pub async fn purge_records(&self, checksum: &str) -> Result<usize> {
        let mut cursor = Cursor::new(
            Arc::clone(&self.backend),
            self.records.index(),
            Query::term("origin_id", checksum),
            self.page_size,
        );

        let purged = self.purge_passes(&mut cursor, checksum).await;
        if let Err(err) = cursor.close().await {
            warn!("⚠️ could not clear the records scroll: {err:#}");
        }
        purged
    }

    async fn purge_passes(&self, cursor: &mut Cursor, checksum: &str) -> Result<usize> {
        let mut total = 0;
        for pass in 1..=MAX_PURGE_PASSES {
            self.backend.refresh(self.records.index()).await?;
            if pass > 1 {
                cursor.restart().await?;
            }
            let deleted = self.purge_pass(cursor).await?;
            if deleted == 0 {
                return Ok(total);
            }
            total += deleted;
        }
        bail!("💀 Records of '{checksum}' kept showing up after {MAX_PURGE_PASSES} purge passes")
    }

    async fn purge_pass(&self, cursor: &mut Cursor) -> Result<usize> {
        let mut deleted = 0;
        let mut chunk = self.records.chunk();
        while let Some(hits) = cursor.next_page().await? {
            for hit in hits {
                if let Some(batch) = chunk.push(hit.id) {
                    self.records.delete_batch(&batch).await?;
                    deleted += batch.len();
                }
            }
        }
        if let Some(rest) = chunk.drain() {
            self.records.delete_batch(&rest).await?;
            deleted += rest.len();
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use crate::common::{Record, StatusEntry};
    use anyhow::Context;
    use std::time::Duration;

    const RECORDS: &str = "dump-hub";
    const STATUS: &str = "dump-hub-status";

    struct Fixture {
        mem: InMemoryBackend,
        status: StatusStore,
        records: BulkWriter,
        sweeper: Sweeper,
        gate: BusyGate,
    }

    fn fixture(chunk_size: usize, page_size: usize) -> Fixture {
        let mem = InMemoryBackend::new();
        let backend = Arc::new(Backend::InMemory(mem.clone()));
        let status = StatusStore::new(Arc::clone(&backend), STATUS);
        let records = BulkWriter::new(Arc::clone(&backend), RECORDS, chunk_size);
        let gate = BusyGate::new(Duration::from_millis(1));
        let sweeper = Sweeper::new(backend, status.clone(), records.clone(), gate.clone(), page_size);
        Fixture {
            mem,
            status,
            records,
            sweeper,
            gate,
        }
    }

    async fn seed(fx: &Fixture, checksum: &str, count: usize) -> Result<()> {
        let batch: Vec<Record> = (0..count)
            .map(|n| Record {
                origin: format!("{checksum}.txt"),
                origin_id: checksum.to_string(),
                data: vec![n.to_string()],
            })
            .collect();
        fx.records.insert_batch(&batch).await?;
        fx.status
            .create(&StatusEntry::new(checksum.into(), format!("{checksum}.txt"), Status::Complete))
            .await?;
        Ok(())
    }

    async fn records_of(fx: &Fixture, checksum: &str) -> usize {
        fx.mem
            .docs(RECORDS)
            .await
            .iter()
            .filter(|doc| doc["origin_id"] == checksum)
            .count()
    }

    #[tokio::test]
    async fn the_one_where_the_cursor_pages_until_empty() -> Result<()> {
        let fx = fixture(10, 4);
        seed(&fx, "abc", 10).await?;
        fx.mem.refresh(RECORDS).await?;

        let mut cursor = Cursor::new(
            Arc::new(Backend::InMemory(fx.mem.clone())),
            RECORDS,
            Query::term("origin_id", "abc"),
            4,
        );
        let mut sizes = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(cursor.next_page().await?, None);
        cursor.close().await?;
        assert_eq!(fx.mem.open_scrolls().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_crash_leaves_nothing_in_flight() -> Result<()> {
        let fx = fixture(10, 2);
        for (checksum, status) in [
            ("p", Status::Processing),
            ("e", Status::Enqueued),
            ("d", Status::Deleting),
            ("c", Status::Complete),
            ("x", Status::Error),
        ] {
            fx.status
                .create(&StatusEntry::new(checksum.into(), "f.txt".into(), status))
                .await?;
        }

        assert_eq!(fx.sweeper.recover().await?, 3);

        for checksum in ["p", "e", "d", "x"] {
            let entry = fx.status.get(checksum).await?.context("entry should survive")?;
            assert_eq!(entry.status, Status::Error, "{checksum} should be error");
        }
        let complete = fx.status.get("c").await?.context("entry should survive")?;
        assert_eq!(complete.status, Status::Complete);
        assert_eq!(fx.mem.open_scrolls().await, 0);

        // 🔁 nothing left to recover the second time around
        assert_eq!(fx.sweeper.recover().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_deletion_leaves_no_trace() -> Result<()> {
        let fx = fixture(10, 7);
        seed(&fx, "abc", 25).await?;
        seed(&fx, "xyz", 5).await?;

        let outcome = fx.sweeper.delete_all_for("abc").await?;

        assert_eq!(outcome, DeleteOutcome::Deleted { records: 25 });
        assert_eq!(records_of(&fx, "abc").await, 0);
        assert_eq!(records_of(&fx, "xyz").await, 5);
        assert_eq!(fx.status.get("abc").await?, None);
        assert!(fx.status.get("xyz").await?.is_some());
        assert_eq!(fx.mem.bulk_delete_calls().await, vec![10, 10, 5]);
        assert_eq!(fx.mem.open_scrolls().await, 0);
        assert!(!fx.gate.is_busy());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_unknown_checksum_is_not_found() -> Result<()> {
        let fx = fixture(10, 7);
        assert_eq!(fx.sweeper.delete_all_for("nope").await?, DeleteOutcome::NotFound);
        assert!(fx.mem.bulk_delete_calls().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_queued_job_keeps_its_entry() -> Result<()> {
        let fx = fixture(10, 7);
        fx.status
            .create(&StatusEntry::new("abc".into(), "f.txt".into(), Status::Enqueued))
            .await?;

        assert_eq!(
            fx.sweeper.delete_all_for("abc").await?,
            DeleteOutcome::Refused(Status::Enqueued)
        );
        let entry = fx.status.get("abc").await?.context("entry should survive")?;
        assert_eq!(entry.status, Status::Enqueued);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_delete_ends_in_error_not_limbo() -> Result<()> {
        let fx = fixture(10, 7);
        seed(&fx, "abc", 3).await?;
        fx.mem.fail_bulk_deletes(true).await;

        assert!(fx.sweeper.delete_all_for("abc").await.is_err());

        let entry = fx.status.get("abc").await?.context("entry should stay put")?;
        assert_eq!(entry.status, Status::Error);
        assert_eq!(fx.mem.open_scrolls().await, 0);
        assert!(!fx.gate.is_busy());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_error_entry_can_still_be_deleted() -> Result<()> {
        let fx = fixture(10, 7);
        seed(&fx, "abc", 3).await?;
        fx.status.set_status("abc", Status::Error).await?;

        assert_eq!(
            fx.sweeper.delete_all_for("abc").await?,
            DeleteOutcome::Deleted { records: 3 }
        );
        Ok(())
    }
}
