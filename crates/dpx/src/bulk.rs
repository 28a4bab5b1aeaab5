//! 📦 The Bulk Writer: one batch in, one bulk request out, no second chances.
//!
//! Workers collect records in a [`Chunk`] and flush it through [`BulkWriter::insert_batch`]
//! when it fills up or when the line stream ends. The sweeper does the same with document
//! ids and [`BulkWriter::delete_batch`]. Each call is exactly one request, success or
//! failure as a unit. Retrying is somebody else's problem (nobody's).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::backends::{Backend, SearchEngine};
use crate::common::Record;

/// 🧺 A fixed-size accumulator. Full means flush.
#[derive(Debug)]
pub struct Chunk<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Chunk<T> {
    /// A zero capacity is bumped to 1. A chunk that is always full is still a chunk.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// ➕ Add one item. Returns the full batch once capacity is reached.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.items,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// 🚿 Whatever is left. `None` when empty, so empty batches never reach the wire.
    pub fn drain(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 🚚 Submits batches to one index. Cheap to clone, one per worker.
#[derive(Debug, Clone)]
pub struct BulkWriter {
    backend: Arc<Backend>,
    index: String,
    chunk_size: usize,
}

impl BulkWriter {
    pub fn new(backend: Arc<Backend>, index: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            backend,
            index: index.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// 🧺 An empty chunk sized for this writer.
    pub fn chunk<T>(&self) -> Chunk<T> {
        Chunk::new(self.chunk_size)
    }

    /// 📦 One bulk index request for the whole batch. Empty input sends nothing.
    pub async fn insert_batch(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sources = records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("💀 A record refused to become JSON. It had one job.")?;
        self.backend
            .bulk_index(&self.index, &sources)
            .await
            .with_context(|| format!("💀 Bulk insert of {} records into '{}' failed", records.len(), self.index))?;
        debug!("📦 inserted a batch of {} records into '{}'", records.len(), self.index);
        Ok(())
    }

    /// 🗑️ One bulk delete request for the whole batch of ids.
    pub async fn delete_batch(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.backend
            .bulk_delete(&self.index, ids)
            .await
            .with_context(|| format!("💀 Bulk delete of {} documents from '{}' failed", ids.len(), self.index))?;
        debug!("🗑️ deleted a batch of {} documents from '{}'", ids.len(), self.index);
        Ok(())
    }
}
