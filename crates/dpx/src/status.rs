//! 🗂️ The Status Store: one document per file, keyed by checksum, in its own index.
//!
//! Every write here is a single-document request with refresh semantics, so a client
//! polling the status index sees the change right away.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::backends::{Backend, Query, SearchEngine, SearchRequest};
use crate::common::{Status, StatusEntry, StatusPage};

#[derive(Debug, Clone)]
pub struct StatusStore {
    backend: Arc<Backend>,
    index: String,
}

fn decode_entry(checksum: &str, source: Value) -> Result<StatusEntry> {
    serde_json::from_value(source)
        .with_context(|| format!("💀 Status entry '{checksum}' is not shaped like a status entry"))
}

impl StatusStore {
    pub fn new(backend: Arc<Backend>, index: impl Into<String>) -> Self {
        Self {
            backend,
            index: index.into(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// ➕ Create-if-absent. `false` means an entry with this checksum already exists and
    /// was left alone.
    pub async fn create(&self, entry: &StatusEntry) -> Result<bool> {
        let source = serde_json::to_value(entry).context("💀 Status entry refused to serialize")?;
        self.backend
            .create(&self.index, &entry.checksum, &source)
            .await
            .with_context(|| format!("💀 Could not create status entry '{}'", entry.checksum))
    }

    pub async fn get(&self, checksum: &str) -> Result<Option<StatusEntry>> {
        let source = self
            .backend
            .get(&self.index, checksum)
            .await
            .with_context(|| format!("💀 Could not read status entry '{checksum}'"))?;
        source.map(|source| decode_entry(checksum, source)).transpose()
    }

    /// 🚦 Overwrite only the status field.
    pub async fn set_status(&self, checksum: &str, status: Status) -> Result<()> {
        self.backend
            .update_field(&self.index, checksum, "status", Value::from(u8::from(status)))
            .await
            .with_context(|| format!("💀 Could not move status entry '{checksum}' to {status}"))
    }

    /// 🗑️ `false` when there was no entry to remove.
    pub async fn remove(&self, checksum: &str) -> Result<bool> {
        self.backend
            .delete(&self.index, checksum)
            .await
            .with_context(|| format!("💀 Could not remove status entry '{checksum}'"))
    }

    /// 📚 One page of entries, sorted by status value so active jobs come first.
    pub async fn list(&self, from: usize, size: usize) -> Result<StatusPage> {
        let request = SearchRequest {
            query: Query::MatchAll,
            from,
            size,
            sort_by: Some("status".to_string()),
        };
        let page = self
            .backend
            .search(&self.index, &request)
            .await
            .context("💀 Could not list status entries")?;
        let results = page
            .hits
            .into_iter()
            .map(|hit| decode_entry(&hit.id, hit.source))
            .collect::<Result<Vec<_>>>()?;
        Ok(StatusPage {
            results,
            total: page.total,
        })
    }
}
