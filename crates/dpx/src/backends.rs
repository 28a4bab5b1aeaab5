//! 🔌 Backends: where the search engine lives, or pretends to.
//!
//! The core never speaks a query language. It builds a [`Query`], hands it to a
//! [`SearchEngine`], and gets documents back. Elasticsearch turns that into JSON DSL and
//! HTTP; the in-memory backend turns it into a `HashMap` lookup and a warm feeling.
//!
//! ⚠️ Eventual visibility is part of the contract: bulk writes become searchable after a
//! `refresh`. Single-document writes (`create`, `update_field`, `delete`) are visible
//! immediately. Code that forgets to refresh will find out in production. 🦆

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchBackend, ElasticsearchConfig};
pub use in_mem::InMemoryBackend;

/// 🔍 The handful of query shapes the core needs. Nothing more, on purpose.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// 🌍 everything
    MatchAll,
    /// 🎯 exact value on one field (keyword / integer)
    Term { field: String, value: Value },
    /// 📝 phrase match across every field
    Phrase { text: String },
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// 📄 One document as the engine returns it: id plus source.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

/// 📜 One page of a cursor scan. `scroll_id` is the bookmark for the next page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub hits: Vec<Hit>,
}

/// 🔎 A from/size search, optionally sorted ascending on one field.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Query,
    pub from: usize,
    pub size: usize,
    pub sort_by: Option<String>,
}

/// 📚 Search results plus the total match count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<Hit>,
}

/// 🗄️ Everything the core asks of a search engine.
///
/// # Contract
/// - `bulk_index` / `bulk_delete`: one request, all-or-nothing from the caller's point of
///   view. Any per-item failure fails the whole call. Never retried here.
/// - `create` returns `false` when a document with that id already exists.
/// - `delete` returns `false` when there was nothing to delete.
/// - scrolls are snapshots: writing while scrolling does not move the cursor.
#[async_trait]
pub trait SearchEngine: std::fmt::Debug + Send + Sync {
    /// 💓 Is the cluster up and at least yellow?
    async fn ping(&self) -> Result<()>;
    /// 🏗️ Returns `true` when the index was created, `false` when it already existed.
    async fn create_index_if_absent(&self, index: &str, mapping: &Value) -> Result<bool>;
    /// 📦 Index serialized JSON documents with engine-assigned ids.
    async fn bulk_index(&self, index: &str, sources: &[String]) -> Result<()>;
    /// 🗑️ Delete documents by id.
    async fn bulk_delete(&self, index: &str, ids: &[String]) -> Result<()>;
    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>>;
    async fn create(&self, index: &str, id: &str, source: &Value) -> Result<bool>;
    async fn update_field(&self, index: &str, id: &str, field: &str, value: Value) -> Result<()>;
    async fn delete(&self, index: &str, id: &str) -> Result<bool>;
    async fn open_scroll(&self, index: &str, query: &Query, page_size: usize) -> Result<ScrollPage>;
    async fn continue_scroll(&self, scroll_id: &str) -> Result<ScrollPage>;
    async fn clear_scroll(&self, scroll_id: &str) -> Result<()>;
    /// 🔄 Make recent bulk writes visible to search and scroll.
    async fn refresh(&self, index: &str) -> Result<()>;
    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage>;
}

/// 🎭 The casting agency: one enum, every backend, static dispatch.
#[derive(Debug)]
pub enum Backend {
    InMemory(InMemoryBackend),
    Elasticsearch(ElasticsearchBackend),
}

#[async_trait]
impl SearchEngine for Backend {
    async fn ping(&self) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.ping().await,
            Backend::Elasticsearch(b) => b.ping().await,
        }
    }

    async fn create_index_if_absent(&self, index: &str, mapping: &Value) -> Result<bool> {
        match self {
            Backend::InMemory(b) => b.create_index_if_absent(index, mapping).await,
            Backend::Elasticsearch(b) => b.create_index_if_absent(index, mapping).await,
        }
    }

    async fn bulk_index(&self, index: &str, sources: &[String]) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.bulk_index(index, sources).await,
            Backend::Elasticsearch(b) => b.bulk_index(index, sources).await,
        }
    }

    async fn bulk_delete(&self, index: &str, ids: &[String]) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.bulk_delete(index, ids).await,
            Backend::Elasticsearch(b) => b.bulk_delete(index, ids).await,
        }
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        match self {
            Backend::InMemory(b) => b.get(index, id).await,
            Backend::Elasticsearch(b) => b.get(index, id).await,
        }
    }

    async fn create(&self, index: &str, id: &str, source: &Value) -> Result<bool> {
        match self {
            Backend::InMemory(b) => b.create(index, id, source).await,
            Backend::Elasticsearch(b) => b.create(index, id, source).await,
        }
    }

    async fn update_field(&self, index: &str, id: &str, field: &str, value: Value) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.update_field(index, id, field, value).await,
            Backend::Elasticsearch(b) => b.update_field(index, id, field, value).await,
        }
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        match self {
            Backend::InMemory(b) => b.delete(index, id).await,
            Backend::Elasticsearch(b) => b.delete(index, id).await,
        }
    }

    async fn open_scroll(&self, index: &str, query: &Query, page_size: usize) -> Result<ScrollPage> {
        match self {
            Backend::InMemory(b) => b.open_scroll(index, query, page_size).await,
            Backend::Elasticsearch(b) => b.open_scroll(index, query, page_size).await,
        }
    }

    async fn continue_scroll(&self, scroll_id: &str) -> Result<ScrollPage> {
        match self {
            Backend::InMemory(b) => b.continue_scroll(scroll_id).await,
            Backend::Elasticsearch(b) => b.continue_scroll(scroll_id).await,
        }
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.clear_scroll(scroll_id).await,
            Backend::Elasticsearch(b) => b.clear_scroll(scroll_id).await,
        }
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.refresh(index).await,
            Backend::Elasticsearch(b) => b.refresh(index).await,
        }
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage> {
        match self {
            Backend::InMemory(b) => b.search(index, request).await,
            Backend::Elasticsearch(b) => b.search(index, request).await,
        }
    }
}
