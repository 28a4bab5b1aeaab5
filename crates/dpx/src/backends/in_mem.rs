//! # Previously, on Dumpex...
//!
//! 🎬 The cluster was down. The laptop was on a plane. The tests still had to run.
//! So we built a search engine out of a `HashMap`, a `Mutex`, and sheer denial.
//!
//! [`InMemoryBackend`] implements the whole [`SearchEngine`] contract, including the
//! annoying part: bulk writes are invisible to search and scroll until `refresh`, while
//! single-document writes and `get` are realtime. Just like the real thing, minus the JVM.
//!
//! It also counts bulk calls and can be told to fail on purpose, because a test double
//! that can't misbehave is just a very polite liar.
//!
//! ⚠️ Not for production. If you deploy this, please also deploy a therapist. 🦆

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use crate::backends::{Hit, Query, ScrollPage, SearchEngine, SearchPage, SearchRequest};

#[derive(Debug, Default)]
struct IndexState {
    /// 🧠 the truth, as of the last write
    docs: BTreeMap<String, Value>,
    /// 👀 what search and scroll can see, as of the last refresh
    searchable: BTreeMap<String, Value>,
}

impl IndexState {
    /// ⚡ refresh=true semantics for single-document writes
    fn publish(&mut self, id: &str) {
        match self.docs.get(id) {
            Some(doc) => {
                self.searchable.insert(id.to_string(), doc.clone());
            }
            None => {
                self.searchable.remove(id);
            }
        }
    }
}

#[derive(Debug)]
struct OpenScroll {
    remaining: VecDeque<Hit>,
    page_size: usize,
}

#[derive(Debug, Default)]
struct MemState {
    indices: HashMap<String, IndexState>,
    scrolls: HashMap<String, OpenScroll>,
    next_doc_id: u64,
    next_scroll_id: u64,
    /// 📊 size of every bulk_index call, in order
    bulk_index_calls: Vec<usize>,
    /// 📊 size of every bulk_delete call, in order
    bulk_delete_calls: Vec<usize>,
    refresh_calls: usize,
    /// 💣 1-based bulk_index call numbers that should blow up
    failing_bulk_index_calls: HashSet<usize>,
    fail_bulk_deletes: bool,
    fail_refreshes: bool,
    /// ⏸️ while set, bulk_index calls park on it
    bulk_index_valve: Option<Arc<Semaphore>>,
}

impl MemState {
    fn index_mut(&mut self, index: &str) -> &mut IndexState {
        self.indices.entry(index.to_string()).or_default()
    }

    fn take_page(&mut self, scroll_id: &str) -> Result<ScrollPage> {
        let scroll = self
            .scrolls
            .get_mut(scroll_id)
            .with_context(|| format!("💀 Scroll '{scroll_id}' has expired or never existed"))?;
        let take = scroll.page_size.min(scroll.remaining.len());
        let hits = scroll.remaining.drain(..take).collect();
        Ok(ScrollPage {
            scroll_id: Some(scroll_id.to_string()),
            hits,
        })
    }
}

/// 📦 A search engine that fits in a `Vec`. Clone it to keep a peephole into the state
/// after handing the other copy to the pipeline.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💣 Make the n-th (1-based) `bulk_index` call fail.
    pub async fn fail_bulk_index_call(&self, call_number: usize) {
        self.state.lock().await.failing_bulk_index_calls.insert(call_number);
    }

    pub async fn fail_bulk_deletes(&self, fail: bool) {
        self.state.lock().await.fail_bulk_deletes = fail;
    }

    pub async fn fail_refreshes(&self, fail: bool) {
        self.state.lock().await.fail_refreshes = fail;
    }

    /// ⏸️ Park every `bulk_index` call from now on until the returned valve is closed.
    pub async fn hold_bulk_index(&self) -> Arc<Semaphore> {
        let valve = Arc::new(Semaphore::new(0));
        self.state.lock().await.bulk_index_valve = Some(Arc::clone(&valve));
        valve
    }

    /// 📊 Sizes of every bulk_index call so far, in call order.
    pub async fn bulk_index_calls(&self) -> Vec<usize> {
        self.state.lock().await.bulk_index_calls.clone()
    }

    /// 📊 Sizes of every bulk_delete call so far, in call order.
    pub async fn bulk_delete_calls(&self) -> Vec<usize> {
        self.state.lock().await.bulk_delete_calls.clone()
    }

    pub async fn refresh_calls(&self) -> usize {
        self.state.lock().await.refresh_calls
    }

    /// 🔢 Documents in an index, refreshed or not.
    pub async fn doc_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map_or(0, |state| state.docs.len())
    }

    /// 📜 Every document source in an index, refreshed or not, in id order.
    pub async fn docs(&self, index: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map(|state| state.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn index_exists(&self, index: &str) -> bool {
        self.state.lock().await.indices.contains_key(index)
    }

    pub async fn open_scrolls(&self) -> usize {
        self.state.lock().await.scrolls.len()
    }
}

/// 🎯 Does this source satisfy the query?
fn matches(query: &Query, source: &Value) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Term { field, value } => match source.get(field) {
            Some(Value::Array(items)) => items.contains(value),
            Some(found) => found == value,
            None => false,
        },
        Query::Phrase { text } => contains_text(source, &text.to_lowercase()),
    }
}

fn contains_text(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|item| contains_text(item, needle)),
        Value::Object(map) => map.values().any(|item| contains_text(item, needle)),
        Value::Number(n) => n.to_string() == needle,
        _ => false,
    }
}

/// 🔢 Numbers before strings, numbers by value, strings lexically, missing last.
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(_)), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Number(_))) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl SearchEngine for InMemoryBackend {
    async fn ping(&self) -> Result<()> {
        // 💓 always healthy. must be nice.
        Ok(())
    }

    async fn create_index_if_absent(&self, index: &str, _mapping: &Value) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.indices.contains_key(index) {
            return Ok(false);
        }
        state.indices.insert(index.to_string(), IndexState::default());
        Ok(true)
    }

    async fn bulk_index(&self, index: &str, sources: &[String]) -> Result<()> {
        let valve = self.state.lock().await.bulk_index_valve.clone();
        if let Some(valve) = valve {
            // 🚰 no permits are ever handed out, so this only returns once the valve closes
            let _closed = valve.acquire().await;
        }

        let mut state = self.state.lock().await;
        state.bulk_index_calls.push(sources.len());
        let call_number = state.bulk_index_calls.len();
        if state.failing_bulk_index_calls.contains(&call_number) {
            bail!("💀 In-memory bulk_index call #{call_number} failed, as requested by a test with trust issues");
        }

        // 🧪 parse everything first so a bad document fails the whole batch
        let parsed = sources
            .iter()
            .map(|source| serde_json::from_str::<Value>(source))
            .collect::<Result<Vec<_>, _>>()
            .context("💀 Bulk source was not valid JSON")?;
        for doc in parsed {
            state.next_doc_id += 1;
            let id = format!("mem-{}", state.next_doc_id);
            state.index_mut(index).docs.insert(id, doc);
        }
        Ok(())
    }

    async fn bulk_delete(&self, index: &str, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.bulk_delete_calls.push(ids.len());
        if state.fail_bulk_deletes {
            bail!("💀 In-memory bulk_delete failed on purpose");
        }
        let index_state = state.index_mut(index);
        for id in ids {
            index_state.docs.remove(id);
        }
        Ok(())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let state = self.state.lock().await;
        Ok(state.indices.get(index).and_then(|s| s.docs.get(id)).cloned())
    }

    async fn create(&self, index: &str, id: &str, source: &Value) -> Result<bool> {
        let mut state = self.state.lock().await;
        let index_state = state.index_mut(index);
        if index_state.docs.contains_key(id) {
            return Ok(false);
        }
        index_state.docs.insert(id.to_string(), source.clone());
        index_state.publish(id);
        Ok(true)
    }

    async fn update_field(&self, index: &str, id: &str, field: &str, value: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        let index_state = state.index_mut(index);
        let doc = index_state
            .docs
            .get_mut(id)
            .with_context(|| format!("💀 Cannot update '{field}' on missing document '{index}/{id}'"))?;
        let object = doc
            .as_object_mut()
            .with_context(|| format!("💀 Document '{index}/{id}' is not an object"))?;
        object.insert(field.to_string(), value);
        index_state.publish(id);
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let index_state = state.index_mut(index);
        let existed = index_state.docs.remove(id).is_some();
        index_state.publish(id);
        Ok(existed)
    }

    async fn open_scroll(&self, index: &str, query: &Query, page_size: usize) -> Result<ScrollPage> {
        let mut state = self.state.lock().await;
        let remaining: VecDeque<Hit> = state
            .indices
            .get(index)
            .map(|s| {
                s.searchable
                    .iter()
                    .filter(|(_, source)| matches(query, source))
                    .map(|(id, source)| Hit {
                        id: id.clone(),
                        source: source.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        state.next_scroll_id += 1;
        let scroll_id = format!("scroll-{}", state.next_scroll_id);
        state.scrolls.insert(
            scroll_id.clone(),
            OpenScroll {
                remaining,
                page_size: page_size.max(1),
            },
        );
        state.take_page(&scroll_id)
    }

    async fn continue_scroll(&self, scroll_id: &str) -> Result<ScrollPage> {
        self.state.lock().await.take_page(scroll_id)
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        self.state.lock().await.scrolls.remove(scroll_id);
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.refresh_calls += 1;
        if state.fail_refreshes {
            bail!("💀 In-memory refresh of '{index}' failed on purpose");
        }
        let index_state = state.index_mut(index);
        index_state.searchable = index_state.docs.clone();
        Ok(())
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage> {
        let state = self.state.lock().await;
        let mut hits: Vec<Hit> = state
            .indices
            .get(index)
            .map(|s| {
                s.searchable
                    .iter()
                    .filter(|(_, source)| matches(&request.query, source))
                    .map(|(id, source)| Hit {
                        id: id.clone(),
                        source: source.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(field) = &request.sort_by {
            hits.sort_by(|a, b| compare_field(a.source.get(field), b.source.get(field)));
        }

        let total = hits.len() as u64;
        let hits = hits.into_iter().skip(request.from).take(request.size).collect();
        Ok(SearchPage { total, hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn the_one_where_bulk_writes_hide_until_refresh() -> Result<()> {
        let backend = InMemoryBackend::new();
        backend
            .bulk_index("records", &[r#"{"origin_id":"a"}"#.to_string()])
            .await?;

        let everything = SearchRequest {
            query: Query::MatchAll,
            from: 0,
            size: 10,
            sort_by: None,
        };
        assert_eq!(backend.search("records", &everything).await?.total, 0);

        backend.refresh("records").await?;
        assert_eq!(backend.search("records", &everything).await?.total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_create_refuses_to_clobber() -> Result<()> {
        let backend = InMemoryBackend::new();
        assert!(backend.create("status", "abc", &json!({"status": 2})).await?);
        assert!(!backend.create("status", "abc", &json!({"status": 4})).await?);
        assert_eq!(backend.get("status", "abc").await?, Some(json!({"status": 2})));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_scroll_pages_until_the_well_is_dry() -> Result<()> {
        let backend = InMemoryBackend::new();
        let sources: Vec<String> = (0..5).map(|i| format!(r#"{{"origin_id":"x","n":{i}}}"#)).collect();
        backend.bulk_index("records", &sources).await?;
        backend.refresh("records").await?;

        let query = Query::term("origin_id", "x");
        let first = backend.open_scroll("records", &query, 2).await?;
        assert_eq!(first.hits.len(), 2);
        let scroll_id = first.scroll_id.clone().context("scroll id")?;
        assert_eq!(backend.continue_scroll(&scroll_id).await?.hits.len(), 2);
        assert_eq!(backend.continue_scroll(&scroll_id).await?.hits.len(), 1);
        assert!(backend.continue_scroll(&scroll_id).await?.hits.is_empty());

        backend.clear_scroll(&scroll_id).await?;
        assert_eq!(backend.open_scrolls().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_term_queries_look_inside_arrays_and_phrases_ignore_case() {
        let doc = json!({"origin": "Combo.txt", "data": ["alice", "hunter2"]});
        assert!(matches(&Query::term("data", "hunter2"), &doc));
        assert!(!matches(&Query::term("data", "hunter3"), &doc));
        assert!(matches(&Query::Phrase { text: "COMBO".into() }, &doc));
        assert!(!matches(&Query::Phrase { text: "bob".into() }, &doc));
    }

    #[tokio::test]
    async fn the_one_where_search_sorts_and_pages() -> Result<()> {
        let backend = InMemoryBackend::new();
        for (id, status) in [("a", 4), ("b", 0), ("c", 3)] {
            backend.create("status", id, &json!({"checksum": id, "status": status})).await?;
        }
        let page = backend
            .search(
                "status",
                &SearchRequest {
                    query: Query::MatchAll,
                    from: 1,
                    size: 1,
                    sort_by: Some("status".into()),
                },
            )
            .await?;
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].id, "c");
        Ok(())
    }
}
