//! 📡 The Elasticsearch backend: HTTP, NDJSON, and the occasional 409.
//!
//! Every [`SearchEngine`] primitive maps to one REST call. The abstract [`Query`] is
//! rendered into query DSL here and nowhere else.
//!
//! 🧠 Knowledge graph:
//! - bulk writes → `POST /_bulk` (NDJSON, optionally gzipped), per-item errors fail the call
//! - status writes → `_create` / `_update` / `_doc` with `refresh=true`, visible immediately
//! - cursor scans → `_search?scroll=1m` then `_search/scroll`, cleared when done
//! - auth: API key beats basic auth. This is not a democracy.
//! - every path segment is percent-encoded on its own, so a document id is only ever a
//!   document id, never `../_update/...`

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::backends::{Hit, Query, ScrollPage, SearchEngine, SearchPage, SearchRequest};

// ⏳ how long a scroll context lives between pages
const SCROLL_KEEP_ALIVE: &str = "1m";

/// 🔧 Where the cluster lives and how to talk to it.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    /// 📡 scheme + host + port. Yes, all of it.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 preferred over basic auth when both are set
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🫁 gzip bulk bodies; the cluster needs `http.compression` for this to pay off
    #[serde(default)]
    pub gzip_requests: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

// 🐢 bulk requests of 1000 records can take a moment on a cold cluster
fn default_request_timeout_secs() -> u64 {
    30
}

impl ElasticsearchConfig {
    /// 🏗️ Minimal config for a URL, everything else defaulted.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            gzip_requests: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

impl SearchResponse {
    fn into_hits(self) -> Vec<Hit> {
        self.hits
            .hits
            .into_iter()
            .map(|raw| Hit {
                id: raw.id,
                source: raw.source,
            })
            .collect()
    }
}

/// 🎨 Abstract query → query DSL.
fn render_query(query: &Query) -> Value {
    match query {
        Query::MatchAll => json!({ "match_all": {} }),
        Query::Term { field, value } => json!({ "term": { field.as_str(): value } }),
        // 📝 lenient so the integer fields of the index don't turn a phrase into a 400
        Query::Phrase { text } => json!({
            "multi_match": {
                "query": text,
                "type": "phrase",
                "fields": ["*"],
                "lenient": true
            }
        }),
    }
}

/// 📦 `{"index":{"_index":...}}` + source, per document. Ids are left to the cluster.
fn bulk_index_body(index: &str, sources: &[String]) -> String {
    let action = json!({ "index": { "_index": index } }).to_string();
    let estimated_size: usize = sources.iter().map(|s| s.len() + action.len() + 2).sum();
    let mut body = String::with_capacity(estimated_size);
    for source in sources {
        body.push_str(&action);
        body.push('\n');
        body.push_str(source);
        body.push('\n');
    }
    body
}

/// 🗑️ one `{"delete":{...}}` line per id, no source lines
fn bulk_delete_body(index: &str, ids: &[String]) -> String {
    let mut body = String::new();
    for id in ids {
        body.push_str(&json!({ "delete": { "_index": index, "_id": id } }).to_string());
        body.push('\n');
    }
    body
}

/// 🕵️ How many items of a bulk response carry an error, and the first reason.
fn bulk_failures(items: &[Value]) -> (usize, Option<String>) {
    let mut failed = 0;
    let mut first_reason = None;
    for item in items {
        let error = item
            .as_object()
            .and_then(|action| action.values().next())
            .and_then(|result| result.get("error"));
        if let Some(error) = error {
            failed += 1;
            if first_reason.is_none() {
                first_reason = Some(error.to_string());
            }
        }
    }
    (failed, first_reason)
}

/// 📡 Talks REST to one cluster. The `reqwest::Client` pools connections, so one of these
/// is shared by every worker.
#[derive(Debug)]
pub struct ElasticsearchBackend {
    client: reqwest::Client,
    base_url: Url,
    config: ElasticsearchConfig,
}

impl ElasticsearchBackend {
    /// 🚀 Build the HTTP client. No network traffic here; the health wait loop does that.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .with_context(|| format!("💀 '{}' is not a URL Elasticsearch could live at", config.url))?;
        if base_url.cannot_be_a_base() {
            bail!("💀 '{}' cannot carry a path, so it cannot be an Elasticsearch URL", config.url);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Probably a missing cert store or a cursed system OpenSSL.")?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// 🧭 Base URL plus path segments, each one percent-encoded on its own, plus query pairs.
    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        // 🚫 `.` and `..` would be dropped or resolved, and an empty segment is no name at all
        if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
            bail!("💀 '{bad}' cannot be used as an index name or document id");
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("💀 '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        // 🔒 api_key is the premium tier
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    fn json_request(&self, method: Method, url: Url, body: &Value) -> RequestBuilder {
        self.request(method, url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        request
            .send()
            .await
            .with_context(|| format!("💀 {what}: the request never made it to Elasticsearch. Check connectivity, timeouts, and your horoscope."))
    }

    /// 📬 Body of a 2xx response, or a bail with the status and whatever the cluster said.
    async fn success_body(response: Response, what: &str) -> Result<String> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("💀 {what}: Elasticsearch answered '{status}'. The body read: '{body}'");
        }
        Ok(body)
    }

    async fn submit_bulk(&self, body: String, documents: usize) -> Result<()> {
        let request = self
            .request(Method::POST, self.endpoint(&["_bulk"], &[])?)
            // ⚠️ x-ndjson, not json. The bulk API is picky about this.
            .header("Content-Type", "application/x-ndjson");

        let request = if self.config.gzip_requests {
            let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::fast());
            encoder
                .write_all(body.as_bytes())
                .context("💀 Gzip refused to squish the bulk body")?;
            let compressed = encoder.finish().context("💀 Gzip could not finish squishing")?;
            trace!("🫁 bulk body squished from {} to {} bytes", body.len(), compressed.len());
            request.header("Content-Encoding", "gzip").body(compressed)
        } else {
            request.body(body)
        };

        let response = self.send(request, "bulk").await?;
        let body = Self::success_body(response, "bulk").await?;
        let parsed: BulkResponse =
            serde_json::from_str(&body).context("💀 Bulk response was not the JSON we were promised")?;
        if parsed.errors {
            let (failed, first_reason) = bulk_failures(&parsed.items);
            bail!(
                "💀 Bulk request of {documents} documents came back with {failed} item errors. First one: {}",
                first_reason.unwrap_or_else(|| "<no reason given>".to_string())
            );
        }
        trace!("🚀 bulk of {documents} documents landed");
        Ok(())
    }

    async fn parse_search(response: Response, what: &str) -> Result<SearchResponse> {
        let body = Self::success_body(response, what).await?;
        serde_json::from_str(&body).with_context(|| format!("💀 {what}: search response did not parse"))
    }
}

#[async_trait]
impl SearchEngine for ElasticsearchBackend {
    async fn ping(&self) -> Result<()> {
        let url = self.endpoint(
            &["_cluster", "health"],
            &[("wait_for_status", "yellow"), ("timeout", "5s")],
        )?;
        let request = self.request(Method::GET, url);
        let response = self.send(request, "health check").await?;
        let body = Self::success_body(response, "health check").await?;
        let health: HealthResponse =
            serde_json::from_str(&body).context("💀 Cluster health response did not parse")?;
        if health.status == "red" {
            bail!("💀 Cluster is red. Nobody is writing anything today.");
        }
        debug!("💓 cluster health is {}", health.status);
        Ok(())
    }

    async fn create_index_if_absent(&self, index: &str, mapping: &Value) -> Result<bool> {
        let url = self.endpoint(&[index], &[])?;
        let response = self
            .send(self.request(Method::HEAD, url.clone()), "index exists check")
            .await?;
        match response.status() {
            StatusCode::OK => return Ok(false),
            StatusCode::NOT_FOUND => {}
            other => bail!("💀 Checking whether index '{index}' exists returned '{other}'"),
        }

        let response = self
            .send(self.json_request(Method::PUT, url, mapping), "create index")
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let body = response.text().await.unwrap_or_default();
        // 🏁 somebody else won the race to create it. fine by us.
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(false);
        }
        bail!("💀 Creating index '{index}' failed with '{status}': {body}")
    }

    async fn bulk_index(&self, index: &str, sources: &[String]) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        self.submit_bulk(bulk_index_body(index, sources), sources.len()).await
    }

    async fn bulk_delete(&self, index: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.submit_bulk(bulk_delete_body(index, ids), ids.len()).await
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let url = self.endpoint(&[index, "_doc", id], &[])?;
        let response = self.send(self.request(Method::GET, url), "get document").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::success_body(response, "get document").await?;
        let parsed: GetResponse =
            serde_json::from_str(&body).context("💀 Get response did not parse")?;
        Ok(if parsed.found { parsed.source } else { None })
    }

    async fn create(&self, index: &str, id: &str, source: &Value) -> Result<bool> {
        let url = self.endpoint(&[index, "_create", id], &[("refresh", "true")])?;
        let response = self
            .send(self.json_request(Method::PUT, url, source), "create document")
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        Self::success_body(response, "create document").await?;
        Ok(true)
    }

    async fn update_field(&self, index: &str, id: &str, field: &str, value: Value) -> Result<()> {
        let url = self.endpoint(&[index, "_update", id], &[("refresh", "true")])?;
        let body = json!({ "doc": { field: value } });
        let response = self
            .send(self.json_request(Method::POST, url, &body), "update document")
            .await?;
        Self::success_body(response, "update document").await?;
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        let url = self.endpoint(&[index, "_doc", id], &[("refresh", "true")])?;
        let response = self.send(self.request(Method::DELETE, url), "delete document").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::success_body(response, "delete document").await?;
        Ok(true)
    }

    async fn open_scroll(&self, index: &str, query: &Query, page_size: usize) -> Result<ScrollPage> {
        let url = self.endpoint(&[index, "_search"], &[("scroll", SCROLL_KEEP_ALIVE)])?;
        let body = json!({
            "size": page_size,
            "query": render_query(query),
            // 🏎️ _doc order: the cheapest sort there is
            "sort": ["_doc"],
        });
        let response = self.send(self.json_request(Method::POST, url, &body), "open scroll").await?;
        let parsed = Self::parse_search(response, "open scroll").await?;
        let scroll_id = parsed.scroll_id.clone();
        Ok(ScrollPage {
            scroll_id,
            hits: parsed.into_hits(),
        })
    }

    async fn continue_scroll(&self, scroll_id: &str) -> Result<ScrollPage> {
        let body = json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id });
        let response = self
            .send(
                self.json_request(Method::POST, self.endpoint(&["_search", "scroll"], &[])?, &body),
                "continue scroll",
            )
            .await?;
        let parsed = Self::parse_search(response, "continue scroll").await?;
        let scroll_id = parsed.scroll_id.clone();
        Ok(ScrollPage {
            scroll_id,
            hits: parsed.into_hits(),
        })
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let body = json!({ "scroll_id": [scroll_id] });
        let response = self
            .send(
                self.json_request(Method::DELETE, self.endpoint(&["_search", "scroll"], &[])?, &body),
                "clear scroll",
            )
            .await?;
        // 🤷 already expired is as good as cleared
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::success_body(response, "clear scroll").await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let response = self
            .send(self.request(Method::POST, self.endpoint(&[index, "_refresh"], &[])?), "refresh")
            .await?;
        Self::success_body(response, "refresh").await?;
        Ok(())
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchPage> {
        let mut body = json!({
            "from": request.from,
            "size": request.size,
            "query": render_query(&request.query),
            "track_total_hits": true,
        });
        if let Some(ref field) = request.sort_by {
            body["sort"] = json!([{ field.as_str(): { "order": "asc" } }]);
        }
        let response = self
            .send(
                self.json_request(Method::POST, self.endpoint(&[index, "_search"], &[])?, &body),
                "search",
            )
            .await?;
        let parsed = Self::parse_search(response, "search").await?;
        let total = parsed.hits.total.as_ref().map_or(0, |t| t.value);
        Ok(SearchPage {
            total,
            hits: parsed.into_hits(),
        })
    }
}
