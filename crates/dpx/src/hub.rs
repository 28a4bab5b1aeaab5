//! 🏛️ The Hub: everything wired together behind one handle.
//!
//! Startup is strictly ordered: wait for the cluster, make sure both indices exist,
//! sweep up whatever the last process left in flight. Only then does a [`Hub`] exist,
//! so only then can anyone start a job.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::app_config::{AppConfig, IndicesConfig, RuntimeConfig};
use crate::backends::{Backend, ElasticsearchBackend, Query, SearchEngine, SearchRequest};
use crate::bulk::BulkWriter;
use crate::common::{Record, RecordPage, StatusEntry, StatusPage};
use crate::coordinator::{Coordinator, JobHandle};
use crate::gate::BusyGate;
use crate::status::StatusStore;
use crate::sweeper::{DeleteOutcome, Sweeper};

fn records_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "origin": { "type": "keyword" },
                "origin_id": { "type": "keyword" },
                "data": { "type": "text" }
            }
        }
    })
}

fn status_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "date": { "type": "keyword" },
                "filename": { "type": "keyword" },
                "checksum": { "type": "keyword" },
                "status": { "type": "integer" }
            }
        }
    })
}

/// 💓 Ping until the cluster answers. `health_max_attempts == 0` waits forever.
async fn wait_for_cluster(backend: &Backend, runtime: &RuntimeConfig) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match backend.ping().await {
            Ok(()) => {
                info!("💓 cluster is up (attempt {attempt})");
                return Ok(());
            }
            Err(err) if runtime.health_max_attempts > 0 && attempt >= runtime.health_max_attempts => {
                return Err(err).with_context(|| {
                    format!("💀 Cluster still unreachable after {attempt} attempts. Giving up.")
                });
            }
            Err(err) => {
                warn!(
                    "⏳ cluster not ready (attempt {attempt}), retrying in {:?}: {err:#}",
                    runtime.health_retry_interval()
                );
                tokio::time::sleep(runtime.health_retry_interval()).await;
            }
        }
    }
}

async fn bootstrap_indices(backend: &Backend, indices: &IndicesConfig) -> Result<()> {
    if indices.records == indices.status {
        bail!("💀 Records and status share the index '{}'. They need one each.", indices.records);
    }
    for (index, mapping) in [(&indices.records, records_mapping()), (&indices.status, status_mapping())] {
        let created = backend
            .create_index_if_absent(index, &mapping)
            .await
            .with_context(|| format!("💀 Could not bootstrap index '{index}'"))?;
        if created {
            info!("🏗️ created index '{index}'");
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct Hub {
    backend: Arc<Backend>,
    records_index: String,
    status: StatusStore,
    gate: BusyGate,
    coordinator: Coordinator,
    sweeper: Sweeper,
    recovered: usize,
}

impl Hub {
    /// 🚀 Connect to Elasticsearch and run the startup sequence.
    pub async fn start(config: &AppConfig) -> Result<Self> {
        let backend = ElasticsearchBackend::new(config.elasticsearch.clone())?;
        Self::start_with(Backend::Elasticsearch(backend), &config.indices, &config.runtime).await
    }

    /// 🚀 Same startup sequence, any backend.
    pub async fn start_with(backend: Backend, indices: &IndicesConfig, runtime: &RuntimeConfig) -> Result<Self> {
        let backend = Arc::new(backend);
        wait_for_cluster(&backend, runtime).await?;
        bootstrap_indices(&backend, indices).await?;

        let status = StatusStore::new(Arc::clone(&backend), indices.status.clone());
        let records = BulkWriter::new(Arc::clone(&backend), indices.records.clone(), runtime.chunk_size);
        let gate = BusyGate::new(runtime.gate_poll_interval());
        let coordinator = Coordinator::new(
            Arc::clone(&backend),
            status.clone(),
            records.clone(),
            gate.clone(),
            runtime.clone(),
        );
        let sweeper = Sweeper::new(
            Arc::clone(&backend),
            status.clone(),
            records,
            gate.clone(),
            runtime.scroll_page_size,
        );

        let recovered = sweeper
            .recover()
            .await
            .context("💀 Startup recovery sweep failed")?;
        if recovered > 0 {
            warn!("🚑 {recovered} entries were in flight when the last process stopped; they are now error");
        }

        Ok(Self {
            backend,
            records_index: indices.records.clone(),
            status,
            gate,
            coordinator,
            sweeper,
            recovered,
        })
    }

    /// 🚑 How many entries the startup sweep moved to `Error`.
    pub fn recovered_on_startup(&self) -> usize {
        self.recovered
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn start_ingestion(
        &self,
        file_path: impl Into<std::path::PathBuf>,
        pattern: &str,
        columns: &[usize],
        original_filename: impl Into<String>,
    ) -> Result<JobHandle> {
        self.coordinator
            .start_ingestion(file_path, pattern, columns, original_filename)
    }

    pub async fn delete_all_for(&self, checksum: &str) -> Result<DeleteOutcome> {
        self.sweeper.delete_all_for(checksum).await
    }

    pub async fn get_status(&self, checksum: &str) -> Result<Option<StatusEntry>> {
        self.status.get(checksum).await
    }

    pub async fn list_status(&self, from: usize, size: usize) -> Result<StatusPage> {
        self.status.list(from, size).await
    }

    /// 🔍 Records matching a phrase. Empty or `*` lists everything.
    pub async fn search(&self, query: &str, from: usize, size: usize) -> Result<RecordPage> {
        let query = match query.trim() {
            "" | "*" => Query::MatchAll,
            text => Query::Phrase { text: text.to_string() },
        };
        let request = SearchRequest {
            query,
            from,
            size,
            sort_by: None,
        };
        let page = self
            .backend
            .search(&self.records_index, &request)
            .await
            .context("💀 Record search failed")?;
        let results = page
            .hits
            .into_iter()
            .map(|hit| {
                serde_json::from_value::<Record>(hit.source)
                    .with_context(|| format!("💀 Record '{}' is not shaped like a record", hit.id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordPage {
            results,
            total: page.total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ElasticsearchConfig, InMemoryBackend};
    use crate::checksum::compute_file_checksum;
    use crate::common::Status;
    use crate::coordinator::JobOutcome;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_runtime() -> RuntimeConfig {
        RuntimeConfig {
            chunk_size: 2,
            workers: 2,
            gate_poll_millis: 2,
            health_retry_secs: 0,
            ..RuntimeConfig::default()
        }
    }

    async fn hub_over(mem: &InMemoryBackend) -> Result<Hub> {
        Hub::start_with(Backend::InMemory(mem.clone()), &IndicesConfig::default(), &quick_runtime()).await
    }

    fn dump_file(contents: &str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn ingest_to_completion(hub: &Hub, contents: &str, name: &str) -> Result<String> {
        let file = dump_file(contents)?;
        let report = hub.start_ingestion(file.path(), "{0}{:}", &[0, 1], name)?.wait().await?;
        assert_eq!(report.outcome, JobOutcome::Finished(Status::Complete));
        report.checksum.context("a finished job has a checksum")
    }

    async fn wait_for_status(hub: &Hub, checksum: &str, wanted: Status) -> Result<()> {
        for _ in 0..1000 {
            if hub.get_status(checksum).await?.map(|e| e.status) == Some(wanted) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bail!("'{checksum}' never became {wanted}")
    }

    #[tokio::test]
    async fn the_one_where_startup_builds_indices_and_cleans_up() -> Result<()> {
        let mem = InMemoryBackend::new();
        let leftover = StatusEntry::new("abc".into(), "crashed.txt".into(), Status::Processing);
        mem.create("dump-hub-status", "abc", &serde_json::to_value(&leftover)?)
            .await?;

        let hub = hub_over(&mem).await?;

        assert!(mem.index_exists("dump-hub").await);
        assert!(mem.index_exists("dump-hub-status").await);
        assert_eq!(hub.recovered_on_startup(), 1);
        let entry = hub.get_status("abc").await?.context("entry should survive")?;
        assert_eq!(entry.status, Status::Error);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dump_goes_in_gets_found_and_goes_away() -> Result<()> {
        let mem = InMemoryBackend::new();
        let hub = hub_over(&mem).await?;
        let mut file = NamedTempFile::new()?;
        file.write_all(b"alice@example.com:hunter2\nbob@example.com:letmein\ncarol@example.com:hunter2\n")?;
        file.flush()?;

        let report = hub
            .start_ingestion(file.path(), "{0}{:}", &[0, 1], "leak.txt")?
            .wait()
            .await?;
        assert_eq!(report.outcome, JobOutcome::Finished(Status::Complete));
        let checksum = report.checksum.context("checksum")?;

        let everything = hub.search("*", 0, 10).await?;
        assert_eq!(everything.total, 3);
        let hunters = hub.search("hunter2", 0, 10).await?;
        assert_eq!(hunters.total, 2);
        assert!(hunters.results.iter().all(|r| r.origin == "leak.txt"));
        let paged = hub.search("", 2, 10).await?;
        assert_eq!(paged.results.len(), 1);
        assert_eq!(paged.total, 3);

        let listing = hub.list_status(0, 10).await?;
        assert_eq!(listing.total, 1);

        assert_eq!(
            hub.delete_all_for(&checksum).await?,
            DeleteOutcome::Deleted { records: 3 }
        );
        assert_eq!(hub.search("*", 0, 10).await?.total, 0);
        assert_eq!(hub.get_status(&checksum).await?, None);
        assert!(!hub.is_busy());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_index_for_everything_is_refused() {
        let indices = IndicesConfig {
            records: "same".into(),
            status: "same".into(),
        };
        let started = Hub::start_with(Backend::InMemory(InMemoryBackend::new()), &indices, &quick_runtime()).await;
        assert!(started.is_err());
    }

    #[tokio::test]
    async fn the_one_where_a_dead_cluster_eventually_gets_given_up_on() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let config = AppConfig {
            elasticsearch: ElasticsearchConfig::for_url(server.uri()),
            indices: IndicesConfig::default(),
            runtime: RuntimeConfig {
                health_max_attempts: 3,
                ..quick_runtime()
            },
        };
        assert!(Hub::start(&config).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_startup_talks_to_a_real_shaped_cluster() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "green"})))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/dump-hub"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/dump-hub-status"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/dump-hub-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;
        // 🧹 three recovery sweeps, each finding nothing
        Mock::given(method("POST"))
            .and(path("/dump-hub-status/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "empty",
                "hits": {"hits": []}
            })))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true})))
            .expect(3)
            .mount(&server)
            .await;

        let config = AppConfig {
            elasticsearch: ElasticsearchConfig::for_url(server.uri()),
            indices: IndicesConfig::default(),
            runtime: quick_runtime(),
        };
        let hub = Hub::start(&config).await?;
        assert_eq!(hub.recovered_on_startup(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_only_one_job_is_ever_busy_at_a_time() -> Result<()> {
        let mem = InMemoryBackend::new();
        let runtime = RuntimeConfig {
            chunk_size: 50,
            ..quick_runtime()
        };
        let hub = Arc::new(Hub::start_with(Backend::InMemory(mem.clone()), &IndicesConfig::default(), &runtime).await?);
        let doomed = ingest_to_completion(&hub, "old@example.com:pw\n", "old.txt").await?;

        let files = (0..4)
            .map(|n| dump_file(&(0..3000).map(|i| format!("user{n}-{i}:pw{i}\n")).collect::<String>()))
            .collect::<Result<Vec<_>>>()?;
        let jobs = files
            .iter()
            .enumerate()
            .map(|(n, file)| hub.start_ingestion(file.path(), "{0}{:}", &[0, 1], format!("dump{n}.txt")))
            .collect::<Result<Vec<_>>>()?;
        let deleter = Arc::clone(&hub);
        let deletion = tokio::spawn(async move { deleter.delete_all_for(&doomed).await });

        let mut most_busy = 0;
        loop {
            let all_done = deletion.is_finished() && jobs.iter().all(JobHandle::is_finished);
            let page = hub.list_status(0, 50).await?;
            let busy = page
                .results
                .iter()
                .filter(|entry| matches!(entry.status, Status::Processing | Status::Deleting))
                .count();
            most_busy = most_busy.max(busy);
            if all_done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(most_busy <= 1, "{most_busy} entries were busy at once");
        assert_eq!(deletion.await??, DeleteOutcome::Deleted { records: 1 });
        for job in jobs {
            assert_eq!(job.wait().await?.outcome, JobOutcome::Finished(Status::Complete));
        }
        assert_eq!(mem.doc_count("dump-hub").await, 4 * 3000);
        assert!(!hub.is_busy());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_a_deletion_waits_for_the_running_job() -> Result<()> {
        let mem = InMemoryBackend::new();
        let hub = Arc::new(hub_over(&mem).await?);
        let doomed = ingest_to_completion(&hub, "old@example.com:pw\n", "old.txt").await?;

        // ⏸️ the next job gets the gate, goes Processing, then parks on its first bulk
        let valve = mem.hold_bulk_index().await;
        let file = dump_file("new@example.com:pw\nnewer@example.com:pw\n")?;
        let running = compute_file_checksum(file.path()).await?;
        let job = hub.start_ingestion(file.path(), "{0}{:}", &[0, 1], "new.txt")?;
        wait_for_status(&hub, &running, Status::Processing).await?;

        let deleter = Arc::clone(&hub);
        let target = doomed.clone();
        let deletion = tokio::spawn(async move { deleter.delete_all_for(&target).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deletion.is_finished());
        let untouched = hub.get_status(&doomed).await?.context("entry should still be there")?;
        assert_eq!(untouched.status, Status::Complete);

        valve.close();
        // 👀 the moment the deletion touches its entry, the job must already be done
        let mut job_status_when_deletion_began = None;
        for _ in 0..1000 {
            let doomed_status = hub.get_status(&doomed).await?.map(|e| e.status);
            if doomed_status != Some(Status::Complete) {
                job_status_when_deletion_began = hub.get_status(&running).await?.map(|e| e.status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(job_status_when_deletion_began, Some(Status::Complete));

        assert_eq!(deletion.await??, DeleteOutcome::Deleted { records: 1 });
        assert_eq!(job.wait().await?.outcome, JobOutcome::Finished(Status::Complete));
        assert_eq!(hub.get_status(&doomed).await?, None);
        Ok(())
    }
}
