//! 🔧 App Configuration: TOML file plus `DPX_*` environment variables, courtesy of Figment.
//!
//! Only `elasticsearch.url` is mandatory. Everything else has a default that works for
//! a single-node cluster on a laptop, which is where most dumps get searched anyway.
//!
//! Nested keys from the environment use a double underscore:
//! `DPX_RUNTIME__CHUNK_SIZE=500` sets `runtime.chunk_size`.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::ElasticsearchConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub indices: IndicesConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🗂️ Where records and status entries live.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct IndicesConfig {
    #[serde(default = "default_records_index")]
    pub records: String,
    #[serde(default = "default_status_index")]
    pub status: String,
}

fn default_records_index() -> String {
    "dump-hub".to_string()
}

fn default_status_index() -> String {
    "dump-hub-status".to_string()
}

impl Default for IndicesConfig {
    fn default() -> Self {
        Self {
            records: default_records_index(),
            status: default_status_index(),
        }
    }
}

/// ⚙️ Knobs for the ingestion pipeline and the startup sequence.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// 📦 records per bulk insert, ids per bulk delete
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 🧵 ingestion workers per job. 0 = one per available core.
    #[serde(default)]
    pub workers: usize,
    /// 🚰 line queue capacity. 0 = twice the worker count.
    #[serde(default)]
    pub queue_capacity: usize,
    /// 📜 page size for cursor scans
    #[serde(default = "default_scroll_page_size")]
    pub scroll_page_size: usize,
    #[serde(default = "default_gate_poll_millis")]
    pub gate_poll_millis: u64,
    #[serde(default = "default_health_retry_secs")]
    pub health_retry_secs: u64,
    /// 💓 0 = keep waiting for the cluster forever
    #[serde(default)]
    pub health_max_attempts: u32,
    /// 📏 lines longer than this are skipped without being buffered whole
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_scroll_page_size() -> usize {
    100
}

fn default_gate_poll_millis() -> u64 {
    50
}

fn default_health_retry_secs() -> u64 {
    2
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: 0,
            queue_capacity: 0,
            scroll_page_size: default_scroll_page_size(),
            gate_poll_millis: default_gate_poll_millis(),
            health_retry_secs: default_health_retry_secs(),
            health_max_attempts: 0,
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl RuntimeConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            self.queue_capacity
        } else {
            2 * self.effective_workers()
        }
    }

    pub fn gate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.gate_poll_millis)
    }

    pub fn health_retry_interval(&self) -> Duration {
        Duration::from_secs(self.health_retry_secs)
    }
}

/// 🚀 Merge `DPX_*` env vars with an optional TOML file. The file wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration from {}",
        config_file_name.map_or_else(|| "environment only".to_string(), |p| p.display().to_string())
    );

    let config = Figment::new().merge(Env::prefixed("DPX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (DPX_*)",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (DPX_*). \
                 No file was given, so at least DPX_ELASTICSEARCH__URL has to be set."
            .to_string(),
    };

    config.extract().context(context_msg)
}
