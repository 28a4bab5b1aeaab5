//! 🗑️ dumpex: turns loosely formatted text dumps into searchable documents.
//!
//! Start at [`Hub`]: it runs the startup sequence and hands out ingestion jobs,
//! deletions, status listings and searches.

pub mod app_config;
pub mod backends;
pub mod bulk;
pub mod checksum;
pub mod common;
pub mod coordinator;
pub mod gate;
pub mod hub;
pub mod parser;
mod progress;
pub mod status;
pub mod sweeper;
pub mod workers;

pub use app_config::{AppConfig, load_config};
pub use common::{Record, Status, StatusEntry};
pub use coordinator::{IngestRejection, JobHandle, JobOutcome, JobReport};
pub use hub::Hub;
pub use sweeper::DeleteOutcome;
