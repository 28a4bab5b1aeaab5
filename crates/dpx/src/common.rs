//! 📦 Common data structures: the building blocks of dumpex.
//!
//! 🎬 COLD OPEN. INT. UPLOAD FOLDER, 2:13 AM
//!
//! A 40 GB text dump lands on disk. Nobody knows what is inside. Colons, commas,
//! tabs, the occasional stray space in the middle of a field like a pebble in a shoe.
//! Every line becomes a [`Record`]. Every file gets exactly one [`StatusEntry`].
//! The [`Status`] enum tells the world how it's going. Usually: "Processing". 🦆

use std::fmt;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// 📄 One parsed line, on its way to the records index.
///
/// `origin_id` is the checksum of the file the line came from. It is the only thing
/// tying a record back to its file, so deleting a file means "every record with this
/// origin_id, please leave". There is no update path. Corrections are delete-and-reingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// 🏷️ the original filename, as the uploader knew it
    pub origin: String,
    /// 🔐 checksum of the source file, groups every record of one file
    pub origin_id: String,
    /// 📦 the selected field values, in the order they appeared on the line
    pub data: Vec<String>,
}

/// 🚦 Lifecycle of one file's ingestion.
///
/// On the wire this is a small integer, because downstream consumers sort and filter
/// on it and the active states sorting first is a feature:
///
/// | variant      | wire |
/// |--------------|------|
/// | `Processing` | 0    |
/// | `Deleting`   | 1    |
/// | `Enqueued`   | 2    |
/// | `Error`      | 3    |
/// | `Complete`   | 4    |
///
/// Transitions: `Enqueued → Processing → {Complete | Error}`, and
/// `{Complete | Error} → Deleting → (entry removed) | Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Processing,
    Deleting,
    Enqueued,
    Error,
    Complete,
}

impl Status {
    /// ⏳ Transient states: somebody is (or was, before the crash) working on this entry.
    pub fn is_transient(self) -> bool {
        matches!(self, Status::Processing | Status::Deleting | Status::Enqueued)
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        match status {
            Status::Processing => 0,
            Status::Deleting => 1,
            Status::Enqueued => 2,
            Status::Error => 3,
            Status::Complete => 4,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<Self> {
        Ok(match value {
            0 => Status::Processing,
            1 => Status::Deleting,
            2 => Status::Enqueued,
            3 => Status::Error,
            4 => Status::Complete,
            // 💀 a status from the future, or from a very creative operator with curl
            other => bail!("💀 Unknown status value {other}. Valid values are 0 through 4."),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Processing => "processing",
            Status::Deleting => "deleting",
            Status::Enqueued => "enqueued",
            Status::Error => "error",
            Status::Complete => "complete",
        };
        f.write_str(label)
    }
}

/// 🗂️ The per-file bookkeeping document, keyed by `checksum` in the status index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// 📅 `YYYY-MM-DD HH:MM:SS`, local time, when the job started
    pub date: String,
    pub filename: String,
    pub checksum: String,
    pub status: Status,
}

impl StatusEntry {
    /// 🚀 A fresh entry, stamped with the current local time.
    pub fn new(checksum: String, filename: String, status: Status) -> Self {
        Self {
            date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            filename,
            checksum,
            status,
        }
    }
}

/// 📚 One page of the status listing, plus how many entries exist in total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusPage {
    pub results: Vec<StatusEntry>,
    pub total: u64,
}

/// 🔍 One page of record search results, plus the total hit count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordPage {
    pub results: Vec<Record>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_status_travels_as_the_old_integers() -> anyhow::Result<()> {
        // 🧪 downstream sorts on these numbers. they do not get to change.
        assert_eq!(serde_json::to_value(Status::Processing)?, serde_json::json!(0));
        assert_eq!(serde_json::to_value(Status::Deleting)?, serde_json::json!(1));
        assert_eq!(serde_json::to_value(Status::Enqueued)?, serde_json::json!(2));
        assert_eq!(serde_json::to_value(Status::Error)?, serde_json::json!(3));
        assert_eq!(serde_json::to_value(Status::Complete)?, serde_json::json!(4));
        Ok(())
    }

    #[test]
    fn the_one_where_an_unknown_status_is_refused_at_the_door() {
        let parsed: Result<Status, _> = serde_json::from_str("9");
        assert!(parsed.is_err(), "9 is not a status, it is a cry for help");
    }

    #[test]
    fn the_one_where_a_status_entry_survives_the_wire() -> anyhow::Result<()> {
        let raw = r#"{"date":"2021-01-01 10:00:00","filename":"combo.txt","checksum":"abc","status":4}"#;
        let entry: StatusEntry = serde_json::from_str(raw)?;
        assert_eq!(entry.status, Status::Complete);
        assert_eq!(entry.filename, "combo.txt");
        assert_eq!(serde_json::to_value(&entry)?["status"], 4);
        Ok(())
    }

    #[test]
    fn the_one_where_only_the_busy_states_are_transient() {
        assert!(Status::Processing.is_transient());
        assert!(Status::Deleting.is_transient());
        assert!(Status::Enqueued.is_transient());
        assert!(!Status::Error.is_transient());
        assert!(!Status::Complete.is_transient());
    }

    #[test]
    fn the_one_where_new_entries_get_a_sortable_date() {
        let entry = StatusEntry::new("c".into(), "f.txt".into(), Status::Enqueued);
        // 📅 "YYYY-MM-DD HH:MM:SS" is 19 chars, no more, no less
        assert_eq!(entry.date.len(), 19);
        assert_eq!(&entry.date[4..5], "-");
        assert_eq!(&entry.date[10..11], " ");
    }
}
