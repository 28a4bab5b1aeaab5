//! 🍽️ Tables for the terminal.

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use dpx::common::{RecordPage, StatusPage};
use dpx::{JobReport, Status};

fn table_with_header(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header.iter().map(Cell::new).collect::<Vec<_>>());
    table
}

fn status_cell(status: Status) -> Cell {
    let marker = match status {
        Status::Processing => "🔄",
        Status::Deleting => "🗑️",
        Status::Enqueued => "⏳",
        Status::Error => "💀",
        Status::Complete => "✅",
    };
    Cell::new(format!("{marker} {status}"))
}

pub fn status_table(page: &StatusPage, from: usize) -> String {
    let mut table = table_with_header(&["date", "filename", "checksum", "status"]);
    for entry in &page.results {
        table.add_row(vec![
            Cell::new(&entry.date),
            Cell::new(&entry.filename),
            Cell::new(&entry.checksum),
            status_cell(entry.status),
        ]);
    }
    format!("{table}\n{}", footer(page.results.len(), from, page.total))
}

pub fn records_table(page: &RecordPage, from: usize) -> String {
    let mut table = table_with_header(&["origin", "data"]);
    for record in &page.results {
        table.add_row(vec![Cell::new(&record.origin), Cell::new(record.data.join(" | "))]);
    }
    format!("{table}\n{}", footer(page.results.len(), from, page.total))
}

pub fn job_report_table(report: &JobReport) -> String {
    let mut table = table_with_header(&["", ""]);
    let rows = [
        ("checksum", report.checksum.clone().unwrap_or_else(|| "-".to_string())),
        ("outcome", report.outcome.to_string()),
        ("records indexed", report.stats.records_indexed.to_string()),
        ("lines skipped", report.stats.lines_skipped.to_string()),
        ("failed batches", report.stats.failed_batches.to_string()),
        ("records dropped", report.stats.records_dropped.to_string()),
    ];
    for (label, value) in rows {
        table.add_row(vec![
            Cell::new(label),
            Cell::new(value).set_alignment(CellAlignment::Right),
        ]);
    }
    table.to_string()
}

fn footer(shown: usize, from: usize, total: u64) -> String {
    if shown == 0 {
        return format!("nothing to show ({total} total)");
    }
    format!("showing {}-{} of {total}", from + 1, from + shown)
}
