//! 📊 Job progress: "how far into the 40 GB dump are we?"
//!
//! The line reader feeds bytes and line counts in; a progress bar and a small
//! comfy-table of rates come out. Rates use a 5-second sliding window so one slow bulk
//! request doesn't make the numbers look like a heart monitor.
//!
//! ⚠️ Lines read, not records indexed. The workers are behind the queue; this is the
//! reader's view of the world.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

const MIB: u64 = 1024 * 1024;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 📦 Bytes in the unit that fits the file: MiB for big dumps, KiB for medium, bytes otherwise.
pub(crate) fn format_bytes(bytes: u64, file_size: u64) -> String {
    if file_size >= 512 * MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if file_size >= MIB {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// 🔢 1234567 → "1,234,567"
pub(crate) fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

/// ⏱️ MM:SS, or HH:MM:SS once a dump takes more than an hour
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

struct Rates {
    lines_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Progress of one ingestion job, as seen by the line reader.
pub(crate) struct ProgressMetrics {
    /// 🏷️ original filename of the dump
    source_name: String,
    /// 📏 file size in bytes, 0 if unknown
    total_size: u64,
    bytes_read: u64,
    lines_read: u64,
    progress_bar: ProgressBar,
    /// 🔄 (when, bytes, lines) samples inside the rate window
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMetrics")
            .field("source_name", &self.source_name)
            .field("total_size", &self.total_size)
            .field("bytes_read", &self.bytes_read)
            .field("lines_read", &self.lines_read)
            .finish()
    }
}

impl ProgressMetrics {
    pub(crate) fn new(source_name: String, total_size: u64) -> Self {
        let progress_bar = ProgressBar::new(total_size);
        // 🎨 a broken template just means a plainer bar
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));

        Self {
            source_name,
            total_size,
            bytes_read: 0,
            lines_read: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Add what was read since the last update and redraw.
    pub(crate) fn update(&mut self, bytes: u64, lines: u64) {
        self.bytes_read += bytes;
        self.lines_read += lines;
        let rates = self.calculate_rates(Instant::now());
        self.render(rates);
        self.progress_bar.set_position(self.bytes_read);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    pub(crate) fn lines_read(&self) -> u64 {
        self.lines_read
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn calculate_rates(&mut self, now: Instant) -> Rates {
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.bytes_read, self.lines_read));

        if let Some(&(oldest, oldest_bytes, oldest_lines)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = self.bytes_read.saturating_sub(oldest_bytes);
                let lines_delta = self.lines_read.saturating_sub(oldest_lines);
                return Rates {
                    lines_per_sec: lines_delta as f64 / elapsed,
                    mib_per_sec: (bytes_delta as f64 / elapsed) / MIB as f64,
                };
            }
        }
        Rates {
            lines_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    fn percent(&self) -> f64 {
        if self.total_size > 0 {
            (self.bytes_read as f64 / self.total_size as f64) * 100.0
        } else {
            0.0
        }
    }

    fn render(&self, rates: Rates) {
        let percent = self.percent();
        let elapsed = self.start_time.elapsed();
        let remaining = if percent > 0.0 {
            // 🔮 linear extrapolation, as accurate as any ETA ever was
            let total_estimated = elapsed.as_secs_f64() / (percent / 100.0);
            let remaining_secs = total_estimated - elapsed.as_secs_f64();
            if remaining_secs > 0.0 {
                format_duration(Duration::from_secs_f64(remaining_secs))
            } else {
                "--:--".to_string()
            }
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Lines/s", format_number(rates.lines_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Lines", format_number(self.lines_read)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {}",
                format_bytes(self.bytes_read, self.total_size),
                format_bytes(self.total_size, self.total_size)
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}% · {} remaining", percent, remaining))
                .set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("dump: {}\n{}", self.source_name, table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn the_one_where_units_follow_the_file_size() {
        assert_eq!(format_bytes(512, 1000), "512 bytes");
        assert_eq!(format_bytes(2048, 2 * MIB), "2.00 KiB");
        assert_eq!(format_bytes(MIB, 1024 * MIB), "1.00 MiB");
    }

    #[test]
    fn the_one_where_long_jobs_grow_an_hours_column() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn the_one_where_counters_only_go_up() {
        let mut metrics = ProgressMetrics::new("dump.txt".into(), 100);
        metrics.update(40, 4);
        metrics.update(60, 6);
        assert_eq!(metrics.bytes_read(), 100);
        assert_eq!(metrics.lines_read(), 10);
        assert!((metrics.percent() - 100.0).abs() < f64::EPSILON);
        metrics.finish();
    }

    #[test]
    fn the_one_where_old_samples_fall_out_of_the_window() {
        let mut metrics = ProgressMetrics::new("dump.txt".into(), 0);
        let start = metrics.start_time;
        metrics.bytes_read = MIB;
        metrics.lines_read = 10;
        let later = start + RATE_WINDOW + Duration::from_secs(1);
        let rates = metrics.calculate_rates(later);
        // 🪟 only the new sample is left, so there is no span to measure a rate over
        assert_eq!(metrics.rate_samples.len(), 1);
        assert_eq!(rates.lines_per_sec, 0.0);

        metrics.lines_read = 30;
        let rates = metrics.calculate_rates(later + Duration::from_secs(2));
        assert!((rates.lines_per_sec - 10.0).abs() < 1e-9);
    }
}
