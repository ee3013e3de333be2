//! 📊 progress.rs: "Are we there yet?" Every export, every time, forever.
//!
//! 🚀 Feed it the coordinator's events and it answers with cold hard numbers,
//! a spinner, and a table so comfy it has lumbar support. There is no total to
//! count towards (a scan doesn't know how big the table is until it's done), so
//! this is a speedometer, not a progress bar.
//!
//! ⚠️ Warning: watching this spinner will not make DynamoDB go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::events::ExportEvent;

// -- 📏 one mebibyte. not a megabyte, pedants. there's a difference and I will die on this hill.
const MIB: f64 = 1024.0 * 1024.0;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS if you should probably call your mom. It's been a while.
fn format_duration(duration: Duration) -> String {
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

/// 🔎 Pull `(segment, rows, bytes)` out of a worker's "Segment: S, Row: R, Mb: M"
/// line. Bytes come back rounded to what two decimals of MiB can say.
fn parse_page_line(line: &str) -> Option<(u32, u64, u64)> {
    let rest = line.strip_prefix("Segment: ")?;
    let (segment, rest) = rest.split_once(", Row: ")?;
    let (rows, mb) = rest.split_once(", Mb: ")?;
    let mb: f64 = mb.trim().parse().ok()?;
    Some((segment.parse().ok()?, rows.parse().ok()?, (mb * MIB) as u64))
}

/// 📸 The numbers, frozen. What the summary table and the tests read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub rows: u64,
    pub bytes: u64,
    pub files: u64,
    pub throttles: u64,
    pub errors: u64,
}

struct Rates {
    rows_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Tracks per-segment totals from the event stream and renders them.
pub struct ExportProgress {
    table: String,
    total_segments: u32,
    /// 📄 segment → (rows, bytes). Page events carry cumulative numbers, so we
    /// overwrite instead of add.
    segments: BTreeMap<u32, (u64, u64)>,
    files: u64,
    throttles: u64,
    errors: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ExportProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ExportProgress")
            .field("table", &self.table)
            .field("total_segments", &self.total_segments)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ExportProgress {
    /// 🚀 A live spinner on stderr.
    pub fn new(table: impl Into<String>) -> Self {
        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        progress_bar.enable_steady_tick(Duration::from_millis(120));
        Self::with_bar(table.into(), progress_bar)
    }

    /// 🙈 Same bookkeeping, nothing drawn. For tests and non-terminals.
    pub fn hidden(table: impl Into<String>) -> Self {
        Self::with_bar(table.into(), ProgressBar::hidden())
    }

    fn with_bar(table: String, progress_bar: ProgressBar) -> Self {
        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        // -- 🔄 seed the window with t=0 so we don't divide by zero like animals
        rate_samples.push_back((start_time, 0, 0));
        Self {
            table,
            total_segments: 0,
            segments: BTreeMap::new(),
            files: 0,
            throttles: 0,
            errors: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Fold one event into the totals and redraw.
    pub fn observe(&mut self, event: &ExportEvent) {
        match event {
            ExportEvent::JobStarted { total_segments, .. } => {
                self.total_segments = *total_segments;
            }
            ExportEvent::PageWritten {
                segment,
                rows,
                bytes,
            } => {
                self.segments.insert(*segment, (*rows, *bytes));
            }
            ExportEvent::FileFinished { .. } => self.files += 1,
            ExportEvent::ThroughputExceeded { .. } => self.throttles += 1,
            ExportEvent::Error { .. } => self.errors += 1,
            ExportEvent::WorkerOutput { line, .. } => {
                if let Some((segment, rows, bytes)) = parse_page_line(line) {
                    self.segments.insert(segment, (rows, bytes));
                } else if line.starts_with("Finished file: ") {
                    self.files += 1;
                }
            }
            ExportEvent::FileStarted { .. } => {}
        }
        let rates = self.calculate_rates();
        self.render(rates);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            rows: self.segments.values().map(|(rows, _)| rows).sum(),
            bytes: self.segments.values().map(|(_, bytes)| bytes).sum(),
            files: self.files,
            throttles: self.throttles,
            errors: self.errors,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// ✅ Stop the spinner and leave the last frame on screen.
    pub fn finish(&self) {
        self.progress_bar.finish();
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        let snapshot = self.snapshot();
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, snapshot.rows, snapshot.bytes));

        if let Some(&(oldest, oldest_rows, oldest_bytes)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest).as_secs_f64();
            if elapsed > 0.0 {
                return Rates {
                    rows_per_sec: snapshot.rows.saturating_sub(oldest_rows) as f64 / elapsed,
                    mib_per_sec: snapshot.bytes.saturating_sub(oldest_bytes) as f64 / elapsed / MIB,
                };
            }
        }
        Rates {
            rows_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    /// 🎨 Two right-aligned columns, no borders:
    /// ```text
    ///   <rows/s>     <total rows>
    ///   <MiB/s>      <total MiB>
    ///   <files>      <segments>
    ///   <elapsed>    <throttles>
    /// ```
    fn render(&self, rates: Rates) {
        if self.progress_bar.is_hidden() {
            return;
        }
        let snapshot = self.snapshot();
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        let row = |left: String, right: String| {
            vec![
                Cell::new(left).set_alignment(CellAlignment::Right),
                Cell::new(right).set_alignment(CellAlignment::Right),
            ]
        };
        table.add_row(row(
            format!("{} Rows/s", format_number(rates.rows_per_sec as u64)),
            format!("{} Rows", format_number(snapshot.rows)),
        ));
        table.add_row(row(
            format!("{:.2} MiB/s", rates.mib_per_sec),
            format!("{:.2} MiB", snapshot.bytes as f64 / MIB),
        ));
        table.add_row(row(
            format!("{} file(s) done", snapshot.files),
            format!("{} segment(s)", self.total_segments),
        ));
        table.add_row(row(
            format!("{} elapsed", format_duration(self.elapsed())),
            format!("{} throttle(s)", snapshot.throttles),
        ));
        self.progress_bar
            .set_message(format!("table: {}\n{}", self.table, table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_numbers_get_their_commas_and_clocks_get_their_colons() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_cumulative_pages_are_not_double_counted() {
        let mut progress = ExportProgress::hidden("users");
        let events = [
            ExportEvent::JobStarted {
                table: "users".into(),
                total_segments: 2,
            },
            ExportEvent::PageWritten {
                segment: 0,
                rows: 100,
                bytes: 1_000,
            },
            ExportEvent::PageWritten {
                segment: 0,
                rows: 200,
                bytes: 2_000,
            },
            ExportEvent::PageWritten {
                segment: 1,
                rows: 50,
                bytes: 500,
            },
            ExportEvent::ThroughputExceeded {
                segment: 1,
                attempt: 1,
                wait: Duration::from_secs(1),
            },
            ExportEvent::FileFinished {
                segment: 0,
                file_index: 0,
                location: "memory://users/users-0-0.csv".into(),
                rows: 200,
                bytes: 2_000,
            },
        ];
        for event in &events {
            progress.observe(event);
        }

        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                rows: 250,
                bytes: 2_500,
                files: 1,
                throttles: 1,
                errors: 0,
            }
        );
    }

    #[test]
    fn the_one_where_worker_chatter_still_moves_the_needle() {
        let mut progress = ExportProgress::hidden("users");
        progress.observe(&ExportEvent::WorkerOutput {
            segment: 3,
            line: "Segment: 3, Row: 42, Mb: 1.00".into(),
        });
        progress.observe(&ExportEvent::WorkerOutput {
            segment: 3,
            line: "Finished file: /tmp/users/users-3-0.csv (Row: 42, Mb: 1.00)".into(),
        });
        progress.observe(&ExportEvent::WorkerOutput {
            segment: 3,
            line: "something a worker felt like saying".into(),
        });

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.rows, 42);
        assert_eq!(snapshot.bytes, 1024 * 1024);
        assert_eq!(snapshot.files, 1);
    }
}
