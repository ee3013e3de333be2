//! 📣 Events: the export's running commentary.
//!
//! The engine never prints. It narrates into an unbounded channel, and whoever
//! holds the receiver decides what to do with the gossip (log it, draw a
//! progress bar, ignore it entirely). If nobody is listening, the narration
//! goes into the void and the export carries on, unbothered, like a podcast
//! with zero subscribers.

use std::fmt;
use std::time::Duration;

use async_channel::{Receiver, Sender};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// 📰 Something happened. Here's what.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportEvent {
    JobStarted {
        table: String,
        total_segments: u32,
    },
    FileStarted {
        segment: u32,
        file_index: u32,
        location: String,
    },
    /// 📄 Cumulative segment totals after one page landed in the sink.
    PageWritten {
        segment: u32,
        rows: u64,
        bytes: u64,
    },
    FileFinished {
        segment: u32,
        file_index: u32,
        location: String,
        rows: u64,
        bytes: u64,
    },
    /// 🗣️ A stdout line from a worker process, passed through untouched.
    WorkerOutput {
        segment: u32,
        line: String,
    },
    ThroughputExceeded {
        segment: u32,
        attempt: u32,
        wait: Duration,
    },
    Error {
        segment: Option<u32>,
        message: String,
    },
}

/// 🏷️ The three channels an observer can tune into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    ThroughputExceeded,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::ThroughputExceeded => "throughputExceeded",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ExportEvent::ThroughputExceeded { .. } => EventKind::ThroughputExceeded,
            ExportEvent::Error { .. } => EventKind::Error,
            _ => EventKind::Info,
        }
    }

    pub fn segment(&self) -> Option<u32> {
        match self {
            ExportEvent::JobStarted { .. } => None,
            ExportEvent::FileStarted { segment, .. }
            | ExportEvent::PageWritten { segment, .. }
            | ExportEvent::FileFinished { segment, .. }
            | ExportEvent::WorkerOutput { segment, .. }
            | ExportEvent::ThroughputExceeded { segment, .. } => Some(*segment),
            ExportEvent::Error { segment, .. } => *segment,
        }
    }
}

impl fmt::Display for ExportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportEvent::JobStarted {
                table,
                total_segments,
            } => write!(f, "Exporting table {table} in {total_segments} segment(s)"),
            ExportEvent::FileStarted { location, .. } => {
                write!(f, "Starting new file: {location}")
            }
            ExportEvent::PageWritten {
                segment,
                rows,
                bytes,
            } => write!(
                f,
                "Segment: {segment}, Row: {rows}, Mb: {:.2}",
                *bytes as f64 / BYTES_PER_MB
            ),
            ExportEvent::FileFinished {
                location,
                rows,
                bytes,
                ..
            } => write!(
                f,
                "Finished file: {location} (Row: {rows}, Mb: {:.2})",
                *bytes as f64 / BYTES_PER_MB
            ),
            ExportEvent::WorkerOutput { line, .. } => f.write_str(line),
            ExportEvent::ThroughputExceeded {
                segment,
                attempt,
                wait,
            } => write!(
                f,
                "Segment: {segment}, throughput exceeded (attempt {attempt}), retrying in {}ms",
                wait.as_millis()
            ),
            ExportEvent::Error {
                segment: Some(segment),
                message,
            } => write!(f, "Segment: {segment}, {message}"),
            ExportEvent::Error {
                segment: None,
                message,
            } => f.write_str(message),
        }
    }
}

/// 📮 The narrator's microphone. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<ExportEvent>,
}

pub type EventReceiver = Receiver<ExportEvent>;

impl EventSender {
    /// 📣 Fire and forget. A closed channel just means nobody is listening.
    pub fn emit(&self, event: ExportEvent) {
        let _ = self.tx.try_send(event);
    }

    /// 🔇 A sender whose receiver is already gone. For callers that don't care.
    pub fn detached() -> Self {
        let (sender, _) = channel();
        sender
    }
}

/// 🔌 A fresh, unbounded event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = async_channel::unbounded();
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_page_progress_reads_segment_row_mb() {
        let event = ExportEvent::PageWritten {
            segment: 1,
            rows: 300,
            bytes: 3 * 1024 * 1024 / 2,
        };
        assert_eq!(event.to_string(), "Segment: 1, Row: 300, Mb: 1.50");
        assert_eq!(event.kind(), EventKind::Info);
        assert_eq!(event.segment(), Some(1));
    }

    #[test]
    fn the_one_where_each_event_lands_in_its_named_channel() {
        let throttle = ExportEvent::ThroughputExceeded {
            segment: 0,
            attempt: 2,
            wait: Duration::from_secs(4),
        };
        assert_eq!(throttle.kind().as_str(), "throughputExceeded");
        assert!(throttle.to_string().contains("retrying in 4000ms"));

        let error = ExportEvent::Error {
            segment: None,
            message: "boom".into(),
        };
        assert_eq!(error.kind().to_string(), "error");
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn the_one_where_nobody_is_listening_and_nobody_panics() {
        let sender = EventSender::detached();
        sender.emit(ExportEvent::WorkerOutput {
            segment: 0,
            line: "hello?".into(),
        });

        let (sender, rx) = channel();
        sender.emit(ExportEvent::JobStarted {
            table: "t".into(),
            total_segments: 2,
        });
        assert_eq!(rx.len(), 1);
    }
}
