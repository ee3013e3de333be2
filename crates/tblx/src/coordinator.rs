//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where tables grew too large to scan in one go..."
//! 🎬 "One coordinator dared to split them in pieces."
//!
//! 📦 The Export Coordinator: part middle manager, part helicopter parent.
//! It validates the job, makes sure the destination exists, starts one worker
//! per segment, and waits for every single one of them to come home. Then it
//! adds up their numbers. It does not help with the actual work. Middle
//! management, as foretold.
//!
//! ⚠️ A failing segment does NOT cancel its siblings. They run to their own
//! completion or failure; the job reports the first failure once all are done.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app_config::RuntimeConfig;
use crate::backends::{ObjectStore, StoreBackend, TableBackend};
use crate::errors::ExportError;
use crate::events::{self, EventReceiver, EventSender, ExportEvent};
use crate::sink::SinkSettings;
use crate::workers::{ProcessWorker, SegmentScanner, Worker, WorkerCommand};

// -- 📏 250 MB, the size at which a CSV stops being a file and becomes a lifestyle
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 250;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// 📋 What to export and how to cut it up.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportJob {
    pub table: String,
    /// `Some` = explicit header, `None` = each file's first row decides.
    pub columns: Option<Arc<[String]>>,
    pub total_segments: u32,
    pub compress: bool,
    pub max_file_size_bytes: u64,
}

impl ExportJob {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: None,
            total_segments: 1,
            compress: false,
            max_file_size_bytes: Self::max_file_size_from_mb(None),
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_segments(mut self, total_segments: u32) -> Self {
        self.total_segments = total_segments;
        self
    }

    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    /// 📏 Megabytes → bytes. Unset or zero means the 250 MB default.
    pub fn max_file_size_from_mb(mb: Option<u64>) -> u64 {
        let mb = match mb {
            Some(mb) if mb > 0 => mb,
            _ => DEFAULT_MAX_FILE_SIZE_MB,
        };
        mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        if self.table.trim().is_empty() {
            return Err(ExportError::InvalidJob("table name is empty".into()));
        }
        if self.total_segments == 0 {
            return Err(ExportError::InvalidJob(
                "total_segments must be at least 1".into(),
            ));
        }
        if self.max_file_size_bytes == 0 {
            return Err(ExportError::InvalidJob(
                "max_file_size_bytes must be at least 1".into(),
            ));
        }
        if self.columns.as_ref().is_some_and(|columns| columns.is_empty()) {
            return Err(ExportError::InvalidJob(
                "an explicit column list needs at least one column".into(),
            ));
        }
        Ok(())
    }
}

/// 📄 One finished file, as a segment remembers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub file_index: u32,
    pub location: String,
    pub rows: u64,
    pub bytes: u64,
}

/// 📊 One segment's tally. Owned by its scanner, handed over when done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentReport {
    pub segment: u32,
    pub rows: u64,
    pub bytes: u64,
    pub files: Vec<FileReport>,
}

impl SegmentReport {
    pub fn new(segment: u32) -> Self {
        Self {
            segment,
            rows: 0,
            bytes: 0,
            files: Vec::new(),
        }
    }
}

/// 🏁 The whole job, added up after every segment came home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub table: String,
    pub rows: u64,
    pub bytes: u64,
    pub files: usize,
    pub segments: Vec<SegmentReport>,
}

impl ExportSummary {
    fn from_reports(table: &str, mut segments: Vec<SegmentReport>) -> Self {
        segments.sort_by_key(|report| report.segment);
        Self {
            table: table.to_string(),
            rows: segments.iter().map(|s| s.rows).sum(),
            bytes: segments.iter().map(|s| s.bytes).sum(),
            files: segments.iter().map(|s| s.files.len()).sum(),
            segments,
        }
    }
}

/// 🔧 Runtime knobs every scanner shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub sink: SinkSettings,
    /// ⏳ First throttle wait; doubles per consecutive throttle.
    pub backoff_base: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            sink: SinkSettings::default(),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl TryFrom<&RuntimeConfig> for ScanSettings {
    type Error = ExportError;

    fn try_from(runtime: &RuntimeConfig) -> Result<Self, Self::Error> {
        if !runtime.delimiter.is_ascii() {
            return Err(ExportError::InvalidConfig(format!(
                "delimiter {:?} must be a single ASCII character",
                runtime.delimiter
            )));
        }
        Ok(Self {
            sink: SinkSettings {
                chunk_size_bytes: runtime.chunk_size_bytes.max(1),
                queue_depth: runtime.sink_queue_depth.max(1),
                delimiter: runtime.delimiter as u8,
            },
            backoff_base: Duration::from_millis(runtime.backoff_base_ms),
        })
    }
}

/// 🧵 How segments get run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Executor {
    /// One tokio task per segment. The default.
    #[default]
    InProcess,
    /// One child process per segment, speaking the worker protocol.
    Process(WorkerCommand),
}

/// 📦 The coordinator. Holds the table, the store, and the microphone.
#[derive(Debug)]
pub struct ExportCoordinator {
    table: Arc<TableBackend>,
    store: Arc<StoreBackend>,
    settings: ScanSettings,
    executor: Executor,
    events: EventSender,
}

impl ExportCoordinator {
    /// 🚀 A coordinator plus the receiving end of its event stream.
    pub fn new(
        table: TableBackend,
        store: StoreBackend,
        settings: ScanSettings,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = events::channel();
        (
            Self {
                table: Arc::new(table),
                store: Arc::new(store),
                settings,
                executor: Executor::InProcess,
                events,
            },
            receiver,
        )
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// 🚀 Export the whole table: every segment, concurrently, all awaited.
    pub async fn export_table(&self, job: &ExportJob) -> Result<ExportSummary, ExportError> {
        job.validate()?;
        self.prepare(job).await?;

        info!(
            "🚀 exporting {} in {} segment(s), max {} bytes per file{}",
            job.table,
            job.total_segments,
            job.max_file_size_bytes,
            if job.compress { ", gzipped" } else { "" }
        );
        self.events.emit(ExportEvent::JobStarted {
            table: job.table.clone(),
            total_segments: job.total_segments,
        });

        let job = Arc::new(job.clone());
        let mut running: FuturesUnordered<_> = (0..job.total_segments)
            .map(|segment| {
                let handle = self.spawn_segment(&job, segment);
                async move { (segment, handle.await) }
            })
            .collect();

        let mut reports = Vec::with_capacity(job.total_segments as usize);
        let mut first_failure = None;
        while let Some((segment, joined)) = running.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(source) => Err(ExportError::TaskFailed { segment, source }),
            };
            match outcome {
                Ok(report) => {
                    info!(
                        "✅ segment {segment} done: {} rows in {} file(s)",
                        report.rows,
                        report.files.len()
                    );
                    reports.push(report);
                }
                Err(err) => {
                    error!("💀 segment {segment} failed: {}", err.chain_message());
                    self.events.emit(ExportEvent::Error {
                        segment: Some(segment),
                        message: err.chain_message(),
                    });
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_failure {
            return Err(err);
        }
        let summary = ExportSummary::from_reports(&job.table, reports);
        info!(
            "🏁 exported {} rows of {} into {} file(s)",
            summary.rows, summary.table, summary.files
        );
        Ok(summary)
    }

    /// 🎯 Export exactly one segment, right here. What a worker process runs.
    pub async fn export_segment(
        &self,
        job: &ExportJob,
        segment: u32,
    ) -> Result<SegmentReport, ExportError> {
        job.validate()?;
        if segment >= job.total_segments {
            return Err(ExportError::InvalidJob(format!(
                "segment {segment} is out of range for {} segment(s)",
                job.total_segments
            )));
        }
        self.prepare(job).await?;
        self.scanner(Arc::new(job.clone()), segment).run().await
    }

    async fn prepare(&self, job: &ExportJob) -> Result<(), ExportError> {
        self.store
            .prepare(&job.table)
            .await
            .map_err(|err| ExportError::Prepare {
                table: job.table.clone(),
                source: err.into(),
            })
    }

    fn scanner(&self, job: Arc<ExportJob>, segment: u32) -> SegmentScanner {
        SegmentScanner::new(
            Arc::clone(&self.table),
            Arc::clone(&self.store),
            job,
            segment,
            self.settings.clone(),
            self.events.clone(),
        )
    }

    fn spawn_segment(
        &self,
        job: &Arc<ExportJob>,
        segment: u32,
    ) -> JoinHandle<Result<SegmentReport, ExportError>> {
        match &self.executor {
            Executor::InProcess => self.scanner(Arc::clone(job), segment).start(),
            Executor::Process(command) => ProcessWorker::new(
                command.clone(),
                Arc::clone(job),
                segment,
                self.events.clone(),
            )
            .start(),
        }
    }
}

#[cfg(test)]
mod tests;
