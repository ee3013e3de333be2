//! 🔍 The Segment Scanner: one segment, start to finish, strictly in order.
//!
//! ```text
//! Scanning → Writing → (Rotating → Scanning)* → Draining → Done
//!     ╰──────────────────────┴──────────────────────────→ Failed
//! ```
//!
//! Read a page. Write every record, waiting on the sink whenever it says so.
//! If the table says "slow down", sleep `base · 2^k` and ask again with the
//! same token. After each page, decide: done (token gone), rotate (file big
//! enough), or keep going. Any other failure aborts the open file and ends the
//! segment. Four suspension points: read, backoff, drain, close.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Worker;
use crate::backends::{
    ContinuationToken, ScanPage, ScanRequest, StoreBackend, TableBackend, TableReader,
};
use crate::backoff::Backoff;
use crate::common::{FileKey, Record};
use crate::coordinator::{ExportJob, FileReport, ScanSettings, SegmentReport};
use crate::errors::{ExportError, TableError};
use crate::events::{EventSender, ExportEvent};
use crate::projector::RowProjector;
use crate::sink::{ClosedFile, FileSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    Writing,
    Rotating,
    Draining,
    Done,
    Failed,
}

#[derive(Debug)]
pub(crate) struct SegmentScanner {
    table: Arc<TableBackend>,
    store: Arc<StoreBackend>,
    job: Arc<ExportJob>,
    segment: u32,
    settings: ScanSettings,
    events: EventSender,
    projector: RowProjector,
    state: ScanState,
    report: SegmentReport,
}

impl SegmentScanner {
    pub(crate) fn new(
        table: Arc<TableBackend>,
        store: Arc<StoreBackend>,
        job: Arc<ExportJob>,
        segment: u32,
        settings: ScanSettings,
        events: EventSender,
    ) -> Self {
        let projector = RowProjector::new(job.columns.clone());
        Self {
            table,
            store,
            job,
            segment,
            settings,
            events,
            projector,
            state: ScanState::Scanning,
            report: SegmentReport::new(segment),
        }
    }

    pub(crate) async fn run(mut self) -> Result<SegmentReport, ExportError> {
        let mut key = FileKey::new(&self.job.table, self.segment, 0, self.job.compress);
        let mut sink = match self.open_file(key.clone()).await {
            Ok(sink) => sink,
            Err(err) => return Err(self.failed(err)),
        };
        let mut token: Option<ContinuationToken> = None;
        let mut backoff = Backoff::new(self.settings.backoff_base);

        loop {
            self.transition(ScanState::Scanning);
            let page = match self.read_page(token.take(), &mut backoff).await {
                Ok(page) => page,
                Err(err) => return Err(self.fail(sink, err).await),
            };

            self.transition(ScanState::Writing);
            if let Err(err) = self.write_page(&mut sink, &page.records).await {
                return Err(self.fail(sink, err).await);
            }
            token = page.next_token;

            let bytes = self.closed_bytes() + sink.bytes_written();
            self.events.emit(ExportEvent::PageWritten {
                segment: self.segment,
                rows: self.report.rows,
                bytes,
            });

            if token.is_none() {
                self.transition(ScanState::Draining);
                if let Err(err) = self.finish_file(sink).await {
                    return Err(self.failed(err));
                }
                break;
            }
            if sink.bytes_written() >= self.job.max_file_size_bytes {
                self.transition(ScanState::Rotating);
                if let Err(err) = self.finish_file(sink).await {
                    return Err(self.failed(err));
                }
                key = key.next();
                sink = match self.open_file(key.clone()).await {
                    Ok(sink) => sink,
                    Err(err) => return Err(self.failed(err)),
                };
            }
        }

        self.transition(ScanState::Done);
        info!(
            "✅ segment {} finished: {} rows, {} bytes, {} file(s)",
            self.segment,
            self.report.rows,
            self.report.bytes,
            self.report.files.len()
        );
        Ok(self.report)
    }

    /// 📨 Read the page at `token`, sleeping through throttles. A throttled
    /// read is retried with the very same token.
    async fn read_page(
        &self,
        token: Option<ContinuationToken>,
        backoff: &mut Backoff,
    ) -> Result<ScanPage, ExportError> {
        let request = ScanRequest {
            table: self.job.table.clone(),
            segment: self.segment,
            total_segments: self.job.total_segments,
            token,
        };
        loop {
            match self.table.scan(&request).await {
                Ok(page) => {
                    backoff.reset();
                    return Ok(page);
                }
                Err(TableError::Throttled { message }) => {
                    let attempt = backoff.attempts() + 1;
                    let wait = backoff.next_wait();
                    warn!(
                        "🐢 segment {} throttled (attempt {attempt}), waiting {:?}: {message}",
                        self.segment, wait
                    );
                    self.events.emit(ExportEvent::ThroughputExceeded {
                        segment: self.segment,
                        attempt,
                        wait,
                    });
                    tokio::time::sleep(wait).await;
                }
                Err(TableError::Other(source)) => {
                    return Err(ExportError::Read {
                        segment: self.segment,
                        source,
                    });
                }
            }
        }
    }

    async fn write_page(&mut self, sink: &mut FileSink, records: &[Record]) -> Result<(), ExportError> {
        for record in records {
            let row = self
                .projector
                .project(record)
                .map_err(|source| ExportError::Projection {
                    segment: self.segment,
                    location: sink.location().to_string(),
                    source,
                })?;
            if !sink.write_row(&row)? {
                sink.drained().await?;
            }
            self.report.rows += 1;
        }
        Ok(())
    }

    async fn open_file(&self, key: FileKey) -> Result<FileSink, ExportError> {
        let file_index = key.file_index;
        let sink = FileSink::open(
            &self.store,
            key,
            self.job.columns.clone(),
            &self.settings.sink,
        )
        .await?;
        info!("📂 segment {} writing {}", self.segment, sink.location());
        self.events.emit(ExportEvent::FileStarted {
            segment: self.segment,
            file_index,
            location: sink.location().to_string(),
        });
        Ok(sink)
    }

    async fn finish_file(&mut self, sink: FileSink) -> Result<(), ExportError> {
        let ClosedFile {
            key,
            location,
            rows,
            bytes,
        } = sink.close().await?;
        info!("🏁 segment {} finished {location}", self.segment);
        self.events.emit(ExportEvent::FileFinished {
            segment: self.segment,
            file_index: key.file_index,
            location: location.clone(),
            rows,
            bytes,
        });
        self.report.bytes += bytes;
        self.report.files.push(FileReport {
            file_index: key.file_index,
            location,
            rows,
            bytes,
        });
        Ok(())
    }

    /// 💀 Abort the open file and hand back the error that killed it.
    async fn fail(&mut self, sink: FileSink, err: ExportError) -> ExportError {
        sink.abort().await;
        self.failed(err)
    }

    fn failed(&mut self, err: ExportError) -> ExportError {
        self.transition(ScanState::Failed);
        warn!("💀 segment {} failed: {err}", self.segment);
        err
    }

    fn closed_bytes(&self) -> u64 {
        self.report.bytes
    }

    fn transition(&mut self, next: ScanState) {
        if self.state != next {
            debug!(
                "🔄 segment {}: {:?} → {:?}",
                self.segment, self.state, next
            );
            self.state = next;
        }
    }
}

impl Worker for SegmentScanner {
    type Output = SegmentReport;

    fn start(self) -> JoinHandle<Result<SegmentReport, ExportError>> {
        tokio::spawn(self.run())
    }
}
