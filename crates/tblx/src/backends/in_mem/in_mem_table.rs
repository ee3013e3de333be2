use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::backends::{ContinuationToken, ScanPage, ScanRequest, TableReader};
use crate::common::Record;
use crate::errors::TableError;

// -- 📏 page size when nobody says otherwise. small enough to make tests paginate.
const DEFAULT_PAGE_SIZE: usize = 100;

/// 📦 A table that lives entirely in RAM. Gone the moment you blink.
///
/// Two layouts:
/// - **flat**: one list of records, dealt to segments round-robin
///   (`index % total_segments == segment`), served `page_size` at a time;
/// - **scripted**: exact pages per segment, for tests that care which record
///   lands on which page.
///
/// On top of either, a test can script throttles ("page 1 of segment 0
/// throttles twice, then answers") and hard failures. Every request is logged,
/// so a test can check that a throttled read was retried with the same token.
///
/// Clone-able, and clones share state. Hand one to the coordinator, keep one
/// for your assertions.
#[derive(Debug, Clone)]
pub struct InMemoryTable {
    state: Arc<Mutex<TableState>>,
}

#[derive(Debug)]
enum Layout {
    Flat {
        records: Vec<Record>,
        page_size: usize,
    },
    Scripted {
        pages: HashMap<u32, Vec<Vec<Record>>>,
    },
}

#[derive(Debug)]
struct TableState {
    layout: Layout,
    /// 🐢 (segment, page index) → throttles still to serve before answering.
    throttles: HashMap<(u32, usize), u32>,
    /// 💀 (segment, page index) → error message, served on every attempt.
    failures: HashMap<(u32, usize), String>,
    requests: Vec<ScanRequest>,
}

impl InMemoryTable {
    /// 🚀 Flat layout: records dealt round-robin across segments.
    pub fn from_records(records: Vec<Record>, page_size: usize) -> Self {
        Self::with_layout(Layout::Flat {
            records,
            page_size: page_size.max(1),
        })
    }

    /// 🎬 Scripted layout: `pages[segment]` is exactly what that segment reads.
    /// A segment with no entry reads one empty page and is done.
    pub fn from_pages(pages: HashMap<u32, Vec<Vec<Record>>>) -> Self {
        Self::with_layout(Layout::Scripted { pages })
    }

    fn with_layout(layout: Layout) -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                layout,
                throttles: HashMap::new(),
                failures: HashMap::new(),
                requests: Vec::new(),
            })),
        }
    }

    /// 🐢 The read of `page` in `segment` throttles `times` times before succeeding.
    pub fn throttle_page(self, segment: u32, page: usize, times: u32) -> Self {
        self.lock().throttles.insert((segment, page), times);
        self
    }

    /// 💀 Every read of `page` in `segment` fails with `message`.
    pub fn fail_page(self, segment: u32, page: usize, message: impl Into<String>) -> Self {
        self.lock().failures.insert((segment, page), message.into());
        self
    }

    /// 📜 Every request served so far, in arrival order.
    pub fn requests(&self) -> Vec<ScanRequest> {
        self.lock().requests.clone()
    }

    pub fn default_page_size() -> usize {
        DEFAULT_PAGE_SIZE
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // -- 🔒 a panicking test thread poisons the lock. the data is still fine. carry on.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TableState {
    fn page_index(&self, offset: usize) -> usize {
        match &self.layout {
            Layout::Flat { page_size, .. } => offset / page_size,
            Layout::Scripted { .. } => offset,
        }
    }

    fn read(&self, request: &ScanRequest, offset: usize) -> Result<ScanPage, TableError> {
        match &self.layout {
            Layout::Flat { records, page_size } => {
                let total = request.total_segments.max(1) as usize;
                let mine: Vec<&Record> = records
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| index % total == request.segment as usize)
                    .map(|(_, record)| record)
                    .collect();
                let start = offset.min(mine.len());
                let end = (start + page_size).min(mine.len());
                Ok(ScanPage {
                    records: mine[start..end].iter().map(|r| (*r).clone()).collect(),
                    next_token: (end < mine.len()).then_some(ContinuationToken::Offset(end)),
                })
            }
            Layout::Scripted { pages } => {
                let Some(segment_pages) = pages.get(&request.segment) else {
                    return Ok(ScanPage::default());
                };
                let records = segment_pages.get(offset).cloned().unwrap_or_default();
                let next = offset + 1;
                Ok(ScanPage {
                    records,
                    next_token: (next < segment_pages.len())
                        .then_some(ContinuationToken::Offset(next)),
                })
            }
        }
    }
}

#[async_trait]
impl TableReader for InMemoryTable {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, TableError> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        let offset = match &request.token {
            None => 0,
            Some(ContinuationToken::Offset(offset)) => *offset,
            Some(other) => {
                return Err(TableError::other(anyhow::anyhow!(
                    "💀 in-memory table was handed a token it never minted: {other:?}"
                )));
            }
        };
        let page = state.page_index(offset);

        if let Some(message) = state.failures.get(&(request.segment, page)) {
            return Err(TableError::other(anyhow::anyhow!("{message}")));
        }
        if let Some(remaining) = state.throttles.get_mut(&(request.segment, page)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TableError::throttled(format!(
                    "segment {} page {page} is over its provisioned throughput",
                    request.segment
                )));
            }
        }

        state.read(request, offset)
    }
}
