//! 🧵 Workers: the ones who actually do the work while the coordinator takes
//! all the credit in the sprint retro.
//!
//! Three kinds, one contract:
//! - [`SegmentScanner`]: reads one segment page by page into rotating files;
//! - [`ProcessWorker`]: the same job, outsourced to a child process;
//! - [`FlushWorker`]: drains one file's byte chunks into its destination.
//!
//! ⚠️ "If you're reading this, the code review went poorly."

use tokio::task::JoinHandle;

use crate::errors::ExportError;

mod flush_worker;
mod process_worker;
mod scanner;

pub(crate) use flush_worker::{FlushWorker, SinkMessage};
pub use process_worker::{ProcessWorker, REPORT_PREFIX, WorkerCommand};
pub(crate) use scanner::SegmentScanner;

/// 🏗️ A background worker, that does work. duh.
///
/// "What's the DEAL with lifetime annotations? You borrow something,
///  you give it back. It's not that hard, Jerry!" (Seinfeld, on Rust)
pub(crate) trait Worker {
    type Output: Send + 'static;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust but verify.
    /// Mostly verify.
    fn start(self) -> JoinHandle<Result<Self::Output, ExportError>>;
}
