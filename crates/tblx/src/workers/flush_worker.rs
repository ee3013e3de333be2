//! 🎬 *[a channel fills with byte chunks. somewhere, a destination waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗑️ The FlushWorker: patient, tireless, deeply unbothered by the chaos
//! happening upstream. It receives chunks. It writes chunks. When it gets the
//! commit marker it finalizes the file. When the channel closes without one,
//! it throws the file away. It asks no questions.

use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::Worker;
use crate::backends::{Destination, DestinationBackend};
use crate::errors::ExportError;

/// ✉️ What travels from a `FileSink` to its flusher.
#[derive(Debug)]
pub(crate) enum SinkMessage {
    Bytes(Vec<u8>),
    /// ✅ Everything has been sent. Make it durable.
    Commit,
}

#[derive(Debug)]
pub(crate) struct FlushWorker {
    rx: Receiver<SinkMessage>,
    destination: DestinationBackend,
    segment: u32,
    location: String,
}

impl FlushWorker {
    pub(crate) fn new(
        rx: Receiver<SinkMessage>,
        destination: DestinationBackend,
        segment: u32,
        location: String,
    ) -> Self {
        Self {
            rx,
            destination,
            segment,
            location,
        }
    }

    async fn run(mut self) -> Result<(), ExportError> {
        debug!("📥 flusher for {} started draining", self.location);
        loop {
            match self.rx.recv().await {
                Ok(SinkMessage::Bytes(chunk)) => {
                    trace!("🪣 {} bytes headed for {}", chunk.len(), self.location);
                    if let Err(err) = self.destination.write_chunk(chunk).await {
                        self.abandon().await;
                        return Err(ExportError::SinkWrite {
                            segment: self.segment,
                            location: self.location,
                            source: err.into(),
                        });
                    }
                }
                Ok(SinkMessage::Commit) => {
                    if let Err(err) = self.destination.finish().await {
                        self.abandon().await;
                        return Err(ExportError::SinkClose {
                            segment: self.segment,
                            location: self.location,
                            source: err.into(),
                        });
                    }
                    debug!("🏁 {} is durable", self.location);
                    return Ok(());
                }
                Err(_) => {
                    // -- channel closed without a commit: the sink was aborted
                    debug!("🗑️ {} closed without commit, aborting", self.location);
                    self.abandon().await;
                    return Ok(());
                }
            }
        }
    }

    async fn abandon(&mut self) {
        self.rx.close();
        if let Err(err) = self.destination.abort().await {
            warn!("⚠️ could not clean up {}: {err:#}", self.location);
        }
    }
}

impl Worker for FlushWorker {
    type Output = ();

    fn start(self) -> JoinHandle<Result<(), ExportError>> {
        tokio::spawn(self.run())
    }
}
