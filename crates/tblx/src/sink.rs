//! 📝 The File Sink: one output file, from first header byte to durable commit.
//!
//! Rows go in, CSV lines come out, optionally squished through gzip, cut into
//! chunks, and handed to a [`FlushWorker`] over a bounded channel. When that
//! channel is full, `write_row` says `false` ("hold on") instead of buffering
//! forever, and the caller awaits `drained()` before the next row. That's the
//! whole backpressure story: at most one chunk held back, plus whatever fits
//! in the queue.
//!
//! ```text
//! Row → RowEncoder → [gzip] → staged → chunk ─(bounded queue)→ FlushWorker → Destination
//! ```
//!
//! 💀 Nothing here retries. A failed write is a failed file.

use std::io::Write;
use std::sync::Arc;

use async_channel::{Sender, TrySendError};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::backends::{ObjectStore, StoreBackend};
use crate::common::{FileKey, Row};
use crate::errors::{BoxError, ExportError};
use crate::workers::{FlushWorker, SinkMessage, Worker};

mod encoder;

use encoder::RowEncoder;

// -- 📏 64 KiB: big enough to not spam syscalls, small enough to not hoard RAM
const DEFAULT_CHUNK_SIZE_BYTES: usize = 64 * 1024;
const DEFAULT_QUEUE_DEPTH: usize = 4;

/// 🔧 Knobs for every sink a scanner opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    /// 📦 The backpressure unit: bytes staged before a chunk is handed off.
    pub chunk_size_bytes: usize,
    /// 🚦 Chunks the flusher queue holds before `write_row` starts saying "wait".
    pub queue_depth: usize,
    pub delimiter: u8,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            delimiter: b',',
        }
    }
}

/// 🏁 What a successfully closed file leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub key: FileKey,
    pub location: String,
    pub rows: u64,
    pub bytes: u64,
}

enum Compressor {
    Plain,
    Gzip(GzEncoder<Vec<u8>>),
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 GzEncoder is a diva and doesn't do Debug
        match self {
            Compressor::Plain => f.write_str("Plain"),
            Compressor::Gzip(_) => f.write_str("Gzip"),
        }
    }
}

#[derive(Debug)]
pub struct FileSink {
    key: FileKey,
    location: String,
    encoder: RowEncoder,
    compressor: Compressor,
    chunk_size: usize,
    // -- encoded (and maybe compressed) bytes not yet cut into a chunk
    staged: Vec<u8>,
    // -- the one chunk the full queue wouldn't take
    pending: Option<SinkMessage>,
    tx: Sender<SinkMessage>,
    flusher: Option<JoinHandle<Result<(), ExportError>>>,
    rows: u64,
    bytes_written: u64,
}

impl FileSink {
    /// 🚀 Create the destination, spin up its flusher, and (with explicit
    /// columns) encode the header right away.
    pub async fn open(
        store: &StoreBackend,
        key: FileKey,
        columns: Option<Arc<[String]>>,
        settings: &SinkSettings,
    ) -> Result<Self, ExportError> {
        let location = store.describe(&key);
        let destination = store
            .create(&key)
            .await
            .map_err(|err| ExportError::SinkOpen {
                segment: key.segment,
                location: location.clone(),
                source: err.into(),
            })?;

        let (tx, rx) = async_channel::bounded(settings.queue_depth.max(1));
        let flusher = FlushWorker::new(rx, destination, key.segment, location.clone()).start();
        let compressor = if key.compressed {
            Compressor::Gzip(GzEncoder::new(Vec::new(), Compression::default()))
        } else {
            Compressor::Plain
        };
        debug!("📂 opened {location}");

        let mut sink = Self {
            encoder: RowEncoder::new(columns, settings.delimiter),
            compressor,
            chunk_size: settings.chunk_size_bytes.max(1),
            staged: Vec::new(),
            pending: None,
            tx,
            flusher: Some(flusher),
            rows: 0,
            bytes_written: 0,
            key,
            location,
        };
        let mut header = Vec::new();
        sink.encoder
            .encode_header(&mut header)
            .map_err(|err| sink.write_error(err))?;
        sink.stage(&header)?;
        Ok(sink)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// 📏 Bytes that left the encoder toward the destination (post-gzip when
    /// compressed). Only ever grows.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// ✍️ Encode one row. `Ok(false)` means the flusher queue is full: await
    /// [`FileSink::drained`] before writing again.
    pub fn write_row(&mut self, row: &Row) -> Result<bool, ExportError> {
        let mut line = Vec::new();
        self.encoder
            .encode(row, &mut line)
            .map_err(|err| self.write_error(err))?;
        self.rows += 1;
        self.stage(&line)?;

        if self.pending.is_some() {
            return Ok(false);
        }
        if self.staged.len() < self.chunk_size {
            return Ok(true);
        }
        let chunk = SinkMessage::Bytes(std::mem::take(&mut self.staged));
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(chunk)) | Err(TrySendError::Closed(chunk)) => {
                // -- closed means the flusher died. drained() will dig up why.
                trace!("🚦 {} queue full, holding one chunk back", self.location);
                self.pending = Some(chunk);
                Ok(false)
            }
        }
    }

    /// ⏳ Wait until the held-back chunk is in the queue.
    pub async fn drained(&mut self) -> Result<(), ExportError> {
        if let Some(chunk) = self.pending.take() {
            self.send(chunk).await?;
        }
        Ok(())
    }

    /// 🏁 Finish the stream, hand off every byte, commit, and wait for the
    /// destination to say it's durable.
    pub async fn close(mut self) -> Result<ClosedFile, ExportError> {
        self.finish_compression()?;
        self.drained().await?;
        if !self.staged.is_empty() {
            let rest = std::mem::take(&mut self.staged);
            self.send(SinkMessage::Bytes(rest)).await?;
        }
        self.send(SinkMessage::Commit).await?;
        self.tx.close();

        match self.flusher.take() {
            Some(flusher) => match flusher.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(source) => {
                    return Err(ExportError::TaskFailed {
                        segment: self.key.segment,
                        source,
                    });
                }
            },
            None => return Err(self.flusher_gone()),
        }

        debug!(
            "🏁 closed {} ({} rows, {} bytes)",
            self.location, self.rows, self.bytes_written
        );
        Ok(ClosedFile {
            key: self.key,
            location: self.location,
            rows: self.rows,
            bytes: self.bytes_written,
        })
    }

    /// 🗑️ Close the queue without committing. The flusher throws the
    /// destination away (partial file removed, multipart upload aborted).
    pub async fn abort(mut self) {
        debug!("🗑️ aborting {}", self.location);
        self.pending = None;
        self.tx.close();
        if let Some(flusher) = self.flusher.take() {
            // -- whatever went wrong already has an error in flight. this one can stay quiet.
            let _ = flusher.await;
        }
    }

    fn stage(&mut self, encoded: &[u8]) -> Result<(), ExportError> {
        if encoded.is_empty() {
            return Ok(());
        }
        let produced = match &mut self.compressor {
            Compressor::Plain => {
                self.staged.extend_from_slice(encoded);
                encoded.len()
            }
            Compressor::Gzip(gz) => {
                if let Err(err) = gz.write_all(encoded) {
                    return Err(self.write_error(err));
                }
                let out = gz.get_mut();
                let produced = out.len();
                self.staged.append(out);
                produced
            }
        };
        self.bytes_written += produced as u64;
        Ok(())
    }

    fn finish_compression(&mut self) -> Result<(), ExportError> {
        if let Compressor::Gzip(gz) = &mut self.compressor {
            if let Err(err) = gz.try_finish() {
                return Err(ExportError::SinkClose {
                    segment: self.key.segment,
                    location: self.location.clone(),
                    source: err.into(),
                });
            }
            let out = gz.get_mut();
            self.bytes_written += out.len() as u64;
            self.staged.append(out);
        }
        Ok(())
    }

    async fn send(&mut self, message: SinkMessage) -> Result<(), ExportError> {
        if self.tx.send(message).await.is_ok() {
            return Ok(());
        }
        // -- the flusher hung up on us. its JoinHandle knows why.
        Err(self.flusher_failure().await)
    }

    async fn flusher_failure(&mut self) -> ExportError {
        match self.flusher.take() {
            Some(flusher) => match flusher.await {
                Ok(Err(err)) => err,
                Ok(Ok(())) => self.flusher_gone(),
                Err(source) => ExportError::TaskFailed {
                    segment: self.key.segment,
                    source,
                },
            },
            None => self.flusher_gone(),
        }
    }

    fn flusher_gone(&self) -> ExportError {
        self.write_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "flusher stopped before the file was committed",
        ))
    }

    fn write_error(&self, err: impl Into<BoxError>) -> ExportError {
        ExportError::SinkWrite {
            segment: self.key.segment,
            location: self.location.clone(),
            source: err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::common::Record;
    use crate::projector::RowProjector;
    use std::io::Read;

    fn rows(n: usize) -> anyhow::Result<Vec<Row>> {
        let projector = RowProjector::new(None);
        (0..n)
            .map(|i| -> anyhow::Result<Row> {
                let record = Record::new().with("id", i).with("name", format!("friend-{i}"));
                Ok(projector.project(&record)?)
            })
            .collect()
    }

    #[tokio::test]
    async fn the_one_where_explicit_columns_write_a_header_even_with_no_rows() -> anyhow::Result<()> {
        let memory = InMemoryStore::new();
        let store = StoreBackend::InMemory(memory.clone());
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();

        let sink = FileSink::open(
            &store,
            FileKey::new("friends", 0, 0, false),
            Some(columns),
            &SinkSettings::default(),
        )
        .await?;
        let closed = sink.close().await?;

        assert_eq!(closed.rows, 0);
        assert_eq!(closed.bytes, "id,name\n".len() as u64);
        assert_eq!(
            memory.object("friends/friends-0-0.csv").await,
            Some(b"id,name\n".to_vec())
        );
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn the_one_where_a_full_queue_says_wait_and_drained_lets_us_continue() -> anyhow::Result<()> {
        let memory = InMemoryStore::new();
        let store = StoreBackend::InMemory(memory.clone());
        let settings = SinkSettings {
            chunk_size_bytes: 1,
            queue_depth: 1,
            delimiter: b',',
        };
        let mut sink = FileSink::open(&store, FileKey::new("friends", 0, 0, false), None, &settings).await?;

        // -- nothing yields between these writes, so the flusher can't empty the queue yet
        let batch = rows(3)?;
        assert!(sink.write_row(&batch[0])?);
        assert!(!sink.write_row(&batch[1])?);
        sink.drained().await?;
        sink.write_row(&batch[2])?;
        sink.drained().await?;
        let closed = sink.close().await?;

        assert_eq!(closed.rows, 3);
        let written = memory
            .object("friends/friends-0-0.csv")
            .await
            .ok_or_else(|| anyhow::anyhow!("💀 file never committed"))?;
        assert_eq!(
            String::from_utf8(written)?,
            "id,name\n0,friend-0\n1,friend-1\n2,friend-2\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_gzip_output_decodes_back_to_the_csv() -> anyhow::Result<()> {
        let memory = InMemoryStore::new();
        let store = StoreBackend::InMemory(memory.clone());
        let mut sink = FileSink::open(
            &store,
            FileKey::new("friends", 1, 0, true),
            None,
            &SinkSettings::default(),
        )
        .await?;
        for row in rows(50)? {
            if !sink.write_row(&row)? {
                sink.drained().await?;
            }
        }
        let closed = sink.close().await?;

        let written = memory
            .object("friends/friends-1-0.csv.gz")
            .await
            .ok_or_else(|| anyhow::anyhow!("💀 file never committed"))?;
        assert_eq!(closed.bytes, written.len() as u64);
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(written.as_slice()).read_to_string(&mut decoded)?;
        assert_eq!(decoded.lines().count(), 51);
        assert!(decoded.starts_with("id,name\n0,friend-0\n"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_broken_destination_surfaces_a_write_error() -> anyhow::Result<()> {
        let memory = InMemoryStore::new().failing_writes_to("friends-0-0");
        let store = StoreBackend::InMemory(memory.clone());
        let mut sink = FileSink::open(&store, FileKey::new("friends", 0, 0, false), None, &SinkSettings::default()).await?;
        for row in rows(2)? {
            sink.write_row(&row)?;
        }

        let err = sink.close().await.unwrap_err();
        assert!(matches!(err, ExportError::SinkWrite { segment: 0, .. }), "got {err:?}");
        assert!(memory.objects().await.is_empty());
        assert_eq!(memory.aborted().await, vec!["friends/friends-0-0.csv".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_aborted_sink_commits_nothing() -> anyhow::Result<()> {
        let memory = InMemoryStore::new();
        let store = StoreBackend::InMemory(memory.clone());
        let mut sink = FileSink::open(&store, FileKey::new("friends", 0, 0, false), None, &SinkSettings::default()).await?;
        for row in rows(2)? {
            sink.write_row(&row)?;
        }
        sink.abort().await;

        assert!(memory.objects().await.is_empty());
        assert_eq!(memory.aborted().await.len(), 1);
        Ok(())
    }
}
