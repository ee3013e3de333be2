use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};
use tracing::{trace, warn};

use crate::backends::{Destination, DestinationBackend, ObjectStore};
use crate::common::FileKey;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LocalStoreConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    // -- 🏠 right here. wherever "here" is. check your cwd.
    PathBuf::from(".")
}

/// 🏠 Output files on local disk: `{output_dir}/{table}/{table}-{segment}-{index}.csv[.gz]`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    output_dir: PathBuf,
}

impl LocalStore {
    pub fn new(config: &LocalStoreConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
        }
    }

    fn path_for(&self, key: &FileKey) -> PathBuf {
        self.output_dir.join(&key.table).join(key.file_name())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn prepare(&self, table: &str) -> Result<()> {
        let dir = self.output_dir.join(table);
        tokio::fs::create_dir_all(&dir).await.with_context(|| {
            format!(
                "💀 Could not create output directory '{}'. Permissions were set by \
                 someone who really, truly, did not want this directory to exist.",
                dir.display()
            )
        })
    }

    async fn create(&self, key: &FileKey) -> Result<DestinationBackend> {
        Ok(DestinationBackend::Local(LocalFile::create(self.path_for(key)).await?))
    }

    fn describe(&self, key: &FileKey) -> String {
        self.path_for(key).display().to_string()
    }
}

/// 🚰 One file on disk, behind a `BufWriter`. Not real until `finish` fsyncs it.
///
/// ⚠️ `File::create` truncates if the file exists. No warning. No backup. Just gone.
/// Re-running an export overwrites the previous run's files of the same name.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    // -- None once finished or aborted. the writer is gone, the path remains.
    file_buf: Option<io::BufWriter<File>>,
}

impl LocalFile {
    async fn create(path: PathBuf) -> Result<Self> {
        let file_handle = File::create(&path).await.with_context(|| {
            format!(
                "💀 The output file '{}' could not be conjured into existence",
                path.display()
            )
        })?;
        Ok(Self {
            path,
            file_buf: Some(io::BufWriter::new(file_handle)),
        })
    }

    fn writer(&mut self) -> Result<&mut io::BufWriter<File>> {
        self.file_buf
            .as_mut()
            .with_context(|| format!("💀 '{}' was already closed", self.path.display()))
    }
}

#[async_trait]
impl Destination for LocalFile {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        trace!("📬 {} bytes walked into {}", chunk.len(), self.path.display());
        let path = self.path.display().to_string();
        self.writer()?
            .write_all(&chunk)
            .await
            .with_context(|| format!("💀 Error writing to '{path}'"))
    }

    async fn finish(&mut self) -> Result<()> {
        let path = self.path.display().to_string();
        let file_buf = self.writer()?;
        // -- 🎬 final flush. the BufWriter empties its soul to disk, the orchestra swells.
        file_buf
            .flush()
            .await
            .with_context(|| format!("💀 Error flushing '{path}'"))?;
        file_buf
            .get_mut()
            .sync_all()
            .await
            .with_context(|| format!("💀 Error syncing '{path}' to disk"))?;
        self.file_buf = None;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        // -- 🗑️ drop the handle first, then the evidence
        self.file_buf = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!("⚠️ could not remove partial file {}: {err}", self.path.display());
                Err(err).with_context(|| format!("💀 Error removing '{}'", self.path.display()))
            }
        }
    }
}
