use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::backends::in_mem::InMemoryTable;
use crate::backends::{ScanPage, ScanRequest, TableReader};
use crate::common::Record;
use crate::errors::TableError;

// -- 📂 FileTableConfig lives here, cozy next to the FileTable that uses it.
// -- One backend = one config = one file. No 2am scavenger hunts.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FileTableConfig {
    pub file_name: PathBuf,
    #[serde(default = "InMemoryTable::default_page_size")]
    pub page_size: usize,
}

/// 📂 FileTable: an NDJSON file read once at startup and served page by page.
///
/// One JSON object per line. Blank lines are skipped. Anything that isn't an
/// object is a startup error with a line number, because finding out at page
/// 4,000 that line 3 was an array is nobody's idea of a good time.
///
/// Segments are dealt round-robin like the in-memory table (it IS the
/// in-memory table, wearing a file-shaped trench coat).
#[derive(Debug, Clone)]
pub struct FileTable {
    path: PathBuf,
    inner: InMemoryTable,
}

impl FileTable {
    pub async fn load(config: &FileTableConfig) -> Result<Self> {
        let contents = tokio::fs::read_to_string(&config.file_name)
            .await
            .with_context(|| {
                format!(
                    "💀 The fixture file '{}' could not be read. We stared at the path. \
                     The path stared back. One of us was wrong about whether it existed.",
                    config.file_name.display()
                )
            })?;
        let records = parse_ndjson(&contents)
            .with_context(|| format!("💀 Fixture '{}' is not valid NDJSON", config.file_name.display()))?;
        info!(
            "📂 loaded {} records from fixture {}",
            records.len(),
            config.file_name.display()
        );
        Ok(Self {
            path: config.file_name.clone(),
            inner: InMemoryTable::from_records(records, config.page_size),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

fn parse_ndjson(contents: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("line {} is not JSON", index + 1))?;
        let object = value
            .as_object()
            .with_context(|| format!("line {} is not a JSON object", index + 1))?;
        records.push(Record::from_json_object(object));
    }
    Ok(records)
}

#[async_trait]
impl TableReader for FileTable {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, TableError> {
        self.inner.scan(request).await
    }
}
