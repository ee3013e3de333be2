//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 Tables pour the records, stores swallow the files.
//! And in between, the engine panics! (kidding, we return `ExportError`)
//!
//! 🎭 This module is the casting agency. Need to scan DynamoDB? Replay an
//! NDJSON fixture? Conjure a table out of thin RAM? Land the files on local
//! disk, in a bucket, or in a `BTreeMap` a test can poke at? We've got a
//! backend for that.
//!
//! Pattern, same on both sides: trait → concrete impls → enum dispatcher.
//! The engine only ever holds the enum. It does not know, and does not want
//! to know, whether the bytes are going to an SSD in the basement or a data
//! center in Virginia.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

use crate::app_config::{DestinationConfig, TableConfig};
use crate::common::{FileKey, Record};
use crate::errors::TableError;

pub mod dynamodb;
pub mod file;
pub mod in_mem;
pub mod s3;

pub use dynamodb::{DynamoDbTable, DynamoDbTableConfig};
pub use file::{FileTable, FileTableConfig, LocalFile, LocalStore, LocalStoreConfig};
pub use in_mem::{InMemoryObject, InMemoryStore, InMemoryTable};
pub use s3::{S3Store, S3StoreConfig, S3Upload};

// ===== Table side =====

/// 🔖 Where the last read stopped. Opaque to everyone except the backend that
/// minted it. `None` after a read means the segment is done; nothing else does.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationToken {
    /// 📍 Position inside an in-memory segment.
    Offset(usize),
    /// 🗝️ DynamoDB's `LastEvaluatedKey`, handed back verbatim as `ExclusiveStartKey`.
    DynamoKey(HashMap<String, AttributeValue>),
}

/// 📨 One page request for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub table: String,
    pub segment: u32,
    pub total_segments: u32,
    pub token: Option<ContinuationToken>,
}

/// 📄 One page of records plus the token for the next page (or `None`, the end).
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub records: Vec<Record>,
    pub next_token: Option<ContinuationToken>,
}

/// 🚰 A table that can be scanned one segment-page at a time.
///
/// # Contract
/// - Segments are disjoint and together cover the table.
/// - A page may be empty and still carry a token. Keep reading.
/// - Throttling is reported as `TableError::Throttled`, never retried here.
#[async_trait]
pub trait TableReader: std::fmt::Debug + Send + Sync {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, TableError>;
}

/// 🎭 The many faces of a table.
#[derive(Debug, Clone)]
pub enum TableBackend {
    InMemory(InMemoryTable),
    File(FileTable),
    DynamoDb(DynamoDbTable),
}

impl TableBackend {
    /// 🏗️ Build whichever table the config points at.
    pub async fn from_config(config: &TableConfig) -> Result<Self> {
        Ok(match config {
            TableConfig::File(file_config) => TableBackend::File(FileTable::load(file_config).await?),
            TableConfig::DynamoDb(dynamo_config) => {
                TableBackend::DynamoDb(DynamoDbTable::new(dynamo_config).await)
            }
        })
    }
}

#[async_trait]
impl TableReader for TableBackend {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, TableError> {
        match self {
            TableBackend::InMemory(table) => table.scan(request).await,
            TableBackend::File(table) => table.scan(request).await,
            TableBackend::DynamoDb(table) => table.scan(request).await,
        }
    }
}

// ===== Store side =====

/// 🕳️ An open output object that accepts bytes in order.
///
/// # Contract
/// - `write_chunk` appends. Chunks arrive in the order they were produced.
/// - `finish` makes the object durable and visible. Resolves only when it is.
/// - `abort` throws away whatever was written. Best effort, but try hard.
#[async_trait]
pub trait Destination: std::fmt::Debug + Send {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
    async fn abort(&mut self) -> Result<()>;
}

/// 🏪 Something that can hold output files: a directory, a bucket, a map.
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync {
    /// 📂 Make sure the container for this table exists (or fail loudly).
    async fn prepare(&self, table: &str) -> Result<()>;
    /// 🆕 Open a fresh destination for one file.
    async fn create(&self, key: &FileKey) -> Result<DestinationBackend>;
    /// 🏷️ Human-readable location, for logs and events.
    fn describe(&self, key: &FileKey) -> String;
}

/// 🎭 The many faces of an output file.
#[derive(Debug)]
pub enum DestinationBackend {
    Local(LocalFile),
    S3(S3Upload),
    InMemory(InMemoryObject),
}

#[async_trait]
impl Destination for DestinationBackend {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        match self {
            DestinationBackend::Local(file) => file.write_chunk(chunk).await,
            DestinationBackend::S3(upload) => upload.write_chunk(chunk).await,
            DestinationBackend::InMemory(object) => object.write_chunk(chunk).await,
        }
    }

    async fn finish(&mut self) -> Result<()> {
        match self {
            DestinationBackend::Local(file) => file.finish().await,
            DestinationBackend::S3(upload) => upload.finish().await,
            DestinationBackend::InMemory(object) => object.finish().await,
        }
    }

    async fn abort(&mut self) -> Result<()> {
        match self {
            DestinationBackend::Local(file) => file.abort().await,
            DestinationBackend::S3(upload) => upload.abort().await,
            DestinationBackend::InMemory(object) => object.abort().await,
        }
    }
}

/// 🎭 The many faces of a store. Mirrors `TableBackend` on the other end of
/// the pipe. Whoever designed this was clearly a fan of symmetry.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Local(LocalStore),
    S3(S3Store),
    InMemory(InMemoryStore),
}

impl StoreBackend {
    pub async fn from_config(config: &DestinationConfig) -> Result<Self> {
        Ok(match config {
            DestinationConfig::Local(local_config) => {
                StoreBackend::Local(LocalStore::new(local_config))
            }
            DestinationConfig::S3(s3_config) => StoreBackend::S3(S3Store::new(s3_config).await?),
        })
    }
}

#[async_trait]
impl ObjectStore for StoreBackend {
    async fn prepare(&self, table: &str) -> Result<()> {
        match self {
            StoreBackend::Local(store) => store.prepare(table).await,
            StoreBackend::S3(store) => store.prepare(table).await,
            StoreBackend::InMemory(store) => store.prepare(table).await,
        }
    }

    async fn create(&self, key: &FileKey) -> Result<DestinationBackend> {
        match self {
            StoreBackend::Local(store) => store.create(key).await,
            StoreBackend::S3(store) => store.create(key).await,
            StoreBackend::InMemory(store) => store.create(key).await,
        }
    }

    fn describe(&self, key: &FileKey) -> String {
        match self {
            StoreBackend::Local(store) => store.describe(key),
            StoreBackend::S3(store) => store.describe(key),
            StoreBackend::InMemory(store) => store.describe(key),
        }
    }
}
