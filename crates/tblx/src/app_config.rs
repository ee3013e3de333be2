//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{DynamoDbTableConfig, FileTableConfig, LocalStoreConfig, S3StoreConfig};

/// 📦 One struct to rule them all, one struct to find them, one struct to
/// bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// 🚰 Where the records come from.
    pub table: TableConfig,
    /// 🏪 Where the CSV files go. Local disk unless told otherwise.
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🚰 Which table backend to scan. Env vars arrive lowercased, hence the aliases.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum TableConfig {
    #[serde(alias = "file")]
    File(FileTableConfig),
    #[serde(alias = "dynamodb", alias = "dynamo_db")]
    DynamoDb(DynamoDbTableConfig),
}

/// 🏪 Which store receives the files.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum DestinationConfig {
    #[serde(alias = "local")]
    Local(LocalStoreConfig),
    #[serde(alias = "s3")]
    S3(S3StoreConfig),
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig::Local(LocalStoreConfig::default())
    }
}

/// 🧵 Where segments run.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One tokio task per segment.
    #[default]
    InProcess,
    /// One child process per segment.
    Process,
}

/// 🎛️ Knobs that shape the run, not the data.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// 📦 Bytes staged before a chunk goes to the flusher. The backpressure unit.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// 🚦 Chunks queued per sink before `write_row` starts saying "wait".
    #[serde(default = "default_sink_queue_depth")]
    pub sink_queue_depth: usize,
    /// ⏳ First throttle wait in milliseconds. Doubles per consecutive throttle.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub execution: ExecutionMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size_bytes(),
            sink_queue_depth: default_sink_queue_depth(),
            backoff_base_ms: default_backoff_base_ms(),
            delimiter: default_delimiter(),
            execution: ExecutionMode::default(),
        }
    }
}

// -- 📏 64 KiB chunks. big enough to not spam syscalls, small enough to not hoard RAM.
fn default_chunk_size_bytes() -> usize {
    64 * 1024
}

fn default_sink_queue_depth() -> usize {
    4
}

// -- ⏳ one second, then two, then four. DynamoDB appreciates the gesture.
fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_delimiter() -> char {
    ','
}

/// 🚀 Load the config from `TBLX_*` env vars, plus a TOML file if one is given.
///
/// Nested keys split on `__`: `TBLX_RUNTIME__SINK_QUEUE_DEPTH=8` lands in
/// `runtime.sink_queue_depth`. The file is merged last, so TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "(env only)".to_string())
    );

    let config = Figment::new().merge(Env::prefixed("TBLX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (TBLX_*). \
             The file exists in our hearts, but apparently not in valid TOML.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (TBLX_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}
