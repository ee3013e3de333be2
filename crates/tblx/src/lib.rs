//! 📤 tblx: export a table to CSV files, one segment at a time, all segments at once.
//!
//! 🎬 *[narrator voice]* "It started with one table. Too big to scan. Too
//! important to ignore. So we cut it into segments, and gave each one a file."
//!
//! 🧭 Where things live:
//! - [`coordinator`]: the job, the fan-out, the final tally;
//! - [`workers`]: the segment scanner, the flusher, the child-process worker;
//! - [`sink`] + [`projector`]: records → rows → CSV bytes → chunks;
//! - [`backends`]: tables that get scanned and stores that receive files;
//! - [`events`] + [`progress`]: the running commentary and who watches it;
//! - [`app_config`]: figment, TOML, and `TBLX_*` env vars.
//!
//! 🦆 The duck is here because every crate root must have one. This is law.

pub mod app_config;
pub mod backends;
pub mod backoff;
pub mod common;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod progress;
pub mod projector;
pub mod sink;
pub mod workers;

use anyhow::Context;
use tracing::info;

use crate::app_config::AppConfig;
use crate::backends::{StoreBackend, TableBackend};
use crate::coordinator::{ExportCoordinator, ScanSettings};
use crate::events::EventReceiver;

pub use crate::coordinator::{ExportJob, ExportSummary, SegmentReport};
pub use crate::errors::ExportError;

/// 🏗️ Wire a coordinator from config: table, store, runtime knobs. Runs
/// in-process until the caller hands it another [`coordinator::Executor`].
pub async fn build_coordinator(
    config: &AppConfig,
) -> anyhow::Result<(ExportCoordinator, EventReceiver)> {
    let table = TableBackend::from_config(&config.table)
        .await
        .context("💀 Could not set up the table backend. Check the [table] section.")?;
    let store = StoreBackend::from_config(&config.destination)
        .await
        .context("💀 Could not set up the destination. Check the [destination] section.")?;
    let settings = ScanSettings::try_from(&config.runtime)?;
    info!(
        "🔧 table backend ready, writing through {:?} ({} byte chunks, queue depth {})",
        config.destination, settings.sink.chunk_size_bytes, settings.sink.queue_depth
    );
    Ok(ExportCoordinator::new(table, store, settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{DestinationConfig, RuntimeConfig, TableConfig};
    use crate::backends::{FileTableConfig, LocalStoreConfig};
    use std::io::Write;

    #[tokio::test]
    async fn the_one_where_config_goes_in_and_csv_comes_out() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fixture = dir.path().join("pets.ndjson");
        let mut file = std::fs::File::create(&fixture)?;
        writeln!(file, r#"{{"id": 1, "name": "Marcel", "species": "monkey"}}"#)?;
        writeln!(file, r#"{{"id": 2, "name": "Chick", "species": "chicken"}}"#)?;
        writeln!(file, r#"{{"id": 3, "name": "Duck", "species": "duck"}}"#)?;
        drop(file);

        let config = AppConfig {
            table: TableConfig::File(FileTableConfig {
                file_name: fixture,
                page_size: 2,
            }),
            destination: DestinationConfig::Local(LocalStoreConfig {
                output_dir: dir.path().join("out"),
            }),
            runtime: RuntimeConfig::default(),
        };
        let (coordinator, _events) = build_coordinator(&config).await?;

        let summary = coordinator
            .export_table(&ExportJob::new("pets").with_columns(["name", "species"]))
            .await?;

        assert_eq!(summary.rows, 3);
        let csv = std::fs::read_to_string(dir.path().join("out/pets/pets-0-0.csv"))?;
        assert_eq!(csv, "name,species\nMarcel,monkey\nChick,chicken\nDuck,duck\n");
        Ok(())
    }
}
