//! 📂 Previously, on "Things That Could Go Wrong With A File"...
//!
//! The disk was quiet. Too quiet. A lone process had been tasked with writing
//! a CSV. Just a CSV, they said. Simple, they said. The directory didn't exist.
//! The disk was full. The fsync took eleven seconds.
//!
//! This module is everything tblx does with the local filesystem:
//! - [`FileTable`]: an NDJSON fixture pretending to be a scannable table, so
//!   the CLI can export something without a cloud account;
//! - [`LocalStore`] / [`LocalFile`]: output files under `{output_dir}/{table}/`,
//!   written through a `BufWriter` and fsynced on finish.
//!
//! 💀 Disk full → your problem now
//! 🦆 (mandatory, no notes)

mod file_table;
mod local_store;

pub use file_table::{FileTable, FileTableConfig};
pub use local_store::{LocalFile, LocalStore, LocalStoreConfig};
