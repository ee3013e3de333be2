//! # Previously, on tblx...
//!
//! 🎬 The table was too big to scan in one go, so someone split it into
//! segments. The segments were too slow to test against a real cloud, so
//! someone put the whole table in RAM. That someone was this module.
//!
//! `in_mem` provides an in-memory table and an in-memory object store for
//! tests and local development. The [`InMemoryTable`] serves records page by
//! page and can be told to throttle or fail on cue. The [`InMemoryStore`]
//! keeps committed files in a shared map so callers can inspect what landed.
//!
//! ⚠️ This is NOT for production. If you're deploying this to prod, please
//! also deploy a therapist.

mod in_mem_store;
mod in_mem_table;

pub use in_mem_store::{InMemoryObject, InMemoryStore};
pub use in_mem_table::InMemoryTable;
