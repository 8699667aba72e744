/// Dataset file handling
///
/// This module handles:
/// - Persisting uploaded dataset bytes (durable.rs)
/// - Parsing CSV/JSON datasets and summarizing their columns (analysis.rs)

pub mod analysis;
pub mod durable;

pub use analysis::{DataFormat, Table};
pub use durable::{
    AccessPrompt, AutoGrant, Backup, DenyAccess, DurableFileStore, FileBackend, StorageStrategy, StoredFile,
};
