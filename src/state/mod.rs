/// State management module
///
/// This module handles all persisted state, including:
/// - The catalog database and its collections (library.rs)
/// - Shared record types stored in it (data.rs)

pub mod data;
pub mod library;
