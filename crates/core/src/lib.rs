//! Core domain types for bibsync.
//!
//! This crate defines the local side of a shared bibliography:
//! - Entries with their shared-database sidecar (id + version)
//! - The in-memory database and the events its mutations produce
//! - Flat key/value metadata and the save actions stored in it
//! - Connection properties and application configuration

pub mod cleanup;
pub mod config;
pub mod database;
pub mod entry;
pub mod error;
pub mod event;
pub mod metadata;

pub use cleanup::{FieldChange, FieldFormatter, FieldFormatterCleanup, FieldFormatterCleanups};
pub use config::{
    AppConfig, ConnectionProperties, ConnectionPropertiesBuilder, DatabaseType,
    SharedDatabaseConfig, SyncConfig,
};
pub use database::{BibDatabase, BibDatabaseContext};
pub use entry::{BibEntry, EntryId, SharedBibEntryData, UNSHARED_ID};
pub use error::{Error, Result};
pub use event::{DatabaseEvent, EventSource};
pub use metadata::MetaData;

/// Pseudo field name used when an entry type change is reported as a field change.
pub const TYPE_HEADER: &str = "entrytype";
