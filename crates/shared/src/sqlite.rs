//! SQLite processor.
//!
//! A file-backed shared database for single-host setups and tests. There is no
//! push channel, so clients rely on periodic pulls.

use crate::dialect::Dialect;
use crate::error::SharedResult;
use crate::processor::SharedProcessor;
use crate::sql_ops::SqlOps;
use async_trait::async_trait;
use bibsync_core::{BibEntry, ConnectionProperties};
use sqlx::Sqlite;
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeMap;

/// SQLite-backed shared database processor.
pub struct SqliteProcessor {
    ops: SqlOps<Sqlite>,
    properties: ConnectionProperties,
}

impl SqliteProcessor {
    pub fn new(pool: SqlitePool, properties: ConnectionProperties) -> Self {
        Self {
            ops: SqlOps::new(pool, Dialect::Sqlite),
            properties,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.ops.pool()
    }
}

#[async_trait]
impl SharedProcessor for SqliteProcessor {
    fn dialect(&self) -> Dialect {
        self.ops.dialect()
    }

    fn connection_properties(&self) -> &ConnectionProperties {
        &self.properties
    }

    async fn check_base_integrity(&self) -> SharedResult<bool> {
        self.ops.check_base_integrity().await
    }

    async fn check_for_legacy_schema(&self) -> SharedResult<bool> {
        self.ops.check_for_legacy_schema().await
    }

    /// SQLite databases never had the upper-case layout, so this only
    /// creates tables and writes the version marker.
    async fn setup_shared_database(&self) -> SharedResult<()> {
        self.ops.setup_shared_database().await
    }

    async fn insert_entries(&self, entries: &mut [BibEntry]) -> SharedResult<()> {
        self.ops.insert_entries_returning(entries).await
    }

    async fn update_entry(&self, entry: &BibEntry) -> SharedResult<()> {
        self.ops.update_entry(entry).await
    }

    async fn remove_entries(&self, entries: &[BibEntry]) -> SharedResult<()> {
        self.ops.remove_entries(entries).await
    }

    async fn get_shared_entries(&self) -> SharedResult<Vec<BibEntry>> {
        self.ops.get_shared_entries().await
    }

    async fn get_shared_entries_by_ids(&self, shared_ids: &[i32]) -> SharedResult<Vec<BibEntry>> {
        self.ops.get_shared_entries_by_ids(shared_ids).await
    }

    async fn get_shared_id_version_mapping(&self) -> SharedResult<BTreeMap<i32, i32>> {
        self.ops.get_shared_id_version_mapping().await
    }

    async fn get_shared_metadata(&self) -> SharedResult<BTreeMap<String, String>> {
        self.ops.get_shared_metadata().await
    }

    async fn set_shared_metadata(&self, data: &BTreeMap<String, String>) -> SharedResult<()> {
        self.ops.set_shared_metadata(data).await
    }

    async fn is_connection_valid(&self) -> bool {
        self.ops.is_connection_valid().await
    }

    async fn close(&self) {
        self.ops.close().await;
    }
}
