//! MySQL processor.

use crate::dialect::Dialect;
use crate::error::{SharedError, SharedResult};
use crate::processor::SharedProcessor;
use crate::sql_ops::SqlOps;
use async_trait::async_trait;
use bibsync_core::{BibEntry, ConnectionProperties};
use sqlx::MySql;
use sqlx::mysql::MySqlPool;
use std::collections::BTreeMap;

/// MySQL-backed shared database processor.
///
/// MySQL has no `RETURNING`, so entries are inserted one row at a time and
/// their ids read back from the insert result. Field rows are still batched.
pub struct MySqlProcessor {
    ops: SqlOps<MySql>,
    properties: ConnectionProperties,
}

impl MySqlProcessor {
    pub fn new(pool: MySqlPool, properties: ConnectionProperties) -> Self {
        Self {
            ops: SqlOps::new(pool, Dialect::MySql),
            properties,
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        self.ops.pool()
    }
}

#[async_trait]
impl SharedProcessor for MySqlProcessor {
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

    async fn setup_shared_database(&self) -> SharedResult<()> {
        self.ops.setup_shared_database().await
    }

    async fn insert_entries(&self, entries: &mut [BibEntry]) -> SharedResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.ops.pool().begin().await?;
        let pending = self.ops.pending_inserts(&mut *tx, entries).await?;
        let insert_entry = self.ops.dialect().insert_entries(1);

        for &index in &pending {
            let entry = &mut entries[index];
            let result = sqlx::query(&insert_entry)
                .bind(entry.entry_type())
                .execute(&mut *tx)
                .await?;
            let shared_id = i32::try_from(result.last_insert_id()).map_err(|_| {
                SharedError::Internal(format!(
                    "generated id {} does not fit a shared id",
                    result.last_insert_id()
                ))
            })?;
            let data = entry.shared_data_mut();
            data.set_shared_id(shared_id);
            data.set_version(1);
        }

        let fields = self.ops.insert_field_rows(&mut *tx, entries, &pending).await?;
        tx.commit().await?;
        tracing::info!(
            entries = pending.len(),
            fields,
            "Inserted entries into shared database"
        );
        Ok(())
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
