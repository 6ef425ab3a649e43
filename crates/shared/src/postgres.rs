//! PostgreSQL processor.
//!
//! The only vendor with a native push channel over sqlx: entry changes are
//! announced with `pg_notify` and metadata writes go through the
//! `upsert_metadata` function, which notifies on its own.

use crate::dialect::Dialect;
use crate::error::SharedResult;
use crate::notifications::{self, LIVE_UPDATE_CHANNEL, METADATA_UPDATE_CHANNEL};
use crate::processor::{RemoteChangeHandler, SharedProcessor};
use crate::sql_ops::SqlOps;
use async_trait::async_trait;
use bibsync_core::{BibEntry, ConnectionProperties};
use sqlx::Postgres;
use sqlx::postgres::{PgListener, PgPool};
use std::collections::BTreeMap;
use std::sync::Weak;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// PostgreSQL-backed shared database processor.
pub struct PostgresProcessor {
    ops: SqlOps<Postgres>,
    properties: ConnectionProperties,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresProcessor {
    pub fn new(pool: PgPool, properties: ConnectionProperties) -> Self {
        Self {
            ops: SqlOps::new(pool, Dialect::Postgres),
            properties,
            listener: Mutex::new(None),
        }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        self.ops.pool()
    }
}

#[async_trait]
impl SharedProcessor for PostgresProcessor {
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

    /// Also (re)creates the `upsert_metadata` function, and copies the
    /// upper-case legacy tables once. The copy re-seeds the id sequence.
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

    /// Every key goes through `upsert_metadata`, which notifies listeners
    /// when the stored value changes.
    async fn set_shared_metadata(&self, data: &BTreeMap<String, String>) -> SharedResult<()> {
        self.ops.set_shared_metadata(data).await
    }

    async fn start_notification_listener(
        &self,
        processor_id: &str,
        handler: Weak<dyn RemoteChangeHandler>,
    ) -> SharedResult<()> {
        let mut listener = PgListener::connect_with(self.ops.pool()).await?;
        listener
            .listen_all([LIVE_UPDATE_CHANNEL, METADATA_UPDATE_CHANNEL])
            .await?;

        let task = tokio::spawn(notifications::run_postgres_listener(
            listener,
            processor_id.to_string(),
            handler,
        ));
        if let Some(previous) = self.listener.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_notification_listener(&self) {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
            tracing::info!("Stopped notification listener");
        }
    }

    async fn notify_clients(&self, processor_id: &str) -> SharedResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(LIVE_UPDATE_CHANNEL)
            .bind(processor_id)
            .execute(self.ops.pool())
            .await?;
        Ok(())
    }

    async fn is_connection_valid(&self) -> bool {
        self.ops.is_connection_valid().await
    }

    async fn close(&self) {
        self.stop_notification_listener().await;
        self.ops.close().await;
    }
}
