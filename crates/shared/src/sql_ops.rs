//! Statement execution shared by the sqlx-backed processors.
//!
//! [`Dialect`] builds the SQL text; [`SqlOps`] binds and runs it over any
//! sqlx driver. The vendor processors delegate here and keep only what their
//! database does differently: how generated ids come back, and notifications.

use crate::dialect::Dialect;
use crate::error::{SharedError, SharedResult};
use crate::models::{EntryFieldRow, IdVersionRow, MetadataRow};
use crate::processor::{
    ENTRY_BATCH_SIZE, FIELD_INSERT_BATCH_SIZE, assemble_entries, check_update_allowed,
    removed_field_names,
};
use crate::schema::{self, CURRENT_VERSION_DB_STRUCT};
use bibsync_core::BibEntry;
use bibsync_core::metadata::VERSION_DB_STRUCT;
use sqlx::{Connection, Database, Encode, Executor, FromRow, IntoArguments, Pool, Type};
use std::collections::BTreeMap;

/// A pool plus the dialect its statements are written in.
pub(crate) struct SqlOps<DB: Database> {
    pool: Pool<DB>,
    sql: Dialect,
}

impl<DB> SqlOps<DB>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    i32: for<'q> Encode<'q, DB> + Type<DB>,
    String: for<'q> Encode<'q, DB> + Type<DB>,
    (i32,): for<'r> FromRow<'r, DB::Row>,
    (Option<i32>,): for<'r> FromRow<'r, DB::Row>,
    (String,): for<'r> FromRow<'r, DB::Row>,
    (Option<String>,): for<'r> FromRow<'r, DB::Row>,
    EntryFieldRow: for<'r> FromRow<'r, DB::Row>,
    IdVersionRow: for<'r> FromRow<'r, DB::Row>,
    MetadataRow: for<'r> FromRow<'r, DB::Row>,
{
    pub(crate) fn new(pool: Pool<DB>, sql: Dialect) -> Self {
        Self { pool, sql }
    }

    pub(crate) fn pool(&self) -> &Pool<DB> {
        &self.pool
    }

    pub(crate) fn dialect(&self) -> Dialect {
        self.sql
    }

    pub(crate) async fn list_tables(&self) -> SharedResult<Vec<String>> {
        Ok(sqlx::query_scalar::<DB, String>(self.sql.list_tables())
            .fetch_all(&self.pool)
            .await?)
    }

    pub(crate) async fn check_base_integrity(&self) -> SharedResult<bool> {
        let tables = self.list_tables().await?;
        if !schema::has_base_tables(self.sql, &tables) {
            return Ok(false);
        }
        let metadata = self.get_shared_metadata().await?;
        Ok(metadata
            .get(VERSION_DB_STRUCT)
            .and_then(|raw| schema::parse_struct_version(raw))
            == Some(CURRENT_VERSION_DB_STRUCT))
    }

    pub(crate) async fn check_for_legacy_schema(&self) -> SharedResult<bool> {
        Ok(schema::is_pre_36_layout(&self.list_tables().await?))
    }

    pub(crate) async fn setup_shared_database(&self) -> SharedResult<()> {
        let tables = self.list_tables().await?;
        let legacy_tables = schema::has_legacy_tables(self.sql, &tables);

        let statements = schema::missing_table_statements(self.sql, &tables);
        for statement in &statements {
            sqlx::query::<DB>(statement).execute(&self.pool).await?;
        }
        if !statements.is_empty() {
            tracing::info!(statements = statements.len(), "Created shared tables");
        }
        for statement in schema::vendor_setup_statements(self.sql) {
            sqlx::query::<DB>(&statement).execute(&self.pool).await?;
        }

        let metadata = self.get_shared_metadata().await?;
        let version = schema::stored_struct_version(
            metadata.get(VERSION_DB_STRUCT).map(String::as_str),
            legacy_tables,
        );

        if version < CURRENT_VERSION_DB_STRUCT {
            if schema::needs_legacy_migration(version, legacy_tables) {
                tracing::info!(from_version = version, "Migrating legacy shared tables");
                let mut tx = self.pool.begin().await?;
                for statement in schema::legacy_migration_statements(self.sql) {
                    sqlx::query::<DB>(&statement).execute(&mut *tx).await?;
                }
                tx.commit().await?;
            }
            let marker = BTreeMap::from([(
                VERSION_DB_STRUCT.to_string(),
                CURRENT_VERSION_DB_STRUCT.to_string(),
            )]);
            self.set_shared_metadata(&marker).await?;
        }

        if !self.check_base_integrity().await? {
            tracing::error!("Corrupt shared database structure after setup");
        }
        Ok(())
    }

    async fn fetch_entries(
        &self,
        conn: &mut DB::Connection,
        shared_ids: Option<&[i32]>,
    ) -> SharedResult<Vec<BibEntry>> {
        let statement = self.sql.select_shared_entries(shared_ids.map(<[i32]>::len));
        let mut query = sqlx::query_as::<DB, EntryFieldRow>(&statement);
        for shared_id in shared_ids.unwrap_or_default() {
            query = query.bind(*shared_id);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        Ok(assemble_entries(rows))
    }

    /// Indexes of the entries that still need a shared row. Entries whose
    /// shared id already exists remotely are skipped.
    pub(crate) async fn pending_inserts(
        &self,
        conn: &mut DB::Connection,
        entries: &[BibEntry],
    ) -> SharedResult<Vec<usize>> {
        let mut pending = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let shared_id = entry.shared_data().shared_id();
            if entry.shared_data().is_shared() {
                let found = sqlx::query_scalar::<DB, i32>(&self.sql.select_entry_exists())
                    .bind(shared_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if found.is_some() {
                    tracing::debug!(shared_id, "Entry already present in shared database");
                    continue;
                }
            }
            pending.push(index);
        }
        Ok(pending)
    }

    /// Write the field rows of `entries[pending]` in batches. Returns the
    /// number of rows written.
    pub(crate) async fn insert_field_rows(
        &self,
        conn: &mut DB::Connection,
        entries: &[BibEntry],
        pending: &[usize],
    ) -> SharedResult<usize> {
        let fields: Vec<(i32, &str, &str)> = pending
            .iter()
            .flat_map(|&index| {
                let entry = &entries[index];
                let shared_id = entry.shared_data().shared_id();
                entry
                    .fields()
                    .iter()
                    .map(move |(name, value)| (shared_id, name.as_str(), value.as_str()))
            })
            .collect();
        for chunk in fields.chunks(FIELD_INSERT_BATCH_SIZE) {
            let statement = self.sql.insert_fields(chunk.len());
            let mut query = sqlx::query::<DB>(&statement);
            for &(shared_id, name, value) in chunk {
                query = query
                    .bind(shared_id)
                    .bind(name.to_string())
                    .bind(value.to_string());
            }
            query.execute(&mut *conn).await?;
        }
        Ok(fields.len())
    }

    /// Insert with one multi-row `INSERT ... RETURNING` per batch.
    pub(crate) async fn insert_entries_returning(
        &self,
        entries: &mut [BibEntry],
    ) -> SharedResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let pending = self.pending_inserts(&mut *tx, entries).await?;

        for chunk in pending.chunks(ENTRY_BATCH_SIZE) {
            let statement = self.sql.insert_entries(chunk.len());
            let mut query = sqlx::query_scalar::<DB, i32>(&statement);
            for &index in chunk {
                query = query.bind(entries[index].entry_type().to_string());
            }
            let mut shared_ids = query.fetch_all(&mut *tx).await?;
            if shared_ids.len() != chunk.len() {
                return Err(SharedError::Internal(format!(
                    "expected {} generated ids, got {}",
                    chunk.len(),
                    shared_ids.len()
                )));
            }
            // Generated ids are handed out in VALUES order.
            shared_ids.sort_unstable();
            for (&index, shared_id) in chunk.iter().zip(shared_ids) {
                let data = entries[index].shared_data_mut();
                data.set_shared_id(shared_id);
                data.set_version(1);
            }
        }

        let fields = self.insert_field_rows(&mut *tx, entries, &pending).await?;
        tx.commit().await?;
        tracing::info!(
            entries = pending.len(),
            fields,
            "Inserted entries into shared database"
        );
        Ok(())
    }

    /// The body of an update. Returns `false` if the entry no longer exists
    /// remotely.
    async fn update_in_transaction(
        &self,
        conn: &mut DB::Connection,
        local: &BibEntry,
    ) -> SharedResult<bool> {
        let shared_id = local.shared_data().shared_id();

        // Row lock where the vendor has one. SQLite takes its write lock on
        // the first write below.
        let locked = sqlx::query_scalar::<DB, Option<i32>>(&self.sql.lock_entry_version())
            .bind(shared_id)
            .fetch_optional(&mut *conn)
            .await?;
        if locked.is_none() {
            return Ok(false);
        }
        let Some(shared) = self
            .fetch_entries(&mut *conn, Some(&[shared_id]))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(false);
        };

        check_update_allowed(local, &shared)?;

        for name in removed_field_names(local, &shared) {
            sqlx::query::<DB>(&self.sql.delete_field())
                .bind(name.to_string())
                .bind(shared_id)
                .execute(&mut *conn)
                .await?;
        }

        for (name, value) in local.fields() {
            let existing = sqlx::query_scalar::<DB, String>(&self.sql.select_field())
                .bind(name.clone())
                .bind(shared_id)
                .fetch_optional(&mut *conn)
                .await?;
            if existing.is_some() {
                sqlx::query::<DB>(&self.sql.update_field())
                    .bind(value.clone())
                    .bind(name.clone())
                    .bind(shared_id)
                    .execute(&mut *conn)
                    .await?;
            } else {
                sqlx::query::<DB>(&self.sql.insert_fields(1))
                    .bind(shared_id)
                    .bind(name.clone())
                    .bind(value.clone())
                    .execute(&mut *conn)
                    .await?;
            }
        }

        sqlx::query::<DB>(&self.sql.update_entry_type_and_version())
            .bind(local.entry_type().to_string())
            .bind(shared_id)
            .execute(&mut *conn)
            .await?;
        Ok(true)
    }

    pub(crate) async fn update_entry(&self, entry: &BibEntry) -> SharedResult<()> {
        let shared_id = entry.shared_data().shared_id();
        let mut tx = self.pool.begin().await?;

        match self.update_in_transaction(&mut *tx, entry).await {
            Ok(updated) => {
                tx.commit().await?;
                if updated {
                    tracing::debug!(shared_id, "Updated shared entry");
                } else {
                    tracing::debug!(shared_id, "Shared entry no longer exists, nothing updated");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(shared_id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn remove_entries(&self, entries: &[BibEntry]) -> SharedResult<()> {
        let shared_ids: Vec<i32> = entries
            .iter()
            .filter(|entry| entry.shared_data().is_shared())
            .map(|entry| entry.shared_data().shared_id())
            .collect();

        for chunk in shared_ids.chunks(ENTRY_BATCH_SIZE) {
            let statement = self.sql.delete_entries(chunk.len());
            let mut query = sqlx::query::<DB>(&statement);
            for shared_id in chunk {
                query = query.bind(*shared_id);
            }
            query.execute(&self.pool).await?;
        }
        if !shared_ids.is_empty() {
            tracing::info!(entries = shared_ids.len(), "Removed entries from shared database");
        }
        Ok(())
    }

    pub(crate) async fn get_shared_entries(&self) -> SharedResult<Vec<BibEntry>> {
        let mut conn = self.pool.acquire().await?;
        self.fetch_entries(&mut *conn, None).await
    }

    pub(crate) async fn get_shared_entries_by_ids(
        &self,
        shared_ids: &[i32],
    ) -> SharedResult<Vec<BibEntry>> {
        let mut conn = self.pool.acquire().await?;
        let mut entries = Vec::with_capacity(shared_ids.len());
        for chunk in shared_ids.chunks(ENTRY_BATCH_SIZE) {
            entries.extend(self.fetch_entries(&mut *conn, Some(chunk)).await?);
        }
        Ok(entries)
    }

    pub(crate) async fn get_shared_id_version_mapping(&self) -> SharedResult<BTreeMap<i32, i32>> {
        let rows = sqlx::query_as::<DB, IdVersionRow>(&self.sql.select_id_versions())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.shared_id, row.version))
            .collect())
    }

    pub(crate) async fn get_shared_metadata(&self) -> SharedResult<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<DB, MetadataRow>(&self.sql.select_metadata())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.key, row.value.unwrap_or_default()))
            .collect())
    }

    /// Write every key in one transaction. Unchanged values are left alone.
    pub(crate) async fn set_shared_metadata(
        &self,
        data: &BTreeMap<String, String>,
    ) -> SharedResult<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in data {
            if let Some(upsert) = self.sql.upsert_metadata() {
                sqlx::query::<DB>(upsert)
                    .bind(key.clone())
                    .bind(value.clone())
                    .execute(&mut *tx)
                    .await?;
                continue;
            }

            let current =
                sqlx::query_scalar::<DB, Option<String>>(&self.sql.select_metadata_value())
                    .bind(key.clone())
                    .fetch_optional(&mut *tx)
                    .await?;
            match current {
                Some(Some(stored)) if stored == *value => continue,
                Some(_) => {
                    sqlx::query::<DB>(&self.sql.update_metadata())
                        .bind(value.clone())
                        .bind(key.clone())
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query::<DB>(&self.sql.insert_metadata())
                        .bind(key.clone())
                        .bind(value.clone())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn is_connection_valid(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        match self.pool.acquire().await {
            Ok(mut conn) => conn.ping().await.is_ok(),
            Err(e) => {
                tracing::debug!(error = %e, "Could not acquire connection");
                false
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}
