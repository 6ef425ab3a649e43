//! Oracle processor.
//!
//! The `oracle` driver is synchronous, so every call runs on the blocking
//! pool against one connection guarded by a mutex. Live updates use the
//! `DBMS_ALERT` package: a dedicated connection waits on
//! [`ORACLE_ALERT_NAME`] in a blocking task and hands alerts to the handler.
//! The connecting user needs `EXECUTE` on `DBMS_ALERT`.

use crate::dialect::Dialect;
use crate::error::{SharedError, SharedResult};
use crate::models::EntryFieldRow;
use crate::notifications::{self, LIVE_UPDATE_CHANNEL, ORACLE_ALERT_NAME};
use crate::processor::{
    ENTRY_BATCH_SIZE, FIELD_INSERT_BATCH_SIZE, RemoteChangeHandler, SharedProcessor,
    assemble_entries, check_update_allowed, removed_field_names,
};
use crate::schema::{self, CURRENT_VERSION_DB_STRUCT};
use ::oracle::Connection;
use ::oracle::sql_type::{OracleType, ToSql};
use async_trait::async_trait;
use bibsync_core::metadata::VERSION_DB_STRUCT;
use bibsync_core::{BibEntry, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Seconds one `WAITONE` call blocks before the stop flag is checked again.
const ALERT_WAIT_SECS: i32 = 1;

/// Maximum message length of a `DBMS_ALERT` signal.
const ALERT_MESSAGE_LEN: u32 = 1800;

const JDBC_PREFIX: &str = "jdbc:oracle:thin:@";

/// A synchronous Oracle connection shared with blocking tasks.
#[derive(Clone)]
pub struct OracleConnection {
    inner: Arc<Mutex<Connection>>,
}

/// Open a connection, giving up after `timeout`.
pub async fn connect(
    properties: &ConnectionProperties,
    timeout: Duration,
) -> SharedResult<OracleConnection> {
    let connection = open_blocking(properties, timeout).await?;
    Ok(OracleConnection {
        inner: Arc::new(Mutex::new(connection)),
    })
}

async fn open_blocking(
    properties: &ConnectionProperties,
    timeout: Duration,
) -> SharedResult<Connection> {
    let user = properties.user().to_string();
    let password = properties.password().to_string();
    let connect_string = connect_string(properties);

    let task = tokio::task::spawn_blocking(move || {
        // Autocommit is off by default; every write path commits explicitly.
        Ok::<_, SharedError>(Connection::connect(user, password, connect_string)?)
    });
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SharedError::Internal(format!(
            "oracle connect task failed: {join_err}"
        ))),
        Err(_) => Err(SharedError::Internal(format!(
            "timed out after {}s connecting to oracle",
            timeout.as_secs()
        ))),
    }
}

/// Easy-connect string, accepting JDBC thin URLs in expert mode.
fn connect_string(properties: &ConnectionProperties) -> String {
    match properties.raw_url() {
        Some(url) => url.strip_prefix(JDBC_PREFIX).unwrap_or(url).to_string(),
        None => properties.url(),
    }
}

/// Commit on success, roll back on failure.
fn in_transaction<T>(
    conn: &Connection,
    work: impl FnOnce(&Connection) -> SharedResult<T>,
) -> SharedResult<T> {
    match work(conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = conn.rollback() {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

fn list_tables(conn: &Connection, sql: Dialect) -> SharedResult<Vec<String>> {
    let rows = conn.query_as::<String>(sql.list_tables(), &[])?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn read_metadata(conn: &Connection, sql: Dialect) -> SharedResult<BTreeMap<String, String>> {
    let rows = conn.query_as::<(String, Option<String>)>(&sql.select_metadata(), &[])?;
    let mut metadata = BTreeMap::new();
    for row in rows {
        let (key, value) = row?;
        metadata.insert(key, value.unwrap_or_default());
    }
    Ok(metadata)
}

fn write_metadata(
    conn: &Connection,
    sql: Dialect,
    data: &BTreeMap<String, String>,
) -> SharedResult<()> {
    for (key, value) in data {
        let current = conn
            .query_as::<Option<String>>(&sql.select_metadata_value(), &[key])?
            .next()
            .transpose()?;
        match current {
            Some(Some(stored)) if stored == *value => continue,
            Some(_) => {
                conn.execute(&sql.update_metadata(), &[value, key])?;
            }
            None => {
                conn.execute(&sql.insert_metadata(), &[key, value])?;
            }
        }
    }
    Ok(())
}

fn entry_exists(conn: &Connection, sql: Dialect, shared_id: i32) -> SharedResult<bool> {
    Ok(conn
        .query(&sql.select_entry_exists(), &[&shared_id])?
        .next()
        .transpose()?
        .is_some())
}

fn fetch_entries(
    conn: &Connection,
    sql: Dialect,
    shared_ids: Option<&[i32]>,
) -> SharedResult<Vec<BibEntry>> {
    let statement = sql.select_shared_entries(shared_ids.map(<[i32]>::len));
    let params: Vec<&dyn ToSql> = shared_ids
        .unwrap_or_default()
        .iter()
        .map(|shared_id| shared_id as &dyn ToSql)
        .collect();

    let mut rows = Vec::new();
    for row in conn.query(&statement, &params)? {
        let row = row?;
        rows.push(EntryFieldRow {
            shared_id: row.get(0)?,
            version: row.get(1)?,
            entry_type: row.get(2)?,
            name: row.get(3)?,
            value: row.get(4)?,
        });
    }
    Ok(assemble_entries(rows))
}

fn insert_rows(conn: &Connection, sql: Dialect, entries: &mut [BibEntry]) -> SharedResult<usize> {
    let mut insert = conn.statement(&sql.insert_entry_returning_into()).build()?;
    let mut inserted = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter_mut().enumerate() {
        let current_id = entry.shared_data().shared_id();
        if entry.shared_data().is_shared() && entry_exists(conn, sql, current_id)? {
            tracing::debug!(shared_id = current_id, "Entry already present in shared database");
            continue;
        }
        insert.execute(&[&entry.entry_type(), &None::<i32>])?;
        let returned: Vec<i32> = insert.returned_values(2)?;
        let Some(shared_id) = returned.first().copied() else {
            return Err(SharedError::Internal(
                "insert returned no generated id".to_string(),
            ));
        };
        let data = entry.shared_data_mut();
        data.set_shared_id(shared_id);
        data.set_version(1);
        inserted.push(index);
    }

    let mut fields = conn
        .batch(&sql.insert_fields(1), FIELD_INSERT_BATCH_SIZE)
        .build()?;
    for &index in &inserted {
        let entry = &entries[index];
        let shared_id = entry.shared_data().shared_id();
        for (name, value) in entry.fields() {
            fields.append_row(&[&shared_id, name, value])?;
        }
    }
    fields.execute()?;
    Ok(inserted.len())
}

fn update_rows(conn: &Connection, sql: Dialect, local: &BibEntry) -> SharedResult<bool> {
    let shared_id = local.shared_data().shared_id();

    let locked = conn
        .query(&sql.lock_entry_version(), &[&shared_id])?
        .next()
        .transpose()?;
    if locked.is_none() {
        return Ok(false);
    }
    let Some(shared) = fetch_entries(conn, sql, Some(&[shared_id]))?
        .into_iter()
        .next()
    else {
        return Ok(false);
    };

    check_update_allowed(local, &shared)?;

    for name in removed_field_names(local, &shared) {
        conn.execute(&sql.delete_field(), &[&name, &shared_id])?;
    }
    for (name, value) in local.fields() {
        let exists = conn
            .query(&sql.select_field(), &[name, &shared_id])?
            .next()
            .transpose()?
            .is_some();
        if exists {
            conn.execute(&sql.update_field(), &[value, name, &shared_id])?;
        } else {
            conn.execute(&sql.insert_fields(1), &[&shared_id, name, value])?;
        }
    }
    conn.execute(
        &sql.update_entry_type_and_version(),
        &[&local.entry_type(), &shared_id],
    )?;
    Ok(true)
}

/// Blocking receive loop on a dedicated connection.
fn run_alert_listener(
    conn: Connection,
    processor_id: String,
    handler: Weak<dyn RemoteChangeHandler>,
    stop: Arc<AtomicBool>,
    runtime: tokio::runtime::Handle,
) {
    tracing::info!(alert = ORACLE_ALERT_NAME, "listening for shared database alerts");

    while !stop.load(Ordering::Acquire) {
        match wait_for_alert(&conn) {
            Ok(Some(message)) => {
                tracing::debug!(payload = %message, "received alert");
                let action = match notifications::classify(LIVE_UPDATE_CHANNEL, &message, &processor_id) {
                    Ok(action) => action,
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring malformed alert");
                        continue;
                    }
                };
                if !runtime.block_on(notifications::dispatch(&handler, action)) {
                    break;
                }
            }
            Ok(None) => {
                if handler.strong_count() == 0 {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "error waiting for shared database alert");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    if let Err(e) = conn.execute("BEGIN DBMS_ALERT.REMOVE(:1); END;", &[&ORACLE_ALERT_NAME]) {
        tracing::debug!(error = %e, "could not remove alert registration");
    }
    if let Err(e) = conn.close() {
        tracing::debug!(error = %e, "could not close listener connection");
    }
    tracing::info!("alert listener stopped");
}

/// One bounded wait. `None` on timeout.
fn wait_for_alert(conn: &Connection) -> SharedResult<Option<String>> {
    let mut stmt = conn
        .statement("BEGIN DBMS_ALERT.WAITONE(:name, :message, :status, :timeout); END;")
        .build()?;
    stmt.bind("name", &ORACLE_ALERT_NAME)?;
    stmt.bind("message", &OracleType::Varchar2(ALERT_MESSAGE_LEN))?;
    stmt.bind("status", &OracleType::Int64)?;
    stmt.bind("timeout", &ALERT_WAIT_SECS)?;
    stmt.execute(&[])?;

    // 0 means an alert arrived, 1 a timeout.
    let status: i64 = stmt.bind_value("status")?;
    if status != 0 {
        return Ok(None);
    }
    let message: Option<String> = stmt.bind_value("message")?;
    Ok(Some(message.unwrap_or_default()))
}

struct AlertListener {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Oracle-backed shared database processor.
pub struct OracleProcessor {
    connection: OracleConnection,
    properties: ConnectionProperties,
    sql: Dialect,
    listener: tokio::sync::Mutex<Option<AlertListener>>,
}

impl OracleProcessor {
    pub fn new(connection: OracleConnection, properties: ConnectionProperties) -> Self {
        Self {
            connection,
            properties,
            sql: Dialect::Oracle,
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Run `work` on the blocking pool with the connection locked.
    async fn with_connection<T, F>(&self, work: F) -> SharedResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> SharedResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.connection.inner);
        tokio::task::spawn_blocking(move || {
            let conn = inner
                .lock()
                .map_err(|_| SharedError::Internal("oracle connection lock poisoned".to_string()))?;
            work(&conn)
        })
        .await
        .map_err(|e| SharedError::Internal(format!("oracle task failed: {e}")))?
    }
}

#[async_trait]
impl SharedProcessor for OracleProcessor {
    fn dialect(&self) -> Dialect {
        self.sql
    }

    fn connection_properties(&self) -> &ConnectionProperties {
        &self.properties
    }

    async fn check_base_integrity(&self) -> SharedResult<bool> {
        let sql = self.sql;
        self.with_connection(move |conn| {
            if !schema::has_base_tables(sql, &list_tables(conn, sql)?) {
                return Ok(false);
            }
            let metadata = read_metadata(conn, sql)?;
            Ok(metadata
                .get(VERSION_DB_STRUCT)
                .and_then(|raw| schema::parse_struct_version(raw))
                == Some(CURRENT_VERSION_DB_STRUCT))
        })
        .await
    }

    async fn check_for_legacy_schema(&self) -> SharedResult<bool> {
        let sql = self.sql;
        self.with_connection(move |conn| Ok(schema::is_pre_36_layout(&list_tables(conn, sql)?)))
            .await
    }

    async fn setup_shared_database(&self) -> SharedResult<()> {
        let sql = self.sql;
        let created = self
            .with_connection(move |conn| {
                let tables = list_tables(conn, sql)?;
                let statements = schema::missing_table_statements(sql, &tables);
                for statement in &statements {
                    conn.execute(statement, &[])?;
                }

                let metadata = read_metadata(conn, sql)?;
                let version = schema::stored_struct_version(
                    metadata.get(VERSION_DB_STRUCT).map(String::as_str),
                    false,
                );
                if version < CURRENT_VERSION_DB_STRUCT {
                    let marker = BTreeMap::from([(
                        VERSION_DB_STRUCT.to_string(),
                        CURRENT_VERSION_DB_STRUCT.to_string(),
                    )]);
                    in_transaction(conn, |conn| write_metadata(conn, sql, &marker))?;
                }
                Ok(statements.len())
            })
            .await?;
        if created > 0 {
            tracing::info!(statements = created, "Created shared tables");
        }

        if !self.check_base_integrity().await? {
            tracing::error!("Corrupt shared database structure after setup");
        }
        Ok(())
    }

    async fn insert_entries(&self, entries: &mut [BibEntry]) -> SharedResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let sql = self.sql;
        let mut batch = entries.to_vec();
        let (batch, inserted) = self
            .with_connection(move |conn| {
                let inserted = in_transaction(conn, |conn| insert_rows(conn, sql, &mut batch))?;
                Ok((batch, inserted))
            })
            .await?;

        for (entry, stored) in entries.iter_mut().zip(batch) {
            *entry.shared_data_mut() = *stored.shared_data();
        }
        tracing::info!(entries = inserted, "Inserted entries into shared database");
        Ok(())
    }

    async fn update_entry(&self, entry: &BibEntry) -> SharedResult<()> {
        let sql = self.sql;
        let local = entry.clone();
        let shared_id = entry.shared_data().shared_id();
        let updated = self
            .with_connection(move |conn| in_transaction(conn, |conn| update_rows(conn, sql, &local)))
            .await?;
        if updated {
            tracing::debug!(shared_id, "Updated shared entry");
        } else {
            tracing::debug!(shared_id, "Shared entry no longer exists, nothing updated");
        }
        Ok(())
    }

    async fn remove_entries(&self, entries: &[BibEntry]) -> SharedResult<()> {
        let sql = self.sql;
        let shared_ids: Vec<i32> = entries
            .iter()
            .filter(|entry| entry.shared_data().is_shared())
            .map(|entry| entry.shared_data().shared_id())
            .collect();
        if shared_ids.is_empty() {
            return Ok(());
        }
        let count = shared_ids.len();
        self.with_connection(move |conn| {
            in_transaction(conn, |conn| {
                for chunk in shared_ids.chunks(ENTRY_BATCH_SIZE) {
                    let params: Vec<&dyn ToSql> =
                        chunk.iter().map(|shared_id| shared_id as &dyn ToSql).collect();
                    conn.execute(&sql.delete_entries(chunk.len()), &params)?;
                }
                Ok(())
            })
        })
        .await?;
        tracing::info!(entries = count, "Removed entries from shared database");
        Ok(())
    }

    async fn get_shared_entries(&self) -> SharedResult<Vec<BibEntry>> {
        let sql = self.sql;
        self.with_connection(move |conn| fetch_entries(conn, sql, None))
            .await
    }

    async fn get_shared_entries_by_ids(&self, shared_ids: &[i32]) -> SharedResult<Vec<BibEntry>> {
        let sql = self.sql;
        let shared_ids = shared_ids.to_vec();
        self.with_connection(move |conn| {
            let mut entries = Vec::with_capacity(shared_ids.len());
            for chunk in shared_ids.chunks(ENTRY_BATCH_SIZE) {
                entries.extend(fetch_entries(conn, sql, Some(chunk))?);
            }
            Ok(entries)
        })
        .await
    }

    async fn get_shared_id_version_mapping(&self) -> SharedResult<BTreeMap<i32, i32>> {
        let sql = self.sql;
        self.with_connection(move |conn| {
            let rows = conn.query_as::<(i32, i32)>(&sql.select_id_versions(), &[])?;
            Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
        })
        .await
    }

    async fn get_shared_metadata(&self) -> SharedResult<BTreeMap<String, String>> {
        let sql = self.sql;
        self.with_connection(move |conn| read_metadata(conn, sql))
            .await
    }

    async fn set_shared_metadata(&self, data: &BTreeMap<String, String>) -> SharedResult<()> {
        let sql = self.sql;
        let data = data.clone();
        self.with_connection(move |conn| in_transaction(conn, |conn| write_metadata(conn, sql, &data)))
            .await
    }

    async fn start_notification_listener(
        &self,
        processor_id: &str,
        handler: Weak<dyn RemoteChangeHandler>,
    ) -> SharedResult<()> {
        let conn = open_blocking(&self.properties, crate::connection::LOGIN_TIMEOUT).await?;
        let conn = tokio::task::spawn_blocking(move || {
            conn.execute("BEGIN DBMS_ALERT.REGISTER(:1); END;", &[&ORACLE_ALERT_NAME])?;
            conn.commit()?;
            Ok::<_, SharedError>(conn)
        })
        .await
        .map_err(|e| SharedError::Internal(format!("oracle task failed: {e}")))??;

        let stop = Arc::new(AtomicBool::new(false));
        let processor_id = processor_id.to_string();
        let runtime = tokio::runtime::Handle::current();
        let task = tokio::task::spawn_blocking({
            let stop = Arc::clone(&stop);
            move || run_alert_listener(conn, processor_id, handler, stop, runtime)
        });

        if let Some(previous) = self.listener.lock().await.replace(AlertListener { stop, task }) {
            previous.stop.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn stop_notification_listener(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop.store(true, Ordering::Release);
            if let Err(e) = listener.task.await {
                tracing::warn!(error = %e, "alert listener task failed");
            }
            tracing::info!("Stopped notification listener");
        }
    }

    async fn notify_clients(&self, processor_id: &str) -> SharedResult<()> {
        let processor_id = processor_id.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "BEGIN DBMS_ALERT.SIGNAL(:1, :2); END;",
                &[&ORACLE_ALERT_NAME, &processor_id],
            )?;
            // Alerts are delivered on commit.
            conn.commit()?;
            Ok(())
        })
        .await
    }

    async fn is_connection_valid(&self) -> bool {
        self.with_connection(|conn| Ok(conn.ping().is_ok()))
            .await
            .unwrap_or(false)
    }

    async fn close(&self) {
        self.stop_notification_listener().await;
        if let Err(e) = self.with_connection(|conn| Ok(conn.close()?)).await {
            tracing::warn!(error = %e, "Error closing oracle connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibsync_core::DatabaseType;

    #[test]
    fn test_connect_string_from_properties() {
        let properties = ConnectionProperties::builder(DatabaseType::Oracle)
            .host("ora.internal")
            .database("XEPDB1")
            .user("jabref")
            .password("secret")
            .build()
            .unwrap();
        assert_eq!(connect_string(&properties), "//ora.internal:1521/XEPDB1");
    }

    #[test]
    fn test_connect_string_strips_jdbc_prefix() {
        let properties = ConnectionProperties::builder(DatabaseType::Oracle)
            .host("ignored")
            .database("ignored")
            .user("jabref")
            .password("secret")
            .url("jdbc:oracle:thin:@db.example.org:1522/ORCL")
            .expert_mode(true)
            .build()
            .unwrap();
        assert_eq!(connect_string(&properties), "db.example.org:1522/ORCL");
    }
}
