//! The processor contract every vendor backend implements.

use crate::dialect::Dialect;
use crate::error::{SharedError, SharedResult};
use crate::models::EntryFieldRow;
use async_trait::async_trait;
use bibsync_core::{BibEntry, ConnectionProperties, DatabaseType};
use std::collections::BTreeMap;
use std::sync::Weak;

/// Shared ids fetched per query when loading entries by id.
pub const ENTRY_BATCH_SIZE: usize = 500;

/// Field rows written per multi-row INSERT.
pub const FIELD_INSERT_BATCH_SIZE: usize = 300;

/// Receiver of remote change notifications.
///
/// Listeners hold it through a [`Weak`] reference and stop once it is gone.
#[async_trait]
pub trait RemoteChangeHandler: Send + Sync {
    /// Another client changed entries.
    async fn on_remote_change(&self);

    /// A shared metadata value changed.
    async fn on_remote_metadata_change(&self, key: &str, value: &str);
}

/// All SQL-level interaction with one shared database.
#[async_trait]
pub trait SharedProcessor: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn connection_properties(&self) -> &ConnectionProperties;

    fn database_type(&self) -> DatabaseType {
        self.connection_properties().database_type()
    }

    /// Vendor-specific identifier quoting.
    fn escape(&self, identifier: &str) -> String {
        self.dialect().escape(identifier)
    }

    /// The current tables exist and carry the current layout version.
    async fn check_base_integrity(&self) -> SharedResult<bool>;

    /// The database still uses the layout of JabRef 3.5 or older.
    async fn check_for_legacy_schema(&self) -> SharedResult<bool>;

    /// Create missing tables, migrate legacy rows once and record the layout
    /// version. A failing integrity check afterwards is only logged.
    async fn setup_shared_database(&self) -> SharedResult<()>;

    /// Insert one entry and record its generated id in the sidecar.
    async fn insert_entry(&self, entry: &mut BibEntry) -> SharedResult<()> {
        self.insert_entries(std::slice::from_mut(entry)).await
    }

    /// Insert entries that do not exist remotely yet. Entries whose shared id
    /// is already present are skipped.
    async fn insert_entries(&self, entries: &mut [BibEntry]) -> SharedResult<()>;

    /// Push a local entry in one transaction.
    ///
    /// Fails with [`SharedError::OfflineLock`] without touching the remote row
    /// when the remote version is newer and the contents differ.
    async fn update_entry(&self, entry: &BibEntry) -> SharedResult<()>;

    async fn remove_entry(&self, entry: &BibEntry) -> SharedResult<()> {
        self.remove_entries(std::slice::from_ref(entry)).await
    }

    /// Delete entries by shared id. Their fields cascade.
    async fn remove_entries(&self, entries: &[BibEntry]) -> SharedResult<()>;

    async fn get_shared_entry(&self, shared_id: i32) -> SharedResult<Option<BibEntry>> {
        Ok(self
            .get_shared_entries_by_ids(&[shared_id])
            .await?
            .into_iter()
            .next())
    }

    /// All shared entries ordered by shared id.
    async fn get_shared_entries(&self) -> SharedResult<Vec<BibEntry>>;

    /// Entries with the given shared ids, fetched in batches of
    /// [`ENTRY_BATCH_SIZE`]. Unknown ids are skipped.
    async fn get_shared_entries_by_ids(&self, shared_ids: &[i32]) -> SharedResult<Vec<BibEntry>>;

    async fn get_shared_id_version_mapping(&self) -> SharedResult<BTreeMap<i32, i32>>;

    async fn get_shared_metadata(&self) -> SharedResult<BTreeMap<String, String>>;

    /// Write every key. Unchanged values are left alone.
    async fn set_shared_metadata(&self, data: &BTreeMap<String, String>) -> SharedResult<()>;

    /// Start pushing remote changes to `handler`. Backends without a push
    /// channel do nothing.
    async fn start_notification_listener(
        &self,
        _processor_id: &str,
        _handler: Weak<dyn RemoteChangeHandler>,
    ) -> SharedResult<()> {
        Ok(())
    }

    async fn stop_notification_listener(&self) {}

    /// Tell other clients that entries changed.
    async fn notify_clients(&self, _processor_id: &str) -> SharedResult<()> {
        Ok(())
    }

    /// Liveness check on the underlying connection.
    async fn is_connection_valid(&self) -> bool;

    /// Stop the listener and release the connection.
    async fn close(&self);
}

/// Group ordered join rows into entries. Rows must be ordered by shared id;
/// null values are skipped.
pub(crate) fn assemble_entries(rows: impl IntoIterator<Item = EntryFieldRow>) -> Vec<BibEntry> {
    let mut entries: Vec<BibEntry> = Vec::new();
    for row in rows {
        let starts_new_entry = entries
            .last()
            .is_none_or(|entry| entry.shared_data().shared_id() != row.shared_id);
        if starts_new_entry {
            entries.push(
                BibEntry::new(row.entry_type.unwrap_or_default())
                    .with_shared_data(row.shared_id, row.version),
            );
        }
        if let (Some(name), Some(value), Some(entry)) = (row.name, row.value, entries.last_mut()) {
            entry.set_field(&name, value);
        }
    }
    entries
}

/// Version check of an update: allowed when the local copy is not older than
/// the shared one, or when both are equal by value.
pub(crate) fn check_update_allowed(local: &BibEntry, shared: &BibEntry) -> SharedResult<()> {
    let local_version = local.shared_data().version();
    let shared_version = shared.shared_data().version();
    if local_version >= shared_version || local == shared {
        Ok(())
    } else {
        tracing::debug!(
            shared_id = shared.shared_data().shared_id(),
            local_version,
            shared_version,
            "refusing update of outdated entry"
        );
        Err(SharedError::offline_lock(local.clone(), shared.clone()))
    }
}

/// Field names stored remotely but no longer present locally.
pub(crate) fn removed_field_names<'a>(local: &BibEntry, shared: &'a BibEntry) -> Vec<&'a str> {
    shared
        .field_names()
        .filter(|name| !local.has_field(name))
        .collect()
}
