//! Keeps one local database consistent with its shared counterpart.
//!
//! Local events with an outbound source are pushed through the processor and
//! followed by a pull. Pulls apply remote state with [`EventSource::Shared`],
//! so the events they produce are never pushed back. Every reaction first
//! checks the connection and gives up for this cycle if it is gone.

use crate::error::{SharedError, SharedResult};
use crate::event::SharedEvent;
use crate::processor::{RemoteChangeHandler, SharedProcessor};
use async_trait::async_trait;
use bibsync_core::{
    BibDatabase, BibDatabaseContext, BibEntry, ConnectionProperties, DatabaseEvent, EntryId,
    EventSource, FieldFormatterCleanups,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct Synchronizer {
    context: Arc<BibDatabaseContext>,
    processor: Arc<dyn SharedProcessor>,
    /// Sent with every notification so the listener can skip our own.
    processor_id: String,
    events: broadcast::Sender<SharedEvent>,
    /// Local events, pulls and remote callbacks arrive on different tasks;
    /// each reaction runs under this lock.
    operation: Mutex<()>,
}

impl Synchronizer {
    pub fn new(context: Arc<BibDatabaseContext>, processor: Arc<dyn SharedProcessor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            context,
            processor,
            processor_id: uuid::Uuid::new_v4().to_string(),
            events,
            operation: Mutex::new(()),
        })
    }

    /// Create a synchronizer and bring both sides in line.
    pub async fn open(
        context: Arc<BibDatabaseContext>,
        processor: Arc<dyn SharedProcessor>,
    ) -> SharedResult<Arc<Self>> {
        let synchronizer = Self::new(context, processor);
        synchronizer.initialize_databases().await?;
        Ok(synchronizer)
    }

    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }

    pub fn context(&self) -> &Arc<BibDatabaseContext> {
        &self.context
    }

    pub fn processor(&self) -> &Arc<dyn SharedProcessor> {
        &self.processor
    }

    /// Name of the shared database, as configured.
    pub fn database_name(&self) -> &str {
        self.processor.connection_properties().database()
    }

    pub fn connection_properties(&self) -> &ConnectionProperties {
        self.processor.connection_properties()
    }

    /// Subscribe to connection, conflict and removal events.
    pub fn register_listener(&self) -> broadcast::Receiver<SharedEvent> {
        self.events.subscribe()
    }

    /// Check the shared structure, set it up if needed, start the live-update
    /// listener and pull everything.
    ///
    /// A database in the pre-3.6 layout is refused with
    /// [`SharedError::DatabaseNotSupported`] and left untouched.
    pub async fn initialize_databases(self: &Arc<Self>) -> SharedResult<()> {
        let _operation = self.operation.lock().await;

        if !self.processor.check_base_integrity().await? {
            if self.processor.check_for_legacy_schema().await? {
                return Err(SharedError::DatabaseNotSupported);
            }
            self.processor.setup_shared_database().await?;
        }

        let weak: Weak<Synchronizer> = Arc::downgrade(self);
        let handler: Weak<dyn RemoteChangeHandler> = weak;
        if let Err(e) = self
            .processor
            .start_notification_listener(&self.processor_id, handler)
            .await
        {
            tracing::warn!(error = %e, "Could not start notification listener, relying on pulls");
        }

        self.synchronize_local_metadata().await;
        self.synchronize_local_database().await;
        tracing::info!(
            database = self.database_name(),
            processor_id = %self.processor_id,
            "Shared database opened"
        );
        Ok(())
    }

    /// Single entry point for local database events.
    pub async fn listen(&self, event: &DatabaseEvent) {
        if !event.source().is_outbound() {
            return;
        }
        let _operation = self.operation.lock().await;

        match event {
            DatabaseEvent::EntriesAdded { entries, .. } => self.on_entries_added(entries).await,
            DatabaseEvent::EntriesRemoved { entries, .. } => self.on_entries_removed(entries).await,
            DatabaseEvent::FieldChanged { entry_id, .. } => self.on_field_changed(*entry_id).await,
            DatabaseEvent::MetaDataChanged { .. } => self.on_metadata_changed().await,
        }
    }

    async fn on_entries_added(&self, added: &[BibEntry]) {
        if !self.check_current_connection().await {
            return;
        }
        self.pull_metadata().await;

        let pending: Vec<EntryId> = added.iter().map(BibEntry::id).collect();
        self.pull_database(&pending).await;

        let mut entries: Vec<BibEntry> = {
            let database = self.context.database().lock().await;
            pending
                .iter()
                .filter_map(|id| database.entry(*id).cloned())
                .collect()
        };
        if entries.is_empty() {
            return;
        }

        match self.processor.insert_entries(&mut entries).await {
            Ok(()) => {
                {
                    let mut database = self.context.database().lock().await;
                    for entry in &entries {
                        database.set_shared_data(entry.id(), *entry.shared_data());
                    }
                }
                self.notify_clients().await;
            }
            Err(e) => tracing::error!(error = %e, "Could not insert entries into shared database"),
        }
    }

    async fn on_field_changed(&self, entry_id: EntryId) {
        if !self.check_current_connection().await {
            return;
        }
        self.pull_metadata().await;

        let entry = self.context.database().lock().await.entry(entry_id).cloned();
        match entry {
            Some(entry) if entry.shared_data().is_shared() => {
                self.push_entry_with_save_actions(entry).await;
            }
            Some(_) => tracing::debug!(%entry_id, "Changed entry is not shared yet"),
            None => tracing::debug!(%entry_id, "Changed entry is no longer present"),
        }

        self.pull_database(&[]).await;
    }

    async fn on_entries_removed(&self, removed: &[BibEntry]) {
        if !self.check_current_connection().await {
            return;
        }

        let shared: Vec<BibEntry> = removed
            .iter()
            .filter(|entry| entry.shared_data().is_shared())
            .cloned()
            .collect();
        if !shared.is_empty() {
            match self.processor.remove_entries(&shared).await {
                Ok(()) => self.notify_clients().await,
                Err(e) => {
                    tracing::error!(error = %e, "Could not remove entries from shared database")
                }
            }
        }

        self.pull_metadata().await;
        self.pull_database(&[]).await;
    }

    async fn on_metadata_changed(&self) {
        if !self.check_current_connection().await {
            return;
        }
        self.push_metadata().await;
        self.pull_database(&[]).await;
        self.apply_metadata().await;
        self.notify_clients().await;
    }

    /// Apply save actions to `entry`, then push it.
    ///
    /// A version conflict is published as [`SharedEvent::UpdateRefused`].
    pub async fn synchronize_shared_entry(&self, entry: &BibEntry) {
        if !self.check_current_connection().await {
            return;
        }
        self.push_entry_with_save_actions(entry.clone()).await;
    }

    async fn push_entry_with_save_actions(&self, entry: BibEntry) {
        let entry = match self.save_actions().await {
            Some(cleanups) => {
                let mut database = self.context.database().lock().await;
                database.apply_cleanups(entry.id(), &cleanups, EventSource::Shared);
                database.entry(entry.id()).cloned().unwrap_or(entry)
            }
            None => entry,
        };
        if self.push_entry(&entry).await {
            self.notify_clients().await;
        }
    }

    /// Push one entry. Returns whether the shared row was written.
    async fn push_entry(&self, entry: &BibEntry) -> bool {
        match self.processor.update_entry(entry).await {
            Ok(()) => true,
            Err(SharedError::OfflineLock(conflict)) => {
                tracing::warn!(
                    shared_id = conflict.shared.shared_data().shared_id(),
                    local_version = conflict.local.shared_data().version(),
                    shared_version = conflict.shared.shared_data().version(),
                    "Update refused, shared entry is newer"
                );
                self.post(SharedEvent::UpdateRefused {
                    database_name: self.database_name().to_string(),
                    local: conflict.local,
                    shared: conflict.shared,
                });
                false
            }
            Err(e) => {
                tracing::error!(
                    shared_id = entry.shared_data().shared_id(),
                    error = %e,
                    "Could not update shared entry"
                );
                false
            }
        }
    }

    /// Enabled save actions from the local metadata.
    async fn save_actions(&self) -> Option<FieldFormatterCleanups> {
        let parsed = self.context.metadata().lock().await.save_actions();
        match parsed {
            Ok(Some(cleanups)) if cleanups.is_enabled() => Some(cleanups),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid save actions");
                None
            }
        }
    }

    /// Run the save actions over every local entry and push the shared ones
    /// they changed.
    pub async fn apply_metadata(&self) {
        let Some(cleanups) = self.save_actions().await else {
            return;
        };

        let mut changed = Vec::new();
        {
            let mut database = self.context.database().lock().await;
            let ids: Vec<EntryId> = database.entries().iter().map(BibEntry::id).collect();
            for id in ids {
                let events = database.apply_cleanups(id, &cleanups, EventSource::Shared);
                if let (false, Some(entry)) = (events.is_empty(), database.entry(id)) {
                    changed.push(entry.clone());
                }
            }
        }

        for entry in changed.iter().filter(|entry| entry.shared_data().is_shared()) {
            self.push_entry(entry).await;
        }
    }

    /// Pull the shared entries and metadata.
    pub async fn pull_changes(&self) {
        let _operation = self.operation.lock().await;
        if !self.check_current_connection().await {
            return;
        }
        self.pull_database(&[]).await;
        self.pull_metadata().await;
    }

    /// Bring the local entries in line with the shared ones.
    pub async fn synchronize_local_database(&self) {
        if !self.check_current_connection().await {
            return;
        }
        self.pull_database(&[]).await;
    }

    /// Replace the local metadata with the shared one.
    pub async fn synchronize_local_metadata(&self) {
        if !self.check_current_connection().await {
            return;
        }
        self.pull_metadata().await;
    }

    /// Push the local metadata.
    pub async fn synchronize_shared_metadata(&self) {
        if !self.check_current_connection().await {
            return;
        }
        self.push_metadata().await;
    }

    async fn pull_metadata(&self) {
        match self.processor.get_shared_metadata().await {
            Ok(shared) => self.context.metadata().lock().await.replace_all(shared),
            Err(e) => tracing::error!(error = %e, "Could not read shared metadata"),
        }
    }

    async fn push_metadata(&self) {
        let local = self.context.metadata().lock().await.as_map().clone();
        if let Err(e) = self.processor.set_shared_metadata(&local).await {
            tracing::error!(error = %e, "Could not write shared metadata");
        }
    }

    /// Remove orphans, overwrite stale entries and add missing ones. Entries
    /// in `pending` are about to be inserted and never count as orphans.
    async fn pull_database(&self, pending: &[EntryId]) {
        let remote_versions = match self.processor.get_shared_id_version_mapping().await {
            Ok(mapping) => mapping,
            Err(e) => {
                tracing::error!(error = %e, "Could not read shared entry versions");
                return;
            }
        };

        let (orphans, local_versions) = {
            let database = self.context.database().lock().await;
            let orphans: Vec<BibEntry> = database
                .entries()
                .iter()
                .filter(|entry| {
                    let data = entry.shared_data();
                    data.is_shared()
                        && !remote_versions.contains_key(&data.shared_id())
                        && !pending.contains(&entry.id())
                })
                .cloned()
                .collect();
            let local_versions: HashMap<i32, i32> = database
                .entries()
                .iter()
                .filter(|entry| entry.shared_data().is_shared())
                .map(|entry| (entry.shared_data().shared_id(), entry.shared_data().version()))
                .collect();
            (orphans, local_versions)
        };

        if !orphans.is_empty() {
            let ids: Vec<EntryId> = orphans.iter().map(BibEntry::id).collect();
            self.context
                .database()
                .lock()
                .await
                .remove_entries(&ids, EventSource::Shared);
            tracing::info!(entries = orphans.len(), "Removed entries deleted from shared database");
            self.post(SharedEvent::SharedEntriesNotPresent { entries: orphans });
        }

        let mut stale = Vec::new();
        let mut missing = Vec::new();
        for (&shared_id, &version) in &remote_versions {
            match local_versions.get(&shared_id) {
                Some(&local_version) if version > local_version => stale.push(shared_id),
                Some(_) => {}
                None => missing.push(shared_id),
            }
        }

        if !stale.is_empty() {
            match self.processor.get_shared_entries_by_ids(&stale).await {
                Ok(shared_entries) => {
                    let mut database = self.context.database().lock().await;
                    for shared in &shared_entries {
                        apply_shared_entry(&mut database, shared);
                    }
                    tracing::debug!(entries = shared_entries.len(), "Pulled updated entries");
                }
                Err(e) => tracing::error!(error = %e, "Could not read updated shared entries"),
            }
        }

        if !missing.is_empty() {
            match self.processor.get_shared_entries_by_ids(&missing).await {
                Ok(shared_entries) => {
                    tracing::debug!(entries = shared_entries.len(), "Pulled new entries");
                    self.context
                        .database()
                        .lock()
                        .await
                        .insert_entries(shared_entries, EventSource::Shared);
                }
                Err(e) => tracing::error!(error = %e, "Could not read new shared entries"),
            }
        }
    }

    /// Probe the connection. Posts [`SharedEvent::ConnectionLost`] when it is gone.
    pub async fn check_current_connection(&self) -> bool {
        let valid = self.processor.is_connection_valid().await;
        if !valid {
            tracing::warn!(database = self.database_name(), "Lost connection to shared database");
            self.post(SharedEvent::ConnectionLost {
                database_name: self.database_name().to_string(),
            });
        }
        valid
    }

    async fn notify_clients(&self) {
        if let Err(e) = self.processor.notify_clients(&self.processor_id).await {
            tracing::warn!(error = %e, "Could not notify other clients");
        }
    }

    /// Stop listening and release the connection.
    pub async fn close_shared_database(&self) {
        self.processor.close().await;
        tracing::info!(database = self.database_name(), "Shared database closed");
    }

    /// Forward outbound local events to [`Synchronizer::listen`] until the
    /// channel closes or the synchronizer is dropped.
    ///
    /// A field change is held back for `coalesce` and replaced by later
    /// changes of the same entry, so a burst of edits is pushed once. Any
    /// other event flushes the held change first, which keeps the order.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<DatabaseEvent>,
        coalesce: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut held: Option<DatabaseEvent> = None;
            loop {
                let next = if held.is_some() {
                    match tokio::time::timeout(coalesce, receiver.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            if !forward(&weak, held.take()).await {
                                break;
                            }
                            continue;
                        }
                    }
                } else {
                    receiver.recv().await
                };
                let Some(event) = next else {
                    forward(&weak, held.take()).await;
                    break;
                };

                if edits_same_entry(held.as_ref(), &event) {
                    held = Some(event);
                    continue;
                }
                if !forward(&weak, held.take()).await {
                    break;
                }
                if matches!(event, DatabaseEvent::FieldChanged { .. }) && !coalesce.is_zero() {
                    held = Some(event);
                } else if !forward(&weak, Some(event)).await {
                    break;
                }
            }
        })
    }

    /// Pull every `interval`, for vendors without a push channel.
    pub fn spawn_periodic_pull(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(synchronizer) = weak.upgrade() else {
                    break;
                };
                synchronizer.pull_changes().await;
            }
        })
    }

    fn post(&self, event: SharedEvent) {
        tracing::debug!(event = event.kind(), "Posting shared event");
        // No observers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl RemoteChangeHandler for Synchronizer {
    async fn on_remote_change(&self) {
        tracing::debug!("Remote change announced");
        self.pull_changes().await;
    }

    async fn on_remote_metadata_change(&self, key: &str, value: &str) {
        let _operation = self.operation.lock().await;
        let changed = self
            .context
            .metadata()
            .lock()
            .await
            .set(key, value, EventSource::Shared)
            .is_some();
        if changed {
            tracing::debug!(key, "Applied remote metadata change");
        }
    }
}

/// Hand `event` to the synchronizer. Returns `false` once it is gone.
async fn forward(synchronizer: &Weak<Synchronizer>, event: Option<DatabaseEvent>) -> bool {
    let Some(synchronizer) = synchronizer.upgrade() else {
        return false;
    };
    if let Some(event) = event {
        synchronizer.listen(&event).await;
    }
    true
}

fn edits_same_entry(held: Option<&DatabaseEvent>, next: &DatabaseEvent) -> bool {
    match (held, next) {
        (
            Some(DatabaseEvent::FieldChanged { entry_id: held, .. }),
            DatabaseEvent::FieldChanged { entry_id, .. },
        ) => held == entry_id,
        _ => false,
    }
}

/// Overwrite the local copy of `shared` field by field and record the
/// observed version. Fields missing remotely are cleared.
fn apply_shared_entry(database: &mut BibDatabase, shared: &BibEntry) {
    let shared_id = shared.shared_data().shared_id();
    let Some(local) = database.entry_by_shared_id(shared_id) else {
        return;
    };
    let id = local.id();
    let cleared: Vec<String> = local
        .field_names()
        .filter(|name| !shared.has_field(name))
        .map(str::to_string)
        .collect();

    database.set_entry_type(id, shared.entry_type(), EventSource::Shared);
    for (name, value) in shared.fields() {
        database.set_field(id, name, value, EventSource::Shared);
    }
    for name in &cleared {
        database.clear_field(id, name, EventSource::Shared);
    }
    database.set_shared_data(id, *shared.shared_data());
}
