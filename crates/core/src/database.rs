//! In-memory bibliography database.

use crate::TYPE_HEADER;
use crate::cleanup::FieldFormatterCleanups;
use crate::entry::{BibEntry, EntryId, SharedBibEntryData, normalize_field_name};
use crate::event::{DatabaseEvent, EventSource};
use crate::metadata::MetaData;
use tokio::sync::{Mutex, broadcast, mpsc};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Ordered collection of entries.
///
/// Every mutation returns the event it produced and also broadcasts it to
/// subscribers, so views can re-render regardless of who made the change.
/// Broadcast receivers that fall behind lose events; outbound subscribers
/// get every `Local` and `Undo` event on an unbounded queue.
pub struct BibDatabase {
    entries: Vec<BibEntry>,
    events: broadcast::Sender<DatabaseEvent>,
    outbound: Vec<mpsc::UnboundedSender<DatabaseEvent>>,
}

impl BibDatabase {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Vec::new(),
            events,
            outbound: Vec::new(),
        }
    }

    /// Subscribe to every event this database posts from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.events.subscribe()
    }

    /// Receive every event with an outbound source from now on. Nothing is
    /// dropped, however long the receiver takes.
    pub fn subscribe_outbound(&mut self) -> mpsc::UnboundedReceiver<DatabaseEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.outbound.push(sender);
        receiver
    }

    pub fn entries(&self) -> &[BibEntry] {
        &self.entries
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, id: EntryId) -> Option<&BibEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub fn entry_by_shared_id(&self, shared_id: i32) -> Option<&BibEntry> {
        self.entries
            .iter()
            .find(|entry| entry.shared_data().shared_id() == shared_id)
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.entry(id).is_some()
    }

    pub fn insert_entry(&mut self, entry: BibEntry, source: EventSource) -> DatabaseEvent {
        self.entries.push(entry.clone());
        self.post(DatabaseEvent::EntriesAdded {
            entries: vec![entry],
            source,
        })
    }

    pub fn insert_entries(
        &mut self,
        entries: Vec<BibEntry>,
        source: EventSource,
    ) -> Option<DatabaseEvent> {
        if entries.is_empty() {
            return None;
        }
        self.entries.extend(entries.iter().cloned());
        Some(self.post(DatabaseEvent::EntriesAdded { entries, source }))
    }

    /// Remove the entries with the given ids. Unknown ids are ignored.
    pub fn remove_entries(&mut self, ids: &[EntryId], source: EventSource) -> Option<DatabaseEvent> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| ids.contains(&entry.id()));
        self.entries = kept;

        if removed.is_empty() {
            return None;
        }
        Some(self.post(DatabaseEvent::EntriesRemoved {
            entries: removed,
            source,
        }))
    }

    /// Set a field. Returns `None` when the entry is unknown or the value is unchanged.
    pub fn set_field(
        &mut self,
        id: EntryId,
        field: &str,
        value: &str,
        source: EventSource,
    ) -> Option<DatabaseEvent> {
        let entry = self.entry_mut(id)?;
        if entry.field(field) == Some(value) {
            return None;
        }
        let old_value = entry.set_field(field, value);
        Some(self.post(DatabaseEvent::FieldChanged {
            entry_id: id,
            field: normalize_field_name(field),
            old_value,
            new_value: Some(value.to_string()),
            source,
        }))
    }

    /// Clear a field. Returns `None` when the entry or the field does not exist.
    pub fn clear_field(
        &mut self,
        id: EntryId,
        field: &str,
        source: EventSource,
    ) -> Option<DatabaseEvent> {
        let old_value = self.entry_mut(id)?.clear_field(field)?;
        Some(self.post(DatabaseEvent::FieldChanged {
            entry_id: id,
            field: normalize_field_name(field),
            old_value: Some(old_value),
            new_value: None,
            source,
        }))
    }

    pub fn set_entry_type(
        &mut self,
        id: EntryId,
        entry_type: &str,
        source: EventSource,
    ) -> Option<DatabaseEvent> {
        let old_value = self.entry_mut(id)?.set_entry_type(entry_type)?;
        Some(self.post(DatabaseEvent::FieldChanged {
            entry_id: id,
            field: TYPE_HEADER.to_string(),
            old_value: Some(old_value),
            new_value: Some(entry_type.to_string()),
            source,
        }))
    }

    /// Overwrite the shared sidecar of an entry. Not a content change, so no event.
    pub fn set_shared_data(&mut self, id: EntryId, data: SharedBibEntryData) -> bool {
        match self.entry_mut(id) {
            Some(entry) => {
                *entry.shared_data_mut() = data;
                true
            }
            None => false,
        }
    }

    /// Run the save actions over one entry and return the events of the fields it changed.
    pub fn apply_cleanups(
        &mut self,
        id: EntryId,
        cleanups: &FieldFormatterCleanups,
        source: EventSource,
    ) -> Vec<DatabaseEvent> {
        let Some(entry) = self.entry(id) else {
            return Vec::new();
        };
        cleanups
            .changes_for(entry)
            .into_iter()
            .filter_map(|change| self.set_field(id, &change.field, &change.new_value, source))
            .collect()
    }

    fn entry_mut(&mut self, id: EntryId) -> Option<&mut BibEntry> {
        self.entries.iter_mut().find(|entry| entry.id() == id)
    }

    fn post(&mut self, event: DatabaseEvent) -> DatabaseEvent {
        if event.source().is_outbound() {
            self.outbound
                .retain(|sender| sender.send(event.clone()).is_ok());
        }
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        event
    }
}

impl Default for BibDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// A database together with its metadata, as opened by one client.
///
/// Both halves sit behind async mutexes; the synchronizer holds a lock only
/// for the duration of one local read or write and never across a database call.
pub struct BibDatabaseContext {
    name: String,
    database: Mutex<BibDatabase>,
    metadata: Mutex<MetaData>,
}

impl BibDatabaseContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parts(name, BibDatabase::new(), MetaData::default())
    }

    pub fn with_parts(name: impl Into<String>, database: BibDatabase, metadata: MetaData) -> Self {
        Self {
            name: name.into(),
            database: Mutex::new(database),
            metadata: Mutex::new(metadata),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Mutex<BibDatabase> {
        &self.database
    }

    pub fn metadata(&self) -> &Mutex<MetaData> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut db = BibDatabase::new();
        let entry = BibEntry::new("article").with_shared_data(3, 1);
        let id = entry.id();

        let event = db.insert_entry(entry, EventSource::Local);
        assert!(matches!(event, DatabaseEvent::EntriesAdded { ref entries, .. } if entries.len() == 1));
        assert!(db.contains(id));
        assert_eq!(db.entry_by_shared_id(3).map(BibEntry::id), Some(id));
        assert!(db.insert_entries(Vec::new(), EventSource::Local).is_none());
    }

    #[test]
    fn test_set_field_reports_only_changes() {
        let mut db = BibDatabase::new();
        let entry = BibEntry::new("article").with_field("title", "X");
        let id = entry.id();
        db.insert_entry(entry, EventSource::Local);

        assert!(db.set_field(id, "title", "X", EventSource::Local).is_none());

        let event = db
            .set_field(id, "Title", "Y", EventSource::Shared)
            .expect("value changed");
        match event {
            DatabaseEvent::FieldChanged {
                field,
                old_value,
                new_value,
                source,
                ..
            } => {
                assert_eq!(field, "title");
                assert_eq!(old_value.as_deref(), Some("X"));
                assert_eq!(new_value.as_deref(), Some("Y"));
                assert_eq!(source, EventSource::Shared);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(db.set_field(EntryId::new(), "title", "Z", EventSource::Local).is_none());
    }

    #[test]
    fn test_clear_field_and_type_change() {
        let mut db = BibDatabase::new();
        let entry = BibEntry::new("article").with_field("year", "2024");
        let id = entry.id();
        db.insert_entry(entry, EventSource::Local);

        assert!(db.clear_field(id, "year", EventSource::Local).is_some());
        assert!(db.clear_field(id, "year", EventSource::Local).is_none());

        let event = db
            .set_entry_type(id, "book", EventSource::Local)
            .expect("type changed");
        assert!(matches!(event, DatabaseEvent::FieldChanged { ref field, .. } if field == TYPE_HEADER));
        assert_eq!(db.entry(id).unwrap().entry_type(), "book");
    }

    #[test]
    fn test_remove_entries_ignores_unknown_ids() {
        let mut db = BibDatabase::new();
        let a = BibEntry::new("article");
        let b = BibEntry::new("book");
        let a_id = a.id();
        db.insert_entries(vec![a, b], EventSource::Local);

        let event = db
            .remove_entries(&[a_id, EntryId::new()], EventSource::Shared)
            .expect("one entry removed");
        assert!(matches!(event, DatabaseEvent::EntriesRemoved { ref entries, .. } if entries.len() == 1));
        assert_eq!(db.entry_count(), 1);
        assert!(db.remove_entries(&[a_id], EventSource::Shared).is_none());
    }

    #[tokio::test]
    async fn test_mutations_are_broadcast() {
        let mut db = BibDatabase::new();
        let mut events = db.subscribe();
        db.insert_entry(BibEntry::new("misc"), EventSource::Undo);

        let event = events.recv().await.expect("event broadcast");
        assert_eq!(event.source(), EventSource::Undo);
    }

    #[test]
    fn test_outbound_subscribers_never_miss_local_events() {
        let mut db = BibDatabase::new();
        let entry = BibEntry::new("article").with_shared_data(1, 1);
        let id = entry.id();
        db.insert_entry(entry, EventSource::Shared);
        let mut outbound = db.subscribe_outbound();

        db.set_field(id, "title", "Edited", EventSource::Local);
        for year in 0..(EVENT_CHANNEL_CAPACITY * 2) {
            db.set_field(id, "year", &year.to_string(), EventSource::Shared);
        }
        db.clear_field(id, "title", EventSource::Undo);

        match outbound.try_recv().expect("local edit kept") {
            DatabaseEvent::FieldChanged { field, new_value, .. } => {
                assert_eq!(field, "title");
                assert_eq!(new_value.as_deref(), Some("Edited"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(outbound.try_recv().unwrap().source(), EventSource::Undo);
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_dropped_outbound_subscriber_is_forgotten() {
        let mut db = BibDatabase::new();
        drop(db.subscribe_outbound());
        db.insert_entry(BibEntry::new("misc"), EventSource::Local);
        assert!(db.outbound.is_empty());
    }

    #[test]
    fn test_shared_data_update_has_no_event() {
        let mut db = BibDatabase::new();
        let entry = BibEntry::new("misc");
        let id = entry.id();
        db.insert_entry(entry, EventSource::Local);
        let mut events = db.subscribe();

        assert!(db.set_shared_data(id, SharedBibEntryData::new(12, 4)));
        assert_eq!(db.entry(id).unwrap().shared_data().shared_id(), 12);
        assert!(events.try_recv().is_err());
    }
}
