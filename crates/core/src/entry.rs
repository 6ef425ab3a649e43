//! Bibliography entries and their shared-database sidecar.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Shared id of an entry that has never been pushed to a shared database.
pub const UNSHARED_ID: i32 = -1;

/// Local identity of an entry inside one in-memory database.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generate a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The join key between a local entry and its rows in the shared database.
///
/// Only the processor (recording a generated id on insert) and the
/// synchronizer (recording the version observed on pull) write to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBibEntryData {
    shared_id: i32,
    version: i32,
}

impl SharedBibEntryData {
    pub fn new(shared_id: i32, version: i32) -> Self {
        Self { shared_id, version }
    }

    pub fn shared_id(&self) -> i32 {
        self.shared_id
    }

    pub fn set_shared_id(&mut self, shared_id: i32) {
        self.shared_id = shared_id;
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    /// Whether the entry has been assigned an id by a shared database.
    pub fn is_shared(&self) -> bool {
        self.shared_id != UNSHARED_ID
    }
}

impl Default for SharedBibEntryData {
    fn default() -> Self {
        Self {
            shared_id: UNSHARED_ID,
            version: 1,
        }
    }
}

/// Normalize a field name the way field names are stored (trimmed, lowercase).
pub fn normalize_field_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A single bibliography entry.
///
/// Equality compares the entry type and the field map only. The local id and
/// the shared sidecar are bookkeeping and do not take part in it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BibEntry {
    id: EntryId,
    entry_type: String,
    fields: BTreeMap<String, String>,
    #[serde(default)]
    shared: SharedBibEntryData,
}

impl BibEntry {
    /// Create an empty entry of the given type.
    pub fn new(entry_type: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            entry_type: entry_type.into(),
            fields: BTreeMap::new(),
            shared: SharedBibEntryData::default(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Builder-style sidecar setter.
    pub fn with_shared_data(mut self, shared_id: i32, version: i32) -> Self {
        self.shared = SharedBibEntryData::new(shared_id, version);
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn entry_type(&self) -> &str {
        &self.entry_type
    }

    /// Replace the entry type. Returns the previous type if it changed.
    pub fn set_entry_type(&mut self, entry_type: impl Into<String>) -> Option<String> {
        let entry_type = entry_type.into();
        if entry_type == self.entry_type {
            return None;
        }
        Some(std::mem::replace(&mut self.entry_type, entry_type))
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&normalize_field_name(name))
            .map(String::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(&normalize_field_name(name))
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Set a field value and return the previous one.
    pub fn set_field(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
        self.fields.insert(normalize_field_name(name), value.into())
    }

    /// Remove a field and return its value.
    pub fn clear_field(&mut self, name: &str) -> Option<String> {
        self.fields.remove(&normalize_field_name(name))
    }

    pub fn shared_data(&self) -> &SharedBibEntryData {
        &self.shared
    }

    pub fn shared_data_mut(&mut self) -> &mut SharedBibEntryData {
        &mut self.shared
    }
}

impl PartialEq for BibEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry_type == other.entry_type && self.fields == other.fields
    }
}

impl Eq for BibEntry {}
