//! Database-wide key/value metadata.

use crate::cleanup::FieldFormatterCleanups;
use crate::error::Result;
use crate::event::{DatabaseEvent, EventSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved key holding the shared schema version. Never kept locally.
pub const VERSION_DB_STRUCT: &str = "VERSION_DB_STRUCT";

/// Key holding the serialized save actions.
pub const SAVE_ACTIONS: &str = "saveActions";

/// Flat metadata map. Last writer wins per key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    values: BTreeMap<String, String>,
}

impl MetaData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a value. Returns `None` if the stored value was already equal.
    pub fn set(&mut self, key: &str, value: &str, source: EventSource) -> Option<DatabaseEvent> {
        if key == VERSION_DB_STRUCT || self.get(key) == Some(value) {
            return None;
        }
        self.values.insert(key.to_string(), value.to_string());
        Some(DatabaseEvent::MetaDataChanged { source })
    }

    pub fn remove(&mut self, key: &str, source: EventSource) -> Option<DatabaseEvent> {
        self.values
            .remove(key)
            .map(|_| DatabaseEvent::MetaDataChanged { source })
    }

    /// Replace the whole map with pulled shared state, without producing an event.
    pub fn replace_all(&mut self, values: BTreeMap<String, String>) {
        self.values = values;
        self.values.remove(VERSION_DB_STRUCT);
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parsed save actions, if any are configured.
    pub fn save_actions(&self) -> Result<Option<FieldFormatterCleanups>> {
        self.get(SAVE_ACTIONS)
            .map(FieldFormatterCleanups::parse)
            .transpose()
    }

    pub fn set_save_actions(
        &mut self,
        cleanups: &FieldFormatterCleanups,
        source: EventSource,
    ) -> Option<DatabaseEvent> {
        self.set(SAVE_ACTIONS, &cleanups.to_string(), source)
    }
}
