//! Events produced by mutations of the local model.

use crate::entry::{BibEntry, EntryId};
use serde::{Deserialize, Serialize};

/// Origin of a local model mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Edited on this client.
    Local,
    /// Applied by the synchronizer while pulling shared state.
    Shared,
    /// Replayed by an undo/redo.
    Undo,
}

impl EventSource {
    /// Whether changes from this source have to be pushed to the shared database.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Local | Self::Undo)
    }
}

/// A change to the local database or its metadata.
#[derive(Clone, Debug)]
pub enum DatabaseEvent {
    EntriesAdded {
        entries: Vec<BibEntry>,
        source: EventSource,
    },
    EntriesRemoved {
        entries: Vec<BibEntry>,
        source: EventSource,
    },
    /// A field value changed. Entry type changes are reported with
    /// [`crate::TYPE_HEADER`] as the field name.
    FieldChanged {
        entry_id: EntryId,
        field: String,
        old_value: Option<String>,
        new_value: Option<String>,
        source: EventSource,
    },
    MetaDataChanged {
        source: EventSource,
    },
}

impl DatabaseEvent {
    pub fn source(&self) -> EventSource {
        match self {
            Self::EntriesAdded { source, .. }
            | Self::EntriesRemoved { source, .. }
            | Self::FieldChanged { source, .. }
            | Self::MetaDataChanged { source } => *source,
        }
    }
}
