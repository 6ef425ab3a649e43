//! Events the synchronizer publishes for the UI layer.

use bibsync_core::BibEntry;

#[derive(Debug, Clone)]
pub enum SharedEvent {
    /// The liveness check failed and the current operation was abandoned.
    ConnectionLost { database_name: String },

    /// A push was refused because the shared entry moved on. Carries both
    /// sides so the user can pick one or merge.
    UpdateRefused {
        database_name: String,
        local: BibEntry,
        shared: BibEntry,
    },

    /// Local entries whose shared rows are gone. They have already been
    /// removed from the local database.
    SharedEntriesNotPresent { entries: Vec<BibEntry> },
}

impl SharedEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionLost { .. } => "connection_lost",
            Self::UpdateRefused { .. } => "update_refused",
            Self::SharedEntriesNotPresent { .. } => "shared_entries_not_present",
        }
    }
}
