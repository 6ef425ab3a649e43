//! Rows read from the shared tables.

use sqlx::FromRow;

/// One row of the entry/field join. Entries without fields come back once
/// with `name` and `value` unset.
#[derive(Debug, Clone, FromRow)]
pub struct EntryFieldRow {
    pub shared_id: i32,
    pub version: i32,
    #[sqlx(rename = "entrytype")]
    pub entry_type: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct IdVersionRow {
    pub shared_id: i32,
    pub version: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct MetadataRow {
    pub key: String,
    pub value: Option<String>,
}
