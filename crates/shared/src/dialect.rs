//! Vendor SQL dialects.
//!
//! Every statement a processor issues is built here, and every table and
//! column name goes through [`Dialect::escape`] exactly once. Vendors differ
//! in identifier quoting, bind placeholders and a few clauses.

use bibsync_core::DatabaseType;

pub const ENTRY_TABLE: &str = "entry";
pub const FIELD_TABLE: &str = "field";
pub const METADATA_TABLE: &str = "metadata";

pub const SHARED_ID: &str = "shared_id";
pub const ENTRY_TYPE: &str = "entrytype";
pub const VERSION: &str = "version";
pub const ENTRY_SHARED_ID: &str = "entry_shared_id";
pub const NAME: &str = "name";
pub const VALUE: &str = "value";
pub const KEY: &str = "key";

/// SQL flavour of one backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    MySql,
    Postgres,
    Oracle,
    Sqlite,
}

impl Dialect {
    pub fn for_database(database_type: DatabaseType) -> Self {
        match database_type {
            DatabaseType::MySql => Self::MySql,
            DatabaseType::PostgreSql => Self::Postgres,
            DatabaseType::Oracle => Self::Oracle,
            DatabaseType::Sqlite => Self::Sqlite,
        }
    }

    /// Quote an identifier.
    ///
    /// MySQL uses backticks, the others double quotes. Oracle folds to upper
    /// case first, since that is how it stores unquoted names.
    pub fn escape(&self, identifier: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", identifier.replace('`', "``")),
            Self::Oracle => format!("\"{}\"", identifier.to_uppercase().replace('"', "\"\"")),
            Self::Postgres | Self::Sqlite => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    /// A table name as it appears in the vendor's catalog.
    pub fn catalog_name(&self, table: &str) -> String {
        match self {
            Self::Oracle => table.to_uppercase(),
            _ => table.to_lowercase(),
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::MySql | Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${index}"),
            Self::Oracle => format!(":{index}"),
        }
    }

    /// `count` comma separated placeholders starting at parameter `start`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|index| self.placeholder(index))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `rows` parenthesized tuples of `width` placeholders each.
    fn row_placeholders(&self, width: usize, rows: usize) -> String {
        (0..rows)
            .map(|row| format!("({})", self.placeholders(row * width + 1, width)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether a multi-row INSERT can hand back generated ids with `RETURNING`.
    pub fn supports_returning(&self) -> bool {
        matches!(self, Self::Postgres | Self::Sqlite)
    }

    fn column(&self, table: &str, column: &str) -> String {
        format!("{}.{}", self.escape(table), self.escape(column))
    }

    pub fn select_id_versions(&self) -> String {
        format!(
            "SELECT {}, {} FROM {}",
            self.escape(SHARED_ID),
            self.escape(VERSION),
            self.escape(ENTRY_TABLE)
        )
    }

    pub fn select_entry_exists(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.escape(SHARED_ID),
            self.escape(ENTRY_TABLE),
            self.escape(SHARED_ID),
            self.placeholder(1)
        )
    }

    /// Lock an entry row for the rest of the transaction and read its version.
    /// SQLite locks the whole database on write and has no row locks.
    pub fn lock_entry_version(&self) -> String {
        let lock = match self {
            Self::Sqlite => "",
            _ => " FOR UPDATE",
        };
        format!(
            "SELECT {} FROM {} WHERE {} = {}{lock}",
            self.escape(VERSION),
            self.escape(ENTRY_TABLE),
            self.escape(SHARED_ID),
            self.placeholder(1)
        )
    }

    /// Insert `rows` entries, binding one entry type per row.
    pub fn insert_entries(&self, rows: usize) -> String {
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.escape(ENTRY_TABLE),
            self.escape(ENTRY_TYPE),
            self.row_placeholders(1, rows)
        );
        if self.supports_returning() {
            sql.push_str(&format!(" RETURNING {}", self.escape(SHARED_ID)));
        }
        sql
    }

    /// Single-row insert that returns the generated id into an out bind.
    pub fn insert_entry_returning_into(&self) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {} INTO {}",
            self.escape(ENTRY_TABLE),
            self.escape(ENTRY_TYPE),
            self.placeholder(1),
            self.escape(SHARED_ID),
            self.placeholder(2)
        )
    }

    /// Insert `rows` fields, binding (entry id, name, value) per row.
    pub fn insert_fields(&self, rows: usize) -> String {
        format!(
            "INSERT INTO {} ({}, {}, {}) VALUES {}",
            self.escape(FIELD_TABLE),
            self.escape(ENTRY_SHARED_ID),
            self.escape(NAME),
            self.escape(VALUE),
            self.row_placeholders(3, rows)
        )
    }

    /// Entries joined with their fields, ordered by id. With `id_count`
    /// the result is restricted to that many bound ids.
    pub fn select_shared_entries(&self, id_count: Option<usize>) -> String {
        let mut sql = format!(
            "SELECT {}, {}, {}, {}, {} FROM {} LEFT OUTER JOIN {} ON {} = {}",
            self.column(ENTRY_TABLE, SHARED_ID),
            self.column(ENTRY_TABLE, VERSION),
            self.column(ENTRY_TABLE, ENTRY_TYPE),
            self.column(FIELD_TABLE, NAME),
            self.column(FIELD_TABLE, VALUE),
            self.escape(ENTRY_TABLE),
            self.escape(FIELD_TABLE),
            self.column(ENTRY_TABLE, SHARED_ID),
            self.column(FIELD_TABLE, ENTRY_SHARED_ID)
        );
        if let Some(count) = id_count {
            sql.push_str(&format!(
                " WHERE {} IN ({})",
                self.column(ENTRY_TABLE, SHARED_ID),
                self.placeholders(1, count)
            ));
        }
        sql.push_str(&format!(
            " ORDER BY {}",
            self.column(ENTRY_TABLE, SHARED_ID)
        ));
        sql
    }

    pub fn select_field(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {} AND {} = {}",
            self.escape(NAME),
            self.escape(FIELD_TABLE),
            self.escape(NAME),
            self.placeholder(1),
            self.escape(ENTRY_SHARED_ID),
            self.placeholder(2)
        )
    }

    pub fn update_field(&self) -> String {
        format!(
            "UPDATE {} SET {} = {} WHERE {} = {} AND {} = {}",
            self.escape(FIELD_TABLE),
            self.escape(VALUE),
            self.placeholder(1),
            self.escape(NAME),
            self.placeholder(2),
            self.escape(ENTRY_SHARED_ID),
            self.placeholder(3)
        )
    }

    pub fn delete_field(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} = {} AND {} = {}",
            self.escape(FIELD_TABLE),
            self.escape(NAME),
            self.placeholder(1),
            self.escape(ENTRY_SHARED_ID),
            self.placeholder(2)
        )
    }

    /// Set the entry type and bump the version by exactly one.
    pub fn update_entry_type_and_version(&self) -> String {
        format!(
            "UPDATE {} SET {} = {}, {} = {} + 1 WHERE {} = {}",
            self.escape(ENTRY_TABLE),
            self.escape(ENTRY_TYPE),
            self.placeholder(1),
            self.escape(VERSION),
            self.escape(VERSION),
            self.escape(SHARED_ID),
            self.placeholder(2)
        )
    }

    pub fn delete_entries(&self, count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.escape(ENTRY_TABLE),
            self.escape(SHARED_ID),
            self.placeholders(1, count)
        )
    }

    pub fn select_metadata(&self) -> String {
        format!(
            "SELECT {}, {} FROM {}",
            self.escape(KEY),
            self.escape(VALUE),
            self.escape(METADATA_TABLE)
        )
    }

    pub fn select_metadata_value(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.escape(VALUE),
            self.escape(METADATA_TABLE),
            self.escape(KEY),
            self.placeholder(1)
        )
    }

    pub fn update_metadata(&self) -> String {
        format!(
            "UPDATE {} SET {} = {} WHERE {} = {}",
            self.escape(METADATA_TABLE),
            self.escape(VALUE),
            self.placeholder(1),
            self.escape(KEY),
            self.placeholder(2)
        )
    }

    pub fn insert_metadata(&self) -> String {
        format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            self.escape(METADATA_TABLE),
            self.escape(KEY),
            self.escape(VALUE),
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    /// Single statement that upserts one metadata value, where the vendor has
    /// one. Binds (key, value).
    pub fn upsert_metadata(&self) -> Option<&'static str> {
        match self {
            Self::Postgres => Some("SELECT upsert_metadata($1, $2)"),
            _ => None,
        }
    }

    /// Names of the tables visible to the current user in the current schema.
    pub fn list_tables(&self) -> &'static str {
        match self {
            Self::MySql => {
                "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
                 WHERE table_schema = DATABASE()"
            }
            Self::Postgres => {
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema()"
            }
            Self::Oracle => "SELECT table_name FROM user_tables",
            Self::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table'",
        }
    }
}
