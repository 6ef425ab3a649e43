//! Table layout, schema versioning and the one-time legacy migration.

use crate::dialect::{
    Dialect, ENTRY_SHARED_ID, ENTRY_TABLE, ENTRY_TYPE, FIELD_TABLE, KEY, METADATA_TABLE, NAME,
    SHARED_ID, VALUE, VERSION,
};

/// Layout version written to `VERSION_DB_STRUCT` after setup.
pub const CURRENT_VERSION_DB_STRUCT: i32 = 2;

/// Version assumed when nothing is stored and no legacy tables exist.
const UNKNOWN_VERSION_DB_STRUCT: i32 = -1;

/// Tables of the current layout, in creation order.
pub const BASE_TABLES: [&str; 3] = [ENTRY_TABLE, FIELD_TABLE, METADATA_TABLE];

/// Upper-case tables of layout versions 0 and 1.
pub const LEGACY_TABLES: [&str; 3] = ["ENTRY", "FIELD", "METADATA"];

/// Tables used by JabRef 3.5 and older. That layout cannot be migrated.
pub const PRE_36_TABLES: [&str; 7] = [
    "ENTRIES",
    "ENTRY_GROUP",
    "ENTRY_TYPES",
    "GROUPS",
    "GROUP_TYPES",
    "JABREF_DATABASE",
    "STRINGS",
];

/// Whether every pre-3.6 table is present, compared case-insensitively.
pub fn is_pre_36_layout(tables: &[String]) -> bool {
    PRE_36_TABLES
        .iter()
        .all(|required| tables.iter().any(|table| table.eq_ignore_ascii_case(required)))
}

/// Whether the three current tables exist under their catalog names.
pub fn has_base_tables(dialect: Dialect, tables: &[String]) -> bool {
    BASE_TABLES
        .iter()
        .all(|table| tables.contains(&dialect.catalog_name(table)))
}

/// Whether the upper-case tables of layout 0/1 exist next to the current ones.
///
/// Only MySQL and PostgreSQL ever used that layout. The match is exact, so the
/// current lower-case tables are never mistaken for it.
pub fn has_legacy_tables(dialect: Dialect, tables: &[String]) -> bool {
    matches!(dialect, Dialect::MySql | Dialect::Postgres)
        && LEGACY_TABLES
            .iter()
            .all(|legacy| tables.iter().any(|table| table == legacy))
}

/// Parse a stored `VERSION_DB_STRUCT` value. Older clients stored it with a
/// trailing `;`.
pub fn parse_struct_version(raw: &str) -> Option<i32> {
    raw.replace(';', "").trim().parse().ok()
}

/// The layout version a database is at, given the stored marker.
pub fn stored_struct_version(raw: Option<&str>, legacy_tables_present: bool) -> i32 {
    let fallback = if legacy_tables_present {
        0
    } else {
        UNKNOWN_VERSION_DB_STRUCT
    };
    match raw {
        Some(raw) => parse_struct_version(raw).unwrap_or_else(|| {
            tracing::warn!(value = raw, "VERSION_DB_STRUCT is not an integer");
            fallback
        }),
        None => {
            tracing::warn!("VERSION_DB_STRUCT does not exist");
            fallback
        }
    }
}

/// Whether rows have to be copied out of the legacy tables.
pub fn needs_legacy_migration(version: i32, legacy_tables_present: bool) -> bool {
    legacy_tables_present && (0..CURRENT_VERSION_DB_STRUCT).contains(&version)
}

fn create_table(dialect: Dialect, table: &str, columns: String) -> String {
    format!("CREATE TABLE {} ({columns})", dialect.escape(table))
}

fn create_index(dialect: Dialect, index: &str, table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX {} ON {} ({})",
        dialect.escape(index),
        dialect.escape(table),
        dialect.escape(column)
    )
}

/// DDL for one current table, including its indexes.
pub fn create_table_statements(dialect: Dialect, table: &str) -> Vec<String> {
    let e = |identifier: &str| dialect.escape(identifier);

    match table {
        ENTRY_TABLE => {
            let columns = match dialect {
                Dialect::MySql => format!(
                    "{} INT NOT NULL AUTO_INCREMENT PRIMARY KEY, {} VARCHAR(255), {} INT DEFAULT 1",
                    e(SHARED_ID),
                    e(ENTRY_TYPE),
                    e(VERSION)
                ),
                Dialect::Postgres => format!(
                    "{} SERIAL PRIMARY KEY, {} VARCHAR, {} INTEGER DEFAULT 1",
                    e(SHARED_ID),
                    e(ENTRY_TYPE),
                    e(VERSION)
                ),
                Dialect::Oracle => format!(
                    "{} NUMBER(10) GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, {} VARCHAR2(255), {} NUMBER(10) DEFAULT 1",
                    e(SHARED_ID),
                    e(ENTRY_TYPE),
                    e(VERSION)
                ),
                Dialect::Sqlite => format!(
                    "{} INTEGER PRIMARY KEY AUTOINCREMENT, {} TEXT, {} INTEGER DEFAULT 1",
                    e(SHARED_ID),
                    e(ENTRY_TYPE),
                    e(VERSION)
                ),
            };
            vec![create_table(dialect, ENTRY_TABLE, columns)]
        }
        FIELD_TABLE => {
            let reference = format!(
                "REFERENCES {} ({}) ON DELETE CASCADE",
                e(ENTRY_TABLE),
                e(SHARED_ID)
            );
            let columns = match dialect {
                Dialect::MySql => format!(
                    "{esid} INT NOT NULL, {} VARCHAR(255) NOT NULL, {} TEXT, FOREIGN KEY ({esid}) {reference}",
                    e(NAME),
                    e(VALUE),
                    esid = e(ENTRY_SHARED_ID)
                ),
                Dialect::Postgres => format!(
                    "{} INTEGER {reference}, {} VARCHAR, {} TEXT",
                    e(ENTRY_SHARED_ID),
                    e(NAME),
                    e(VALUE)
                ),
                Dialect::Oracle => format!(
                    "{} NUMBER(10) {reference}, {} VARCHAR2(255), {} CLOB",
                    e(ENTRY_SHARED_ID),
                    e(NAME),
                    e(VALUE)
                ),
                Dialect::Sqlite => format!(
                    "{} INTEGER {reference}, {} TEXT, {} TEXT",
                    e(ENTRY_SHARED_ID),
                    e(NAME),
                    e(VALUE)
                ),
            };
            vec![
                create_table(dialect, FIELD_TABLE, columns),
                create_index(
                    dialect,
                    "idx_field_entry_shared_id",
                    FIELD_TABLE,
                    ENTRY_SHARED_ID,
                ),
                create_index(dialect, "idx_field_name", FIELD_TABLE, NAME),
            ]
        }
        METADATA_TABLE => {
            let columns = match dialect {
                Dialect::MySql => format!(
                    "{} VARCHAR(255) NOT NULL PRIMARY KEY, {} TEXT",
                    e(KEY),
                    e(VALUE)
                ),
                Dialect::Postgres => format!("{} VARCHAR PRIMARY KEY, {} TEXT", e(KEY), e(VALUE)),
                Dialect::Oracle => format!(
                    "{} VARCHAR2(255) PRIMARY KEY, {} CLOB",
                    e(KEY),
                    e(VALUE)
                ),
                Dialect::Sqlite => format!("{} TEXT PRIMARY KEY, {} TEXT", e(KEY), e(VALUE)),
            };
            vec![create_table(dialect, METADATA_TABLE, columns)]
        }
        _ => Vec::new(),
    }
}

/// DDL for the current tables that do not exist yet.
pub fn missing_table_statements(dialect: Dialect, tables: &[String]) -> Vec<String> {
    BASE_TABLES
        .iter()
        .filter(|table| !tables.contains(&dialect.catalog_name(table)))
        .flat_map(|table| create_table_statements(dialect, table))
        .collect()
}

/// Copy the rows of the upper-case legacy tables into the current ones.
///
/// Metadata keys already present in the current table win. PostgreSQL
/// additionally re-seeds the id sequence past the copied ids.
pub fn legacy_migration_statements(dialect: Dialect) -> Vec<String> {
    let e = |identifier: &str| dialect.escape(identifier);

    let mut statements = vec![
        format!(
            "INSERT INTO {} ({}, {}, {}) SELECT {}, {}, {} FROM {}",
            e(ENTRY_TABLE),
            e(SHARED_ID),
            e(ENTRY_TYPE),
            e(VERSION),
            e("SHARED_ID"),
            e("TYPE"),
            e("VERSION"),
            e("ENTRY")
        ),
        format!(
            "INSERT INTO {} ({}, {}, {}) SELECT {}, {}, {} FROM {}",
            e(FIELD_TABLE),
            e(ENTRY_SHARED_ID),
            e(NAME),
            e(VALUE),
            e("ENTRY_SHARED_ID"),
            e("NAME"),
            e("VALUE"),
            e("FIELD")
        ),
        format!(
            "INSERT INTO {} ({}, {}) SELECT {}, {} FROM {} WHERE {} NOT IN (SELECT {} FROM {})",
            e(METADATA_TABLE),
            e(KEY),
            e(VALUE),
            e("KEY"),
            e("VALUE"),
            e("METADATA"),
            e("KEY"),
            e(KEY),
            e(METADATA_TABLE)
        ),
    ];

    if dialect == Dialect::Postgres {
        statements.push(format!(
            "SELECT setval(pg_get_serial_sequence('{ENTRY_TABLE}', '{SHARED_ID}'), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
            e(SHARED_ID),
            e(ENTRY_TABLE)
        ));
    }
    statements
}

/// Statements run on every setup after the tables exist.
pub fn vendor_setup_statements(dialect: Dialect) -> Vec<String> {
    match dialect {
        Dialect::Postgres => vec![postgres_upsert_metadata_function()],
        _ => Vec::new(),
    }
}

/// PostgreSQL function that upserts one metadata key and emits a
/// `metadata_update` notification when the stored value actually changed.
pub fn postgres_upsert_metadata_function() -> String {
    let e = |identifier: &str| Dialect::Postgres.escape(identifier);
    format!(
        r#"CREATE OR REPLACE FUNCTION upsert_metadata(p_key TEXT, p_value TEXT) RETURNS VOID AS $$
DECLARE
    existing_value TEXT;
    existing_found BOOLEAN;
BEGIN
    SELECT {value} INTO existing_value FROM {metadata} WHERE {key} = p_key;
    existing_found := FOUND;

    INSERT INTO {metadata} ({key}, {value})
    VALUES (p_key, p_value)
    ON CONFLICT ({key})
    DO UPDATE SET {value} = EXCLUDED.{value};

    IF NOT existing_found OR existing_value IS DISTINCT FROM p_value THEN
        PERFORM pg_notify('{channel}', json_build_object('key', p_key, 'value', p_value)::TEXT);
    END IF;
END;
$$ LANGUAGE plpgsql"#,
        value = e(VALUE),
        key = e(KEY),
        metadata = e(METADATA_TABLE),
        channel = crate::notifications::METADATA_UPDATE_CHANNEL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_parse_struct_version() {
        assert_eq!(parse_struct_version("2"), Some(2));
        assert_eq!(parse_struct_version("1;"), Some(1));
        assert_eq!(parse_struct_version(" 0 ; "), Some(0));
        assert_eq!(parse_struct_version("two"), None);
    }

    #[test]
    fn test_stored_struct_version_fallbacks() {
        assert_eq!(stored_struct_version(Some("2"), true), 2);
        assert_eq!(stored_struct_version(None, false), -1);
        assert_eq!(stored_struct_version(None, true), 0);
        assert_eq!(stored_struct_version(Some("garbage"), false), -1);
    }

    #[test]
    fn test_needs_legacy_migration() {
        assert!(needs_legacy_migration(0, true));
        assert!(needs_legacy_migration(1, true));
        assert!(!needs_legacy_migration(2, true));
        assert!(!needs_legacy_migration(-1, true));
        assert!(!needs_legacy_migration(0, false));
    }

    #[test]
    fn test_pre_36_detection_is_case_insensitive() {
        let old = tables(&[
            "entries",
            "ENTRY_GROUP",
            "entry_types",
            "groups",
            "GROUP_TYPES",
            "jabref_database",
            "Strings",
        ]);
        assert!(is_pre_36_layout(&old));
        assert!(!is_pre_36_layout(&tables(&["entries", "groups"])));
        assert!(!is_pre_36_layout(&tables(&["entry", "field", "metadata"])));
    }

    #[test]
    fn test_base_tables_use_catalog_case() {
        let lower = tables(&["entry", "field", "metadata"]);
        assert!(has_base_tables(Dialect::Postgres, &lower));
        assert!(!has_base_tables(Dialect::Oracle, &lower));
        assert!(has_base_tables(
            Dialect::Oracle,
            &tables(&["ENTRY", "FIELD", "METADATA"])
        ));
    }

    #[test]
    fn test_legacy_tables_match_exactly() {
        let legacy = tables(&["ENTRY", "FIELD", "METADATA", "entry"]);
        assert!(has_legacy_tables(Dialect::Postgres, &legacy));
        assert!(has_legacy_tables(Dialect::MySql, &legacy));
        assert!(!has_legacy_tables(Dialect::Oracle, &legacy));
        assert!(!has_legacy_tables(
            Dialect::Postgres,
            &tables(&["entry", "field", "metadata"])
        ));
    }

    #[test]
    fn test_missing_tables_only() {
        let statements = missing_table_statements(Dialect::Sqlite, &tables(&["entry"]));
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("CREATE TABLE \"field\""));
        assert!(statements[1].starts_with("CREATE INDEX \"idx_field_entry_shared_id\""));
        assert!(statements[3].starts_with("CREATE TABLE \"metadata\""));

        let all = tables(&["entry", "field", "metadata"]);
        assert!(missing_table_statements(Dialect::Sqlite, &all).is_empty());
    }

    #[test]
    fn test_field_table_cascades() {
        for dialect in [
            Dialect::MySql,
            Dialect::Postgres,
            Dialect::Oracle,
            Dialect::Sqlite,
        ] {
            let ddl = &create_table_statements(dialect, FIELD_TABLE)[0];
            assert!(ddl.contains("ON DELETE CASCADE"), "{dialect:?}: {ddl}");
        }
    }

    #[test]
    fn test_legacy_migration_statements() {
        let pg = legacy_migration_statements(Dialect::Postgres);
        assert_eq!(pg.len(), 4);
        assert!(pg[0].contains("FROM \"ENTRY\""));
        assert!(pg[0].contains("\"TYPE\""));
        assert!(pg[3].contains("pg_get_serial_sequence('entry', 'shared_id')"));

        let mysql = legacy_migration_statements(Dialect::MySql);
        assert_eq!(mysql.len(), 3);
        assert!(mysql[2].contains("FROM `METADATA` WHERE `KEY` NOT IN (SELECT `key` FROM `metadata`)"));
    }

    #[test]
    fn test_upsert_function_uses_distinct_parameter_names() {
        let function = postgres_upsert_metadata_function();
        assert!(function.contains("upsert_metadata(p_key TEXT, p_value TEXT)"));
        assert!(function.contains("WHERE \"key\" = p_key"));
        assert!(function.contains("pg_notify('metadata_update'"));
    }

    #[test]
    fn test_only_postgres_has_setup_extras() {
        assert_eq!(vendor_setup_statements(Dialect::Postgres).len(), 1);
        assert!(vendor_setup_statements(Dialect::MySql).is_empty());
        assert!(vendor_setup_statements(Dialect::Sqlite).is_empty());
    }
}
