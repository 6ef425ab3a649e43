#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use bibsync_core::{BibEntry, ConnectionProperties, DatabaseType};
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a config pointing at a SQLite file inside `temp`.
fn sqlite_config(temp: &TempDir) -> (PathBuf, PathBuf) {
    let db_path = temp.path().join("shared.db");
    let config_path = temp.path().join("bibsync.toml");
    fs::write(
        &config_path,
        format!(
            "[database]\ntype = \"sqlite\"\ndatabase = \"{}\"\n",
            db_path.display()
        ),
    )
    .unwrap();
    (config_path, db_path)
}

fn bibsync(config_path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("bibsync").unwrap();
    cmd.env_remove("BIBSYNC_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(config_path);
    cmd
}

#[test]
fn check_reports_missing_structure_then_setup_fixes_it() {
    let temp = TempDir::new().unwrap();
    let (config_path, _) = sqlite_config(&temp);

    bibsync(&config_path)
        .arg("check")
        .assert()
        .success()
        .stdout(contains("Database type: sqlite"))
        .stdout(contains("missing or outdated"));

    bibsync(&config_path)
        .arg("setup")
        .assert()
        .success()
        .stdout(contains("Shared database is set up"));

    bibsync(&config_path)
        .arg("check")
        .assert()
        .success()
        .stdout(contains("Structure:     current"))
        .stdout(contains("Pre-3.6 layout: no"));
}

#[test]
fn list_prints_shared_entries_as_json() {
    let temp = TempDir::new().unwrap();
    let (config_path, db_path) = sqlite_config(&temp);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let properties = ConnectionProperties::builder(DatabaseType::Sqlite)
            .database(db_path.to_string_lossy())
            .build()
            .unwrap();
        let processor = bibsync_shared::connect(properties).await.unwrap();
        processor.setup_shared_database().await.unwrap();
        let mut entry = BibEntry::new("article").with_field("title", "Listed");
        processor.insert_entry(&mut entry).await.unwrap();
        processor.close().await;
    });

    let output = bibsync(&config_path).arg("list").output().unwrap();
    assert!(output.status.success());

    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = entries.as_array().expect("JSON array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["entry_type"], "article");
    assert_eq!(entries[0]["fields"]["title"], "Listed");
}

#[test]
fn missing_configuration_is_reported() {
    let temp = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("bibsync").unwrap();
    for (key, _) in std::env::vars().filter(|(key, _)| key.starts_with("BIBSYNC_")) {
        cmd.env_remove(key);
    }
    cmd.current_dir(temp.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("No configuration provided"));
}

#[test]
fn invalid_database_settings_are_rejected() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("bibsync.toml");
    fs::write(
        &config_path,
        "[database]\ntype = \"postgresql\"\nhost = \"localhost\"\ndatabase = \"jabref\"\n",
    )
    .unwrap();

    bibsync(&config_path)
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("invalid database configuration"));
}

#[test]
fn environment_overrides_file() {
    let temp = TempDir::new().unwrap();
    let (config_path, _) = sqlite_config(&temp);
    let other_db = temp.path().join("other.db");

    bibsync(&config_path)
        .env("BIBSYNC_DATABASE__DATABASE", &other_db)
        .arg("setup")
        .assert()
        .success();

    assert!(other_db.exists());
    assert!(!temp.path().join("shared.db").exists());
}
