//! Operator CLI for bibsync shared databases.

use anyhow::{Context, Result};
use bibsync_core::{AppConfig, BibDatabaseContext};
use bibsync_shared::{SharedEvent, SharedProcessor, Synchronizer};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bibsync")]
#[command(about = "Inspect and synchronize a shared bibliography database")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, env = "BIBSYNC_CONFIG", default_value = "bibsync.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the shared tables are present and current
    Check,
    /// Create missing tables and migrate legacy ones
    Setup,
    /// Print all shared entries as JSON
    List,
    /// Keep an empty local database in sync and log what happens, until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `list` output stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;
    let properties = config
        .database
        .to_properties()
        .context("invalid database configuration")?;
    let processor = bibsync_shared::connect(properties)
        .await
        .context("failed to connect to shared database")?;

    let result = match cli.command {
        Commands::Check => check(processor.as_ref()).await,
        Commands::Setup => setup(processor.as_ref()).await,
        Commands::List => list(processor.as_ref()).await,
        Commands::Watch => watch(processor.clone(), &config).await,
    };
    processor.close().await;
    result
}

/// Merge the optional config file with `BIBSYNC_` environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = Path::new(path).exists();

    if has_config_file {
        tracing::debug!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    // BIBSYNC_CONFIG only names the file.
    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with("BIBSYNC_") && key != "BIBSYNC_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: bibsync --config /path/to/bibsync.toml <command>\n  \
             2. Environment variables: BIBSYNC_DATABASE__TYPE=postgresql \
             BIBSYNC_DATABASE__DATABASE=jabref BIBSYNC_DATABASE__USER=jabref bibsync <command>\n\n\
             Set BIBSYNC_CONFIG to change the default config file path."
        );
    }

    figment
        .merge(Env::prefixed("BIBSYNC_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn check(processor: &dyn SharedProcessor) -> Result<()> {
    let integrity = processor
        .check_base_integrity()
        .await
        .context("integrity check failed")?;
    let legacy = processor
        .check_for_legacy_schema()
        .await
        .context("legacy layout check failed")?;

    println!("Database type: {}", processor.database_type());
    println!("Database:      {}", processor.connection_properties().database());
    println!("Structure:     {}", if integrity { "current" } else { "missing or outdated" });
    println!("Pre-3.6 layout: {}", if legacy { "yes (not supported)" } else { "no" });
    Ok(())
}

async fn setup(processor: &dyn SharedProcessor) -> Result<()> {
    if processor.check_for_legacy_schema().await? {
        anyhow::bail!("shared database uses the pre-3.6 layout, which cannot be migrated");
    }
    processor
        .setup_shared_database()
        .await
        .context("failed to set up shared database")?;
    println!("Shared database is set up");
    Ok(())
}

async fn list(processor: &dyn SharedProcessor) -> Result<()> {
    let entries = processor
        .get_shared_entries()
        .await
        .context("failed to read shared entries")?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

async fn watch(processor: Arc<dyn SharedProcessor>, config: &AppConfig) -> Result<()> {
    let live_update = processor.database_type().supports_live_update();
    let context = Arc::new(BibDatabaseContext::new(
        processor.connection_properties().database(),
    ));
    let synchronizer = Synchronizer::open(context.clone(), processor)
        .await
        .context("failed to open shared database")?;
    let mut events = synchronizer.register_listener();

    let local_events = context.database().lock().await.subscribe_outbound();
    let event_loop =
        synchronizer.spawn_event_loop(local_events, config.sync.edit_coalesce_window());
    let poller = if live_update {
        None
    } else {
        let interval = config.sync.poll_interval();
        tracing::info!(interval_secs = interval.as_secs(), "No push channel, pulling periodically");
        Some(synchronizer.spawn_periodic_pull(interval))
    };

    tracing::info!(
        entries = context.database().lock().await.entry_count(),
        "Watching shared database, press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed shared events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    event_loop.abort();
    if let Some(poller) = poller {
        poller.abort();
    }
    synchronizer.close_shared_database().await;
    Ok(())
}

fn log_event(event: &SharedEvent) {
    match event {
        SharedEvent::ConnectionLost { database_name } => {
            tracing::error!(database = %database_name, "Connection to shared database lost");
        }
        SharedEvent::UpdateRefused {
            database_name,
            local,
            shared,
        } => {
            tracing::warn!(
                database = %database_name,
                shared_id = shared.shared_data().shared_id(),
                local_version = local.shared_data().version(),
                shared_version = shared.shared_data().version(),
                "Local change refused, shared entry is newer"
            );
        }
        SharedEvent::SharedEntriesNotPresent { entries } => {
            for entry in entries {
                tracing::info!(
                    shared_id = entry.shared_data().shared_id(),
                    entry_type = entry.entry_type(),
                    "Entry was deleted from the shared database"
                );
            }
        }
    }
}
