//! Shared SQL database synchronization for bibsync.
//!
//! This crate lets several clients work on one bibliography stored in a
//! relational database:
//! - Connection establishment per vendor
//! - The `SharedProcessor` trait and its MySQL, PostgreSQL, Oracle and SQLite adapters
//! - Schema setup, integrity checks and legacy migration
//! - Live-update notifications between clients
//! - The `Synchronizer`, which maps local events to the shared tables and back

pub mod connection;
pub mod dialect;
pub mod error;
pub mod event;
pub mod models;
pub mod mysql;
pub mod notifications;
#[cfg(feature = "oracle")]
pub mod oracle;
pub mod postgres;
pub mod processor;
pub mod schema;
pub mod sqlite;
mod sql_ops;
pub mod synchronizer;

pub use connection::{ConnectionPool, DatabaseConnection};
pub use dialect::Dialect;
pub use error::{OfflineLockConflict, SharedError, SharedResult};
pub use event::SharedEvent;
pub use mysql::MySqlProcessor;
#[cfg(feature = "oracle")]
pub use self::oracle::OracleProcessor;
pub use postgres::PostgresProcessor;
pub use processor::{RemoteChangeHandler, SharedProcessor};
pub use sqlite::SqliteProcessor;
pub use synchronizer::Synchronizer;

use bibsync_core::ConnectionProperties;
use std::sync::Arc;

/// Wrap an open connection in the processor for its vendor.
pub fn from_connection(connection: DatabaseConnection) -> Arc<dyn SharedProcessor> {
    let (properties, pool) = connection.into_parts();
    match pool {
        ConnectionPool::MySql(pool) => Arc::new(MySqlProcessor::new(pool, properties)),
        ConnectionPool::Postgres(pool) => Arc::new(PostgresProcessor::new(pool, properties)),
        ConnectionPool::Sqlite(pool) => Arc::new(SqliteProcessor::new(pool, properties)),
        #[cfg(feature = "oracle")]
        ConnectionPool::Oracle(connection) => Arc::new(OracleProcessor::new(connection, properties)),
    }
}

/// Connect and create the matching processor.
pub async fn connect(properties: ConnectionProperties) -> SharedResult<Arc<dyn SharedProcessor>> {
    let connection = DatabaseConnection::connect(properties).await?;
    Ok(from_connection(connection))
}
