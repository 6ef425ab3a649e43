//! Opening connections to a shared database.

use crate::error::SharedResult;
use bibsync_core::{ConnectionProperties, DatabaseType};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Applied once, as the time allowed to establish a connection.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_CONNECTIONS: u32 = 5;

/// The vendor handle behind a [`DatabaseConnection`].
pub enum ConnectionPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
    #[cfg(feature = "oracle")]
    Oracle(crate::oracle::OracleConnection),
}

/// A live connection together with the properties it was opened from.
pub struct DatabaseConnection {
    properties: ConnectionProperties,
    pool: ConnectionPool,
}

impl DatabaseConnection {
    /// Validate the properties and connect. Invalid properties are rejected
    /// before any network traffic.
    pub async fn connect(properties: ConnectionProperties) -> SharedResult<Self> {
        properties.validate()?;

        tracing::info!(
            database_type = %properties.database_type(),
            host = properties.host(),
            port = properties.port(),
            database = properties.database(),
            user = properties.user(),
            use_ssl = properties.use_ssl(),
            expert_mode = properties.expert_mode(),
            "Connecting to shared database"
        );

        let pool = match Self::open_pool(&properties).await {
            Ok(pool) => pool,
            Err(e) => {
                let code = e.database_code();
                tracing::error!(
                    database_type = %properties.database_type(),
                    code = code.as_deref().unwrap_or("<none>"),
                    error = %e,
                    "Could not connect to shared database"
                );
                return Err(e);
            }
        };

        Ok(Self { properties, pool })
    }

    async fn open_pool(properties: &ConnectionProperties) -> SharedResult<ConnectionPool> {
        match properties.database_type() {
            DatabaseType::MySql => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .acquire_timeout(LOGIN_TIMEOUT)
                    .connect_with(mysql_options(properties)?)
                    .await?;
                Ok(ConnectionPool::MySql(pool))
            }
            DatabaseType::PostgreSql => {
                let pool = PgPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .acquire_timeout(LOGIN_TIMEOUT)
                    .connect_with(postgres_options(properties)?)
                    .await?;
                Ok(ConnectionPool::Postgres(pool))
            }
            DatabaseType::Sqlite => {
                // A single connection that never expires: writers serialize on
                // it, and an in-memory database lives exactly as long as it.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .acquire_timeout(LOGIN_TIMEOUT)
                    .connect_with(sqlite_options(properties)?)
                    .await?;
                Ok(ConnectionPool::Sqlite(pool))
            }
            #[cfg(feature = "oracle")]
            DatabaseType::Oracle => Ok(ConnectionPool::Oracle(
                crate::oracle::connect(properties, LOGIN_TIMEOUT).await?,
            )),
            #[cfg(not(feature = "oracle"))]
            DatabaseType::Oracle => Err(crate::error::SharedError::Internal(
                "Oracle support is not enabled in this build (feature `oracle`)".to_string(),
            )),
        }
    }

    pub fn properties(&self) -> &ConnectionProperties {
        &self.properties
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn into_parts(self) -> (ConnectionProperties, ConnectionPool) {
        (self.properties, self.pool)
    }
}

fn mysql_options(properties: &ConnectionProperties) -> SharedResult<MySqlConnectOptions> {
    let mut opts = match properties.raw_url() {
        Some(url) => MySqlConnectOptions::from_str(url)?,
        None => MySqlConnectOptions::new()
            .host(properties.host())
            .port(properties.port())
            .database(properties.database()),
    };
    if !properties.user().is_empty() {
        opts = opts.username(properties.user());
    }
    if !properties.password().is_empty() {
        opts = opts.password(properties.password());
    }

    opts = match (properties.use_ssl(), properties.ssl_root_cert()) {
        (false, _) => opts.ssl_mode(MySqlSslMode::Disabled),
        (true, None) => opts.ssl_mode(MySqlSslMode::Required),
        (true, Some(cert)) => opts.ssl_mode(MySqlSslMode::VerifyCa).ssl_ca(cert),
    };
    if let Some(timezone) = properties.server_timezone() {
        opts = opts.timezone(Some(timezone.to_string()));
    }
    Ok(opts)
}

fn postgres_options(properties: &ConnectionProperties) -> SharedResult<PgConnectOptions> {
    let mut opts = match properties.raw_url() {
        Some(url) => PgConnectOptions::from_str(url)?,
        None => PgConnectOptions::new()
            .host(properties.host())
            .port(properties.port())
            .database(properties.database()),
    };
    if !properties.user().is_empty() {
        opts = opts.username(properties.user());
    }
    if !properties.password().is_empty() {
        opts = opts.password(properties.password());
    }

    opts = match (properties.use_ssl(), properties.ssl_root_cert()) {
        (false, _) => opts.ssl_mode(PgSslMode::Disable),
        (true, None) => opts.ssl_mode(PgSslMode::Require),
        (true, Some(cert)) => opts.ssl_mode(PgSslMode::VerifyFull).ssl_root_cert(cert),
    };
    Ok(opts)
}

fn sqlite_options(properties: &ConnectionProperties) -> SharedResult<SqliteConnectOptions> {
    let opts = match (properties.raw_url(), properties.database()) {
        (Some(url), _) => SqliteConnectOptions::from_str(url)?,
        (None, ":memory:") => SqliteConnectOptions::from_str("sqlite::memory:")?,
        (None, path) => SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true),
    };
    Ok(opts
        .foreign_keys(true)
        // Prevent transient "database is locked" errors when several clients share a file.
        .busy_timeout(Duration::from_secs(5)))
}
