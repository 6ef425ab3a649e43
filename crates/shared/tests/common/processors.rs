//! Shared processor test utilities.

use bibsync_core::{ConnectionProperties, DatabaseType};
use bibsync_shared::{
    ConnectionPool, DatabaseConnection, SharedError, SharedProcessor, SharedResult,
    SqliteProcessor,
};
use sqlx::postgres::PgPool;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::mysql::Mysql;
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// Same marker for the MySQL container.
pub const MYSQL_CONTAINER_START_ERR_PREFIX: &str = "mysql-container-start:";

/// A SQLite-backed shared database in a temp directory, cleaned up on drop.
#[allow(dead_code)]
pub struct TestProcessor {
    pub processor: Arc<dyn SharedProcessor>,
    pub(crate) sqlite_processor: Arc<SqliteProcessor>,
    properties: ConnectionProperties,
    _temp_dir: TempDir,
}

impl TestProcessor {
    /// Create an empty shared database without tables.
    pub async fn new() -> SharedResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("shared.db");
        let properties = ConnectionProperties::builder(DatabaseType::Sqlite)
            .database(db_path.to_string_lossy())
            .build()?;

        let sqlite_processor = Arc::new(open_sqlite(properties.clone()).await?);
        Ok(Self {
            processor: sqlite_processor.clone(),
            sqlite_processor,
            properties,
            _temp_dir: temp_dir,
        })
    }

    /// Create a shared database with the current tables in place.
    pub async fn set_up() -> SharedResult<Self> {
        let test = Self::new().await?;
        test.processor.setup_shared_database().await?;
        Ok(test)
    }

    pub fn processor(&self) -> Arc<dyn SharedProcessor> {
        self.processor.clone()
    }

    /// Open another processor on the same file, as a second client would.
    #[allow(dead_code)]
    pub async fn second_client(&self) -> SharedResult<Arc<dyn SharedProcessor>> {
        Ok(Arc::new(open_sqlite(self.properties.clone()).await?))
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_processor.pool()
    }
}

async fn open_sqlite(properties: ConnectionProperties) -> SharedResult<SqliteProcessor> {
    let (properties, pool) = DatabaseConnection::connect(properties).await?.into_parts();
    match pool {
        ConnectionPool::Sqlite(pool) => Ok(SqliteProcessor::new(pool, properties)),
        _ => Err(SharedError::Internal("expected a sqlite pool".to_string())),
    }
}

/// PostgreSQL shared database in a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestProcessor {
    pub processor: Arc<dyn SharedProcessor>,
    pub properties: ConnectionProperties,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestProcessor {
    /// Start a container and connect. Tables are not created.
    pub async fn new() -> SharedResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                SharedError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let properties = ConnectionProperties::builder(DatabaseType::PostgreSql)
            .host(host.to_string())
            .port(port)
            .database("postgres")
            .user("postgres")
            .password("postgres")
            .build()?;
        let processor = bibsync_shared::connect(properties.clone()).await?;

        Ok(Self {
            processor,
            properties,
            _container: container,
        })
    }

    pub fn processor(&self) -> Arc<dyn SharedProcessor> {
        self.processor.clone()
    }

    /// Open another client on the same container.
    #[allow(dead_code)]
    pub async fn second_client(&self) -> SharedResult<Arc<dyn SharedProcessor>> {
        bibsync_shared::connect(self.properties.clone()).await
    }

    /// A separate pool for raw statements.
    #[allow(dead_code)]
    pub async fn raw_pool(&self) -> SharedResult<PgPool> {
        let (_, pool) = DatabaseConnection::connect(self.properties.clone())
            .await?
            .into_parts();
        match pool {
            ConnectionPool::Postgres(pool) => Ok(pool),
            _ => Err(SharedError::Internal("expected a postgres pool".to_string())),
        }
    }
}

/// MySQL shared database in a testcontainer.
#[allow(dead_code)]
pub struct MySqlTestProcessor {
    pub processor: Arc<dyn SharedProcessor>,
    pub properties: ConnectionProperties,
    _container: ContainerAsync<Mysql>,
}

impl MySqlTestProcessor {
    pub async fn new() -> SharedResult<Self> {
        let container = Mysql::default()
            .with_env_var("MYSQL_USER", "jabref")
            .with_env_var("MYSQL_PASSWORD", "jabref")
            .start()
            .await
            .map_err(|e| {
                SharedError::Internal(format!(
                    "{} Failed to start MySQL container: {e}",
                    MYSQL_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(3306)
            .await
            .expect("Failed to get port");

        // The module creates the `test` database; MYSQL_USER is granted on it.
        let properties = ConnectionProperties::builder(DatabaseType::MySql)
            .host(host.to_string())
            .port(port)
            .database("test")
            .user("jabref")
            .password("jabref")
            .build()?;
        let processor = bibsync_shared::connect(properties.clone()).await?;

        Ok(Self {
            processor,
            properties,
            _container: container,
        })
    }

    pub fn processor(&self) -> Arc<dyn SharedProcessor> {
        self.processor.clone()
    }
}

/// Skip unless a PostgreSQL container can be started.
///
/// Only container-start failures (Docker unavailable) cause a skip.
/// Schema or connection errors still panic so real regressions are not
/// silently swallowed.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestProcessor> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestProcessor::new().await {
        Ok(test) => Some(test),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Skip unless a MySQL container can be started.
#[allow(dead_code)]
pub async fn mysql_or_skip() -> Option<MySqlTestProcessor> {
    if std::env::var("SKIP_MYSQL_TESTS").is_ok() {
        return None;
    }
    match MySqlTestProcessor::new().await {
        Ok(test) => Some(test),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(MYSQL_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping MySQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("MySQL test setup failed: {msg}");
            }
        }
    }
}

/// Connect to the Oracle instance named by `BIBSYNC_TEST_ORACLE_*`, or skip
/// when `BIBSYNC_TEST_ORACLE_HOST` is unset. The schema of the test user is
/// shared between runs.
#[cfg(feature = "oracle")]
#[allow(dead_code)]
pub async fn oracle_or_skip() -> Option<Arc<dyn SharedProcessor>> {
    let Ok(host) = std::env::var("BIBSYNC_TEST_ORACLE_HOST") else {
        eprintln!("Skipping Oracle test (BIBSYNC_TEST_ORACLE_HOST not set)");
        return None;
    };
    let var = |name: &str, default: &str| {
        std::env::var(format!("BIBSYNC_TEST_ORACLE_{name}")).unwrap_or_else(|_| default.to_string())
    };
    let port = var("PORT", "1521")
        .parse()
        .expect("BIBSYNC_TEST_ORACLE_PORT is a port number");
    let properties = ConnectionProperties::builder(DatabaseType::Oracle)
        .host(host)
        .port(port)
        .database(var("DATABASE", "FREEPDB1"))
        .user(var("USER", "jabref"))
        .password(var("PASSWORD", "jabref"))
        .build()
        .expect("valid Oracle test properties");
    match bibsync_shared::connect(properties).await {
        Ok(processor) => Some(processor),
        Err(err) => panic!("Oracle test setup failed: {err}"),
    }
}

/// Run a test against every backend available here. SQLite always runs;
/// the container-backed vendors run unless skipped.
#[allow(dead_code)]
pub async fn run_processor_test_all<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn SharedProcessor>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestProcessor::set_up()
        .await
        .expect("Failed to create SQLite test processor");
    test_fn.clone()(sqlite.processor()).await;

    if let Some(postgres) = postgres_or_skip().await {
        postgres
            .processor
            .setup_shared_database()
            .await
            .expect("PostgreSQL setup failed");
        test_fn.clone()(postgres.processor()).await;
    }

    if let Some(mysql) = mysql_or_skip().await {
        mysql
            .processor
            .setup_shared_database()
            .await
            .expect("MySQL setup failed");
        test_fn(mysql.processor()).await;
    }
}
