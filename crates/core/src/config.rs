//! Configuration types shared across crates.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Relational backends a shared database can live in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "oracle")]
    Oracle,
    /// Single-file backend for local testing and small setups.
    #[serde(rename = "sqlite")]
    Sqlite,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 4] = [
        Self::MySql,
        Self::PostgreSql,
        Self::Oracle,
        Self::Sqlite,
    ];

    /// Lowercase name used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }

    /// Driver identifier (the URL scheme understood by the driver).
    pub fn driver(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgres",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }

    /// URL template with `{host}`, `{port}` and `{database}` placeholders.
    pub fn url_template(&self) -> &'static str {
        match self {
            Self::MySql => "mysql://{host}:{port}/{database}",
            Self::PostgreSql => "postgres://{host}:{port}/{database}",
            // Oracle easy-connect string.
            Self::Oracle => "//{host}:{port}/{database}",
            Self::Sqlite => "sqlite://{database}",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::MySql => Some(3306),
            Self::PostgreSql => Some(5432),
            Self::Oracle => Some(1521),
            Self::Sqlite => None,
        }
    }

    /// Whether the backend can push change notifications to other clients.
    /// Backends without a push channel rely on periodic pulls.
    pub fn supports_live_update(&self) -> bool {
        matches!(self, Self::PostgreSql | Self::Oracle)
    }

    pub fn format_url(&self, host: &str, port: u16, database: &str) -> String {
        self.url_template()
            .replace("{host}", host)
            .replace("{port}", &port.to_string())
            .replace("{database}", database)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "mysql" => Ok(Self::MySql),
            "postgresql" | "postgres" => Ok(Self::PostgreSql),
            "oracle" => Ok(Self::Oracle),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(Error::UnknownDatabaseType(s.to_string())),
        }
    }
}

/// How to reach a shared database. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionProperties {
    database_type: DatabaseType,
    host: String,
    port: u16,
    database: String,
    user: String,
    password: String,
    use_ssl: bool,
    ssl_root_cert: Option<PathBuf>,
    server_timezone: Option<String>,
    url: Option<String>,
    expert_mode: bool,
}

impl ConnectionProperties {
    pub fn builder(database_type: DatabaseType) -> ConnectionPropertiesBuilder {
        ConnectionPropertiesBuilder::new(database_type)
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    pub fn ssl_root_cert(&self) -> Option<&PathBuf> {
        self.ssl_root_cert.as_ref()
    }

    pub fn server_timezone(&self) -> Option<&str> {
        self.server_timezone.as_deref()
    }

    pub fn expert_mode(&self) -> bool {
        self.expert_mode
    }

    /// The raw URL override, honored only in expert mode.
    pub fn raw_url(&self) -> Option<&str> {
        if self.expert_mode {
            self.url.as_deref()
        } else {
            None
        }
    }

    /// Connection URL without credentials.
    pub fn url(&self) -> String {
        match self.raw_url() {
            Some(url) => url.to_string(),
            None => self
                .database_type
                .format_url(&self.host, self.port, &self.database),
        }
    }

    /// Check the validity invariant: host, database and user are set and the
    /// port is positive. SQLite only needs the database path.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(Error::InvalidConnectionProperties(reason.to_string()));

        if self.database.trim().is_empty() {
            return invalid("database must not be empty");
        }
        if self.database_type == DatabaseType::Sqlite {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.port == 0 {
            return invalid("port must be greater than 0");
        }
        if self.user.trim().is_empty() {
            return invalid("user must not be empty");
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("database_type", &self.database_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("use_ssl", &self.use_ssl)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .field("server_timezone", &self.server_timezone)
            .field("url", &self.url)
            .field("expert_mode", &self.expert_mode)
            .finish()
    }
}

/// Builder for [`ConnectionProperties`].
#[derive(Clone, Debug)]
pub struct ConnectionPropertiesBuilder {
    database_type: DatabaseType,
    host: String,
    port: Option<u16>,
    database: String,
    user: String,
    password: Option<String>,
    use_ssl: bool,
    ssl_root_cert: Option<PathBuf>,
    server_timezone: Option<String>,
    url: Option<String>,
    expert_mode: bool,
}

impl ConnectionPropertiesBuilder {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            host: String::new(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: None,
            use_ssl: false,
            ssl_root_cert: None,
            server_timezone: None,
            url: None,
            expert_mode: false,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn ssl_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_root_cert = Some(path.into());
        self
    }

    pub fn server_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.server_timezone = Some(timezone.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn expert_mode(mut self, expert_mode: bool) -> Self {
        self.expert_mode = expert_mode;
        self
    }

    /// Build and validate. Network backends require a password to be set,
    /// even an empty one.
    pub fn build(self) -> Result<ConnectionProperties> {
        let password = match (self.password, self.database_type) {
            (Some(password), _) => password,
            (None, DatabaseType::Sqlite) => String::new(),
            (None, _) => {
                return Err(Error::InvalidConnectionProperties(
                    "password must be set".to_string(),
                ));
            }
        };

        let properties = ConnectionProperties {
            port: self
                .port
                .or(self.database_type.default_port())
                .unwrap_or_default(),
            database_type: self.database_type,
            host: self.host,
            database: self.database,
            user: self.user,
            password,
            use_ssl: self.use_ssl,
            ssl_root_cert: self.ssl_root_cert,
            server_timezone: self.server_timezone,
            url: self.url,
            expert_mode: self.expert_mode,
        };
        properties.validate()?;
        Ok(properties)
    }
}

/// Shared database section of the configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedDatabaseConfig {
    /// Backend type: mysql, postgresql, oracle or sqlite.
    #[serde(rename = "type")]
    pub database_type: DatabaseType,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to the backend's well-known port.
    pub port: Option<u16>,
    /// Database name, or the file path for SQLite.
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    /// WARNING: Prefer BIBSYNC_DATABASE__PASSWORD over storing it in the file.
    pub password: Option<String>,
    #[serde(default)]
    pub use_ssl: bool,
    /// PEM root certificate used to verify the server when `use_ssl` is set.
    pub ssl_root_cert: Option<PathBuf>,
    /// Session time zone (MySQL only).
    pub server_timezone: Option<String>,
    /// Raw connection URL, only used in expert mode.
    pub url: Option<String>,
    #[serde(default)]
    pub expert_mode: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl SharedDatabaseConfig {
    pub fn to_properties(&self) -> Result<ConnectionProperties> {
        let mut builder = ConnectionProperties::builder(self.database_type)
            .host(self.host.clone())
            .database(self.database.clone())
            .user(self.user.clone())
            .use_ssl(self.use_ssl)
            .expert_mode(self.expert_mode);
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(password) = &self.password {
            builder = builder.password(password.clone());
        }
        if let Some(path) = &self.ssl_root_cert {
            builder = builder.ssl_root_cert(path.clone());
        }
        if let Some(timezone) = &self.server_timezone {
            builder = builder.server_timezone(timezone.clone());
        }
        if let Some(url) = &self.url {
            builder = builder.url(url.clone());
        }
        builder.build()
    }
}

/// Synchronizer tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval of the periodic pull for backends without a push channel.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive field edits of one entry within this window are pushed
    /// once. Zero pushes every edit.
    #[serde(default = "default_edit_coalesce_ms")]
    pub edit_coalesce_ms: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_edit_coalesce_ms() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            edit_coalesce_ms: default_edit_coalesce_ms(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        // A zero interval would spin the pull loop.
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn edit_coalesce_window(&self) -> Duration {
        Duration::from_millis(self.edit_coalesce_ms)
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: SharedDatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}
