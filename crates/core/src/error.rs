//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid connection properties: {0}")]
    InvalidConnectionProperties(String),

    #[error("unknown database type: {0}")]
    UnknownDatabaseType(String),

    #[error("unknown field formatter: {0}")]
    UnknownFormatter(String),

    #[error("malformed save actions: {0}")]
    MalformedSaveActions(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
