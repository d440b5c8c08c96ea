//! Error types for each component, following the teacher's one-enum-per-concern style.

use thiserror::Error;

/// Errors from loading or parsing on-disk configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("zone '{0}' has no entry in config.json")]
    UnknownZone(String),
}

/// Errors from the durable cache/log store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by a `RemoteStore` implementation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// Errors from GPIO setup (fatal at startup per spec).
#[derive(Debug, Error)]
pub enum GpioError {
    #[error("failed to claim GPIO line {line}: {reason}")]
    Claim { line: u8, reason: String },
}

/// Top-level startup error; any of these is fatal (process exits 1).
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gpio(#[from] GpioError),
}
