//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading a backend configuration.
///
/// Any of these aborts the whole load; no partial configuration is produced.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON or does not match the expected shape.
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    /// A host address is not of the form `host:port`.
    #[error("invalid host address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// A host address could not be resolved to any socket address.
    #[error("failed to resolve host address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The host weights add up to more than `u64::MAX`.
    #[error("total weight overflows at host '{addr}'")]
    WeightOverflow { addr: String },
}
