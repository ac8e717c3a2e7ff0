//! Error types for meshtrack.
//!
//! This module defines all error types used throughout the meshtrack crate,
//! covering storage, configuration, report validation and peer synchronization.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for meshtrack operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Report Errors ===
    /// A location report was malformed and was not stored.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    // === Sync Errors ===
    /// A peer could not be reached or answered with a failure status.
    #[error("network error talking to {address}: {message}")]
    Network {
        /// Address of the peer.
        address: String,
        /// Description of what went wrong.
        message: String,
    },

    /// Part of a push or pull batch was confirmed before the exchange failed.
    #[error("partial batch: {confirmed} record(s) confirmed before failure: {source}")]
    PartialBatch {
        /// Number of records confirmed before the failure.
        confirmed: usize,
        /// The failure that stopped the batch.
        #[source]
        source: Box<Error>,
    },

    /// A sync cycle is already running.
    #[error("a sync cycle is already in progress")]
    CycleInProgress,

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for meshtrack operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new network error for the given peer address.
    #[must_use]
    pub fn network(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Wrap `source` as a partial batch failure when some records were confirmed.
    ///
    /// With nothing confirmed the original error is returned unchanged.
    #[must_use]
    pub fn partial(confirmed: usize, source: Error) -> Self {
        if confirmed == 0 {
            source
        } else {
            Self::PartialBatch {
                confirmed,
                source: Box::new(source),
            }
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is a report validation failure.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if the failed operation should simply be retried next cycle.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::PartialBatch { .. }
        )
    }
}
