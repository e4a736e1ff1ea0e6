//! Error types and result handling for cdc-dispatch.
//!
//! [`Error`] covers everything that can stop the consumer or reject its
//! setup. Per-row and per-change failures have their own types,
//! [`ConversionError`] and [`DispatchError`], because they travel inside
//! batch outcomes rather than through `?`.
//!
//! # Example
//!
//! ```rust
//! use cdc_dispatch::{Error, Result};
//!
//! fn check_batch_size(size: usize) -> Result<()> {
//!     if size == 0 {
//!         return Err(Error::Config("batch_size must be positive".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_batch_size(0).is_err());
//! ```

use thiserror::Error;

use crate::message::{MutationKind, RowSnapshot};

/// The main error type for cdc-dispatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Kafka client or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON decoding error on an incoming message.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message was well-formed JSON but does not describe a valid change.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The broker pull failed; the consumer retries after a backoff.
    #[error("Pull error: {message}")]
    Pull {
        /// Description of the pull failure
        message: String,
    },

    /// Listener registration was rejected.
    #[error("Registration error: {message}")]
    Registration {
        /// Description of the conflict
        message: String,
    },

    /// The consume loop did not stop within its grace period.
    #[error("Timeout: {message}")]
    Timeout {
        /// What timed out
        message: String,
    },

    /// The consume loop task panicked or was cancelled.
    #[error("Consumer error: {message}")]
    Consumer {
        /// Description of the task failure
        message: String,
    },
}

/// A convenient Result type alias for cdc-dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A column value that could not be coerced into its target field.
///
/// Conversion errors are local to one row: the remaining columns are still
/// converted and the field keeps its default value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot convert column '{column}' value {value:?}: {reason}")]
pub struct ConversionError {
    pub column: String,
    pub value: String,
    pub reason: String,
}

/// A change that failed while being handled.
///
/// Carries the change's table, kind and the raw snapshots so the failure can
/// be diagnosed from logs alone.
#[derive(Error, Debug)]
#[error("failed to handle {kind} on {schema}.{table}: {source}")]
pub struct DispatchError {
    pub schema: String,
    pub table: String,
    pub kind: MutationKind,
    pub rows: Vec<RowSnapshot>,
    #[source]
    pub source: anyhow::Error,
}
