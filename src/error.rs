//! Error types for the audit relay
//!
//! This module defines the crate-wide error enum used throughout the
//! application, using `thiserror` for ergonomic error handling. Transport
//! layers (`sink`, `source`) keep their own small error enums and convert
//! into these variants at the job boundary.

use thiserror::Error;

/// Main error type for relay operations
///
/// This enum encompasses all process-fatal failures: configuration
/// problems, storage corruption, and delivery exhaustion. Failures that
/// are confined to a single session task are logged and dropped by the
/// session job instead of surfacing here.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored start time differs from the one supplied on this run
    #[error(
        "start time drift: storage was initialized with start time {stored} but {requested} was \
         requested; wipe the storage directory to re-ingest from a different start time"
    )]
    StartTimeDrift {
        /// Start time persisted on the first run
        stored: String,
        /// Start time supplied for this run
        requested: String,
    },

    /// State store errors (sled operations, value decoding)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Main-stream source errors that terminate the process
    #[error("Source error: {0}")]
    Source(String),

    /// Sink delivery failure after retries were exhausted
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal runtime error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
