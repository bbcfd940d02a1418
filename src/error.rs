//! Error types for the pulse pipeline
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for pipeline construction and startup
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Meter identity rejected
    #[error("Meter error: {0}")]
    Meter(#[from] MeterError),

    /// Ledger error outside of the retry path
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Storage never became available during startup
    #[error("Storage unavailable after {attempts} attempts: {source}")]
    StorageUnavailable {
        attempts: u32,
        #[source]
        source: LedgerError,
    },

    /// Collector could not be constructed
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),
}

/// Errors related to meter identities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeterError {
    /// Empty identity
    #[error("Meter identity is empty")]
    Empty,

    /// Identity contains a character the ledger table cannot store
    #[error("Meter identity {id:?} contains forbidden character {ch:?}")]
    ForbiddenCharacter { id: String, ch: char },

    /// Identity configured twice
    #[error("Duplicate meter identity: {0}")]
    Duplicate(String),

    /// Too many channels configured
    #[error("Maximum channels ({max}) reached")]
    MaxChannelsReached { max: usize },
}

/// Errors raised by the ledger and its medium
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Underlying medium I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Medium or coordinator currently inaccessible
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    /// Ledger content does not parse as records
    #[error("Corrupt ledger at line {line}: {reason}")]
    Corrupt { line: u64, reason: String },

    /// CSV encoding failure while writing a record
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LedgerError {
    /// Whether the error should be retried on the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable { .. })
    }

    /// Whether the ledger content itself is bad
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Errors raised by the collector transport
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Connection, DNS, or protocol failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request did not finish in time
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Payload could not be serialized
    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors in the pipeline configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No channels to monitor
    #[error("No channels configured")]
    NoChannels,

    /// Value out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Invalid meter identity in the channel list
    #[error("Invalid channel: {0}")]
    Channel(#[from] MeterError),

    /// Config file could not be read
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// Config file is not valid JSON for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
