//! Custom error types for sealed-ledger
//!
//! This module defines the error hierarchy for the library using thiserror
//! for ergonomic error definitions.

use thiserror::Error;

/// The main error type for sealed-ledger operations
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Validation errors for inputs and records
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity not found errors
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// Encryption failed; nothing may be written in plaintext after this
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Decryption failed (bad tag, malformed envelope or wrong key)
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// No session key has been derived yet
    #[error("Encryption not initialized")]
    NotInitialized,

    /// The remote store rejected or failed a call
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Local storage and cache errors
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Create a "not found" error for a record of the given kind
    pub fn not_found(entity_type: &'static str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            identifier: identifier.into(),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a decryption error (recoverable on read paths)
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }

    /// Check if this is a remote store error
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for sealed-ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
