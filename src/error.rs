//! Custom error types for cadence.
//!
//! This module provides structured error types that separate the
//! configuration, persistence, and loop-execution failure classes so
//! callers can react to each appropriately.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cadence operations
#[derive(Error, Debug)]
pub enum CadenceError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Invalid termination-condition parameters, rejected at registration
    #[error("Invalid termination condition '{name}': {reason}")]
    InvalidCondition { name: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// State snapshot read/write failed
    #[error("Persistence error for loop '{loop_id}': {message}")]
    Persistence { loop_id: String, message: String },

    /// Transaction commit failed; no partial state was written
    #[error("Transaction {transaction_id} failed for loop '{loop_id}': {message}")]
    Transaction {
        loop_id: String,
        transaction_id: String,
        message: String,
    },

    /// Storage directory could not be created or opened
    #[error("Storage error: {path}")]
    Storage { path: PathBuf },

    // =========================================================================
    // Loop Execution Errors
    // =========================================================================
    /// Loop lifecycle operation failed
    #[error("Loop '{loop_id}' error: {message}")]
    Loop { loop_id: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CadenceError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a condition-validation error
    pub fn invalid_condition(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCondition {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(loop_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            loop_id: loop_id.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(
        loop_id: impl Into<String>,
        transaction_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transaction {
            loop_id: loop_id.into(),
            transaction_id: transaction_id.into(),
            message: message.into(),
        }
    }

    /// Create a loop error
    pub fn loop_error(loop_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Loop {
            loop_id: loop_id.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error was raised before any state was touched
    /// (configuration and condition parameters are validated at registration time)
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::InvalidCondition { .. }
        )
    }

    /// Check if this error came from the storage layer
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Persistence { .. } | Self::Transaction { .. } | Self::Storage { .. }
        )
    }
}

/// Type alias for cadence results
pub type Result<T> = std::result::Result<T, CadenceError>;
