// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for streamctl-core.
//!
//! Claim rejections (`NotFound`, `Conflict`, `OperationInProgress`) are decided
//! inside the claim transaction and surface to callers synchronously. Everything
//! the store itself reports is folded into `Persistence`.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the data model, claim rules and persistence backends.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No live instance with this ID exists.
    #[error("Instance '{instance_id}' not found")]
    NotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// The instance exists with a different specification, or is in a state
    /// that does not accept the request.
    #[error("Instance '{instance_id}' conflicts with the existing instance: {reason}")]
    Conflict {
        /// The conflicting instance ID.
        instance_id: String,
        /// What differs.
        reason: String,
    },

    /// Another operation (or a running cleanup) holds the instance.
    #[error("Instance '{instance_id}' is busy: {detail}")]
    OperationInProgress {
        /// The instance ID.
        instance_id: String,
        /// Which operation or job holds the instance.
        detail: String,
    },

    /// Two claims raced to create the same instance row. The tracker retries the
    /// claim once before reporting `OperationInProgress`.
    #[error("Concurrent claim detected for instance '{instance_id}'")]
    ClaimRace {
        /// The instance ID.
        instance_id: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A stored row could not be mapped back into the data model.
    #[error("Corrupt record in '{table}': {details}")]
    CorruptRecord {
        /// Table the row came from.
        table: &'static str,
        /// What could not be decoded.
        details: String,
    },

    /// The store is unreachable or rejected the statement.
    #[error("Persistence failure during '{operation}': {details}")]
    Persistence {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::OperationInProgress { .. } => "OPERATION_IN_PROGRESS",
            Self::ClaimRace { .. } => "CLAIM_RACE",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::Persistence { .. } => "PERSISTENCE_FAILURE",
        }
    }

    pub(crate) fn corrupt(table: &'static str, details: impl Into<String>) -> Self {
        Self::CorruptRecord {
            table,
            details: details.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Persistence {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::Persistence {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Persistence {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
