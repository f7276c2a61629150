// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for streamctl-broker.
//!
//! Claim rejections surface synchronously from the engine entry points.
//! Provider-side failures and timeouts are recorded on the operation and are
//! only observable through `last_operation`; the variants exist here for the
//! request paths that talk to a driver directly (status probes, validation).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use streamctl_core::{CoreError, ProviderKind};
use thiserror::Error;

use crate::provider::ProviderError;

/// Broker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No live instance with this ID exists.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// No cleanup job with this ID exists.
    #[error("Cleanup job not found: {0}")]
    JobNotFound(String),

    /// The request conflicts with the existing instance.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Another operation holds the instance.
    #[error("Operation in progress: {0}")]
    OperationInProgress(String),

    /// The registry has no usable driver for the provider.
    #[error("Provider '{provider}' unavailable: {message}")]
    ProviderUnavailable {
        /// Requested provider.
        provider: ProviderKind,
        /// Why it cannot be used.
        message: String,
    },

    /// A provider call exceeded its deadline.
    #[error("Provider '{provider}' timed out: {message}")]
    ProviderTimeout {
        /// Provider that timed out.
        provider: ProviderKind,
        /// Which step timed out.
        message: String,
    },

    /// A provider call failed.
    #[error("Provider '{provider}' failed: {source}")]
    ProviderFailure {
        /// Provider that failed.
        provider: ProviderKind,
        /// Driver error.
        #[source]
        source: ProviderError,
    },

    /// The store is unreachable or rejected a statement.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Cluster parameters failed provider validation.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using broker Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a driver error reported for `provider`.
    pub fn provider(provider: ProviderKind, err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidParameters(message) => Error::InvalidParameters(message),
            ProviderError::Unavailable(message) => Error::ProviderUnavailable { provider, message },
            err @ ProviderError::StepTimeout { .. } => Error::ProviderTimeout {
                provider,
                message: err.to_string(),
            },
            source => Error::ProviderFailure { provider, source },
        }
    }

    /// OSB-style error identifier returned in the `error` field.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) | Error::JobNotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::OperationInProgress(_) => "ConcurrencyError",
            Error::ProviderUnavailable { .. } => "ProviderUnavailable",
            Error::ProviderTimeout { .. } => "ProviderTimeout",
            Error::ProviderFailure { .. } => "ProviderFailure",
            Error::PersistenceFailure(_) => "PersistenceFailure",
            Error::InvalidParameters(_) => "InvalidParameters",
            Error::InvalidRequest(_) => "BadRequest",
            Error::Config(_) | Error::Io(_) => "InternalError",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) | Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::OperationInProgress(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidParameters(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::ProviderFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::PersistenceFailure(_) | Error::Config(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { instance_id } => Error::NotFound(instance_id),
            err @ CoreError::Conflict { .. } => Error::Conflict(err.to_string()),
            err @ (CoreError::OperationInProgress { .. } | CoreError::ClaimRace { .. }) => {
                Error::OperationInProgress(err.to_string())
            }
            CoreError::Validation { field, message } => {
                Error::InvalidRequest(format!("{}: {}", field, message))
            }
            other => Error::PersistenceFailure(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(json!({
                "error": self.error_code(),
                "description": self.to_string(),
            })),
        )
            .into_response()
    }
}
