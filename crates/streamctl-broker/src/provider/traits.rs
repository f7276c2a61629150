// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider driver trait definitions.
//!
//! Defines the contract every backend implements and the values that cross it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use streamctl_core::ProviderKind;
use thiserror::Error;

use super::spec::ClusterSpec;

/// Errors from provider drivers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// Cluster parameters are not acceptable to this driver.
    #[error("{0}")]
    InvalidParameters(String),

    /// The backend tooling or credentials are not usable.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// A provisioning step failed.
    #[error("{step} failed: {message}")]
    StepFailed {
        /// Step that failed.
        step: String,
        /// Diagnostic message.
        message: String,
        /// Sub-resources created before the failure.
        partial: Vec<String>,
    },

    /// A provisioning step exceeded its own timeout.
    #[error("{step} timed out after {seconds}s")]
    StepTimeout {
        /// Step that timed out.
        step: String,
        /// Timeout that elapsed.
        seconds: u64,
        /// Sub-resources created before the timeout.
        partial: Vec<String>,
    },

    /// The backend answered with something the driver cannot interpret.
    #[error("Unexpected output from {step}: {message}")]
    InvalidOutput {
        /// Step whose output was rejected.
        step: String,
        /// What was wrong with it.
        message: String,
    },

    /// The driver does not implement this operation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Sub-resources the driver created before failing.
    pub fn partial_resources(&self) -> &[String] {
        match self {
            ProviderError::StepFailed { partial, .. }
            | ProviderError::StepTimeout { partial, .. } => partial,
            _ => &[],
        }
    }

    /// Attach the sub-resources created so far.
    pub fn with_partial(self, created: &[String]) -> Self {
        match self {
            ProviderError::StepFailed {
                step,
                message,
                mut partial,
            } => {
                partial.extend(created.iter().cloned());
                ProviderError::StepFailed {
                    step,
                    message,
                    partial,
                }
            }
            ProviderError::StepTimeout {
                step,
                seconds,
                mut partial,
            } => {
                partial.extend(created.iter().cloned());
                ProviderError::StepTimeout {
                    step,
                    seconds,
                    partial,
                }
            }
            ProviderError::InvalidOutput { step, message } => ProviderError::StepFailed {
                step,
                message,
                partial: created.to_vec(),
            },
            ProviderError::Io(e) => ProviderError::StepFailed {
                step: "io".to_string(),
                message: e.to_string(),
                partial: created.to_vec(),
            },
            other => other,
        }
    }

    pub(crate) fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::StepFailed {
            step: step.into(),
            message: message.into(),
            partial: Vec::new(),
        }
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Per-provider scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCadence {
    /// Deadline after which the engine fails the operation.
    pub max_duration: Duration,
    /// Interval between readiness checks.
    pub poll_interval: Duration,
}

/// Everything a driver needs to create or converge a cluster.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    /// Instance ID; drivers derive every backend name from it.
    pub instance_id: String,
    /// Catalog plan.
    pub plan_id: String,
    /// Validated cluster parameters.
    pub cluster: ClusterSpec,
}

/// Reference to the backend resources of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Owning instance.
    pub instance_id: String,
    /// Sub-resources to act on; empty means everything the instance owns.
    pub sub_resources: Vec<String>,
    /// Expected shape, when known; probes use it to tell a converging cluster
    /// from a converged one.
    pub expected: Option<ClusterSpec>,
}

impl ResourceRef {
    /// Every resource of an instance.
    pub fn instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            sub_resources: Vec::new(),
            expected: None,
        }
    }

    /// Restrict to the listed sub-resources.
    pub fn with_sub_resources(mut self, sub_resources: Vec<String>) -> Self {
        self.sub_resources = sub_resources;
        self
    }

    /// Record the expected cluster shape.
    pub fn with_expected(mut self, expected: Option<ClusterSpec>) -> Self {
        self.expected = expected;
        self
    }
}

/// Endpoints of a ready cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Broker addresses clients bootstrap from.
    pub bootstrap_servers: Vec<String>,
    /// Coordination service address.
    pub zookeeper_connect: String,
    /// Listener security protocol.
    pub security_protocol: String,
    /// Provider-specific extras.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ConnectionInfo {
    /// Plaintext endpoints.
    pub fn plaintext(bootstrap_servers: Vec<String>, zookeeper_connect: impl Into<String>) -> Self {
        Self {
            bootstrap_servers,
            zookeeper_connect: zookeeper_connect.into(),
            security_protocol: "PLAINTEXT".to_string(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a provider-specific property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Opaque document stored on the instance.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Backend view of an instance's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Resources exist but are not ready yet.
    Pending,
    /// The cluster is ready; endpoints when the driver can report them.
    Ready(Option<ConnectionInfo>),
    /// The resources are missing or broken.
    Failed(String),
}

/// Contract every provider driver implements.
///
/// Drivers are pure backend adapters: they never touch the store. They must be
/// safe to call concurrently for different instances; the engine guarantees
/// they are never called concurrently for the same instance.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Which provider this driver implements.
    fn kind(&self) -> ProviderKind;

    /// Deadline and polling interval for this backend.
    fn cadence(&self) -> ProviderCadence;

    /// Validate request parameters at the boundary.
    fn check_parameters(&self, parameters: &Value) -> Result<ClusterSpec> {
        ClusterSpec::from_parameters(parameters)
    }

    /// Whether [`probe_status`](Self::probe_status) answers from the backend.
    fn supports_status_probe(&self) -> bool {
        true
    }

    /// Create the cluster and wait until it is ready.
    async fn provision(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo>;

    /// Converge an existing cluster to new parameters.
    async fn update(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        let _ = spec;
        Err(ProviderError::Unsupported("update"))
    }

    /// Sub-resources an update from `previous` to `next` may have created.
    ///
    /// A rollback of an update that never reported back removes exactly
    /// these. Empty when the backend cannot remove part of an instance.
    fn update_footprint(
        &self,
        instance_id: &str,
        previous: &ClusterSpec,
        next: &ClusterSpec,
    ) -> Vec<String> {
        let _ = (instance_id, previous, next);
        Vec::new()
    }

    /// Remove the referenced resources. Removing resources that do not exist
    /// succeeds.
    async fn deprovision(&self, resource: &ResourceRef) -> Result<()>;

    /// Report the current backend state of an instance.
    async fn probe_status(&self, resource: &ResourceRef) -> Result<ProbeStatus>;

    /// Check that tooling and credentials are usable. Used by operator
    /// tooling, never by the request path.
    async fn validate(&self) -> Result<()>;
}
