// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the engine, the scheduler and the persistence backends.
//!
//! Enumerations are stored as lowercase text columns; `as_str` and `FromStr`
//! are the single mapping between the two representations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Resource type recorded on cleanup jobs and audit events for instances.
pub const RESOURCE_SERVICE_INSTANCE: &str = "service_instance";

/// Resource type recorded on audit events for cleanup jobs.
pub const RESOURCE_CLEANUP_JOB: &str = "cleanup_job";

/// Longest accepted instance ID. Drivers embed the ID in container, workload
/// and directory names, so it has to fit a DNS label once prefixed.
pub const MAX_INSTANCE_ID_LEN: usize = 48;

/// Backend a cluster is provisioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Local container group.
    Container,
    /// Container orchestrator workload.
    Orchestrator,
    /// Cloud infrastructure described as code.
    InfraAsCode,
}

impl ProviderKind {
    /// Every provider kind, in catalog order.
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Container,
        ProviderKind::Orchestrator,
        ProviderKind::InfraAsCode,
    ];

    /// Stored and wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Container => "container",
            ProviderKind::Orchestrator => "orchestrator",
            ProviderKind::InfraAsCode => "infra-as-code",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(ProviderKind::Container),
            "orchestrator" | "kubernetes" | "k8s" => Ok(ProviderKind::Orchestrator),
            "infra-as-code" | "iac" | "terraform" => Ok(ProviderKind::InfraAsCode),
            other => Err(CoreError::Validation {
                field: "provider".to_string(),
                message: format!("unknown provider '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by instances and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Work has been claimed and is running.
    InProgress,
    /// The last unit of work completed.
    Succeeded,
    /// The last unit of work failed or timed out.
    Failed,
}

impl LifecycleState {
    /// Stored and wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::InProgress => "in_progress",
            LifecycleState::Succeeded => "succeeded",
            LifecycleState::Failed => "failed",
        }
    }

    /// Whether no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LifecycleState::InProgress)
    }
}

impl FromStr for LifecycleState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(LifecycleState::InProgress),
            "succeeded" => Ok(LifecycleState::Succeeded),
            "failed" => Ok(LifecycleState::Failed),
            other => Err(CoreError::Validation {
                field: "state".to_string(),
                message: format!("unknown lifecycle state '{}'", other),
            }),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create the cluster.
    Provision,
    /// Tear the cluster down.
    Deprovision,
    /// Apply new parameters to a running cluster.
    Update,
    /// Snapshot cluster data.
    Backup,
    /// Restore cluster data from a snapshot.
    Restore,
}

impl OperationType {
    /// Stored and wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Provision => "provision",
            OperationType::Deprovision => "deprovision",
            OperationType::Update => "update",
            OperationType::Backup => "backup",
            OperationType::Restore => "restore",
        }
    }
}

impl FromStr for OperationType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(OperationType::Provision),
            "deprovision" => Ok(OperationType::Deprovision),
            "update" => Ok(OperationType::Update),
            "backup" => Ok(OperationType::Backup),
            "restore" => Ok(OperationType::Restore),
            other => Err(CoreError::Validation {
                field: "operation_type".to_string(),
                message: format!("unknown operation type '{}'", other),
            }),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation failed. Stored in the operation's `result` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider did not report completion before the deadline.
    ProviderTimeout,
    /// The provider reported an error.
    ProviderFailure,
}

impl FailureKind {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ProviderTimeout => "provider_timeout",
            FailureKind::ProviderFailure => "provider_failure",
        }
    }
}

/// State of a cleanup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupJobState {
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Picked up by the scheduler.
    Running,
    /// Teardown completed.
    Succeeded,
    /// Retries exhausted; needs manual intervention.
    Failed,
}

impl CleanupJobState {
    /// Stored and wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupJobState::Scheduled => "scheduled",
            CleanupJobState::Running => "running",
            CleanupJobState::Succeeded => "succeeded",
            CleanupJobState::Failed => "failed",
        }
    }

    /// Whether the job will not run again without manual intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CleanupJobState::Succeeded | CleanupJobState::Failed)
    }
}

impl FromStr for CleanupJobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CleanupJobState::Scheduled),
            "running" => Ok(CleanupJobState::Running),
            "succeeded" => Ok(CleanupJobState::Succeeded),
            "failed" => Ok(CleanupJobState::Failed),
            other => Err(CoreError::Validation {
                field: "state".to_string(),
                message: format!("unknown cleanup job state '{}'", other),
            }),
        }
    }
}

impl fmt::Display for CleanupJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cleanup job is reconciling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupJobType {
    /// Remove resources left behind by a failed or timed-out provision. The
    /// instance record stays live in the `failed` state.
    Rollback,
    /// Finish a deprovision that failed or timed out. Success soft-deletes the
    /// instance.
    Teardown,
}

impl CleanupJobType {
    /// Stored and wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupJobType::Rollback => "rollback",
            CleanupJobType::Teardown => "teardown",
        }
    }
}

impl FromStr for CleanupJobType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rollback" => Ok(CleanupJobType::Rollback),
            "teardown" => Ok(CleanupJobType::Teardown),
            other => Err(CoreError::Validation {
                field: "job_type".to_string(),
                message: format!("unknown cleanup job type '{}'", other),
            }),
        }
    }
}

impl fmt::Display for CleanupJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned (or provisioning) cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Caller-supplied, globally unique, immutable.
    pub instance_id: String,
    /// Catalog service the instance was created from.
    pub service_id: String,
    /// Catalog plan the instance was created from.
    pub plan_id: String,
    /// Backend the cluster lives on.
    pub provider: ProviderKind,
    /// Provider-interpreted specification.
    pub parameters: Value,
    /// Outcome of the most recent operation.
    pub state: LifecycleState,
    /// Opaque endpoints, present only while `state` is `succeeded`.
    pub connection_info: Option<Value>,
    /// When the instance was first accepted.
    pub created_at: DateTime<Utc>,
    /// Last state transition.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; `None` while live.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    /// Whether the instance has not been soft-deleted.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// One unit of asynchronous work against an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation identifier.
    pub operation_id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Kind of work.
    pub operation_type: OperationType,
    /// Progress of the work.
    pub state: LifecycleState,
    /// Parameters the operation applies (provision and update).
    pub parameters: Option<Value>,
    /// Opaque outcome document.
    pub result: Option<Value>,
    /// Diagnostic message for failed operations.
    pub error_message: Option<String>,
    /// Human-readable summary of the current state.
    pub description: Option<String>,
    /// When the operation was claimed.
    pub started_at: DateTime<Utc>,
    /// When supervision gives up on the provider.
    pub deadline_at: DateTime<Utc>,
    /// When the operation reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Failure classification recorded in `result`, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        let value = self.result.as_ref()?.get("failure")?.clone();
        serde_json::from_value(value).ok()
    }
}

/// A scheduled or retried reconciliation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupJob {
    /// Unique job identifier.
    pub job_id: String,
    /// What the job reconciles.
    pub job_type: CleanupJobType,
    /// Type of the referenced resource.
    pub resource_type: String,
    /// ID of the referenced resource (weak reference).
    pub resource_id: String,
    /// Provider that owns the resource.
    pub provider: ProviderKind,
    /// Operation whose failure created the job.
    pub operation_id: Option<String>,
    /// Why the job exists (provider_failure, provider_timeout, orphaned).
    pub reason: String,
    /// Sub-resources the provider reported as partially created.
    pub sub_resources: Vec<String>,
    /// Scheduling state.
    pub state: CleanupJobState,
    /// Failed attempts so far; never exceeds `max_retries`.
    pub retry_count: i32,
    /// Retry budget.
    pub max_retries: i32,
    /// Last teardown error.
    pub last_error: Option<String>,
    /// Earliest time the next attempt may run.
    pub scheduled_at: DateTime<Utc>,
    /// When the current or last attempt started.
    pub executed_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

/// Fields needed to enqueue a cleanup job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCleanupJob {
    /// Unique job identifier.
    pub job_id: String,
    /// What the job reconciles.
    pub job_type: CleanupJobType,
    /// Instance the job targets.
    pub resource_id: String,
    /// Provider that owns the resource.
    pub provider: ProviderKind,
    /// Operation whose failure created the job.
    pub operation_id: Option<String>,
    /// Why the job exists.
    pub reason: String,
    /// Sub-resources the provider reported as partially created.
    pub sub_resources: Vec<String>,
    /// Retry budget.
    pub max_retries: i32,
    /// Earliest time the first attempt may run.
    pub scheduled_at: DateTime<Utc>,
}

impl NewCleanupJob {
    /// Create a job for an instance with a fresh ID.
    pub fn for_instance(
        job_type: CleanupJobType,
        instance_id: &str,
        provider: ProviderKind,
        reason: impl Into<String>,
        max_retries: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type,
            resource_id: instance_id.to_string(),
            provider,
            operation_id: None,
            reason: reason.into(),
            sub_resources: Vec::new(),
            max_retries,
            scheduled_at,
        }
    }

    /// Link the job to the operation that triggered it.
    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    /// Scope the job to the reported sub-resources.
    pub fn with_sub_resources(mut self, sub_resources: Vec<String>) -> Self {
        self.sub_resources = sub_resources;
        self
    }
}

/// A live instance whose latest operation is a failed deprovision with no
/// cleanup job recorded against it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanCandidate {
    /// The instance.
    pub instance_id: String,
    /// Provider that owns it.
    pub provider: ProviderKind,
    /// The failed deprovision operation.
    pub operation_id: String,
}

/// Lifecycle event emitted to the audit sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event family (operation, cleanup_job).
    pub event_type: String,
    /// Type of the resource the event is about.
    pub resource_type: String,
    /// ID of the resource the event is about.
    pub resource_id: String,
    /// What was attempted.
    pub action: String,
    /// How it ended.
    pub result: String,
    /// Elapsed time of the transition, when measured.
    pub duration_ms: Option<i64>,
    /// Extra context.
    pub details: Option<Value>,
    /// When the event was emitted.
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Only instances on this provider.
    pub provider: Option<ProviderKind>,
    /// Only instances in this state.
    pub state: Option<LifecycleState>,
    /// Include soft-deleted instances.
    pub include_deleted: bool,
    /// Maximum rows to return.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

/// Check an instance ID before it reaches any backend.
///
/// Accepts ASCII alphanumerics, `-` and `_`, starting with an alphanumeric.
pub fn validate_instance_id(instance_id: &str) -> Result<(), CoreError> {
    let invalid = |message: &str| CoreError::Validation {
        field: "instance_id".to_string(),
        message: message.to_string(),
    };

    if instance_id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if instance_id.len() > MAX_INSTANCE_ID_LEN {
        return Err(invalid("is too long"));
    }
    if !instance_id
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
    {
        return Err(invalid("must start with a letter or digit"));
    }
    if !instance_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("may only contain letters, digits, '-' and '_'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_aliases() {
        assert_eq!(
            "docker".parse::<ProviderKind>().unwrap(),
            ProviderKind::Container
        );
        assert_eq!(
            "kubernetes".parse::<ProviderKind>().unwrap(),
            ProviderKind::Orchestrator
        );
        assert_eq!(
            "Terraform".parse::<ProviderKind>().unwrap(),
            ProviderKind::InfraAsCode
        );
        assert!("mainframe".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_provider_kind_round_trips_through_serde() {
        let json = serde_json::to_string(&ProviderKind::InfraAsCode).unwrap();
        assert_eq!(json, "\"infra-as-code\"");
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_failure_kind_read_from_result() {
        let now = Utc::now();
        let op = Operation {
            operation_id: "op-1".to_string(),
            instance_id: "c1".to_string(),
            operation_type: OperationType::Provision,
            state: LifecycleState::Failed,
            parameters: None,
            result: Some(serde_json::json!({ "failure": "provider_timeout" })),
            error_message: Some("timed out".to_string()),
            description: None,
            started_at: now,
            deadline_at: now,
            completed_at: Some(now),
        };
        assert_eq!(op.failure_kind(), Some(FailureKind::ProviderTimeout));
    }

    #[test]
    fn test_validate_instance_id() {
        assert!(validate_instance_id("c1").is_ok());
        assert!(validate_instance_id("orders-cluster_02").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("-leading").is_err());
        assert!(validate_instance_id("../etc").is_err());
        assert!(validate_instance_id("has space").is_err());
        assert!(validate_instance_id(&"a".repeat(MAX_INSTANCE_ID_LEN + 1)).is_err());
    }
}
