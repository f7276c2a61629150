// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation tracker: claim rules and the one-in-flight invariant.
//!
//! A claim is decided by the `plan_*` functions in this module and executed by
//! a persistence backend inside a single transaction:
//!
//! ```text
//!   BEGIN
//!     lock instance row
//!     read instance, latest operation, active cleanup jobs
//!     plan_provision / plan_update / plan_deprovision   (pure)
//!     insert or update instance row, insert operation row
//!   COMMIT
//! ```
//!
//! The partial unique index on `operations(instance_id) WHERE state = 'in_progress'`
//! backs the rule at the storage level, so a claim that slips past the read
//! still fails on insert instead of creating a second in-flight operation.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::{
    FailureKind, LifecycleState, NewCleanupJob, Operation, OperationType, ProviderKind,
    ServiceInstance, validate_instance_id,
};
use crate::persistence::Persistence;

/// A provision request as accepted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    /// Caller-supplied instance ID.
    pub instance_id: String,
    /// Catalog service.
    pub service_id: String,
    /// Catalog plan.
    pub plan_id: String,
    /// Target backend.
    pub provider: ProviderKind,
    /// Provider-interpreted specification.
    pub parameters: Value,
}

/// The operation row a claim inserts.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Pre-generated operation ID.
    pub operation_id: String,
    /// Kind of work.
    pub operation_type: OperationType,
    /// Parameters the operation applies.
    pub parameters: Option<Value>,
    /// Claim time.
    pub started_at: DateTime<Utc>,
    /// Supervision deadline.
    pub deadline_at: DateTime<Utc>,
}

impl NewOperation {
    /// Create an operation with a fresh ID.
    pub fn new(
        operation_type: OperationType,
        started_at: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            parameters: None,
            started_at,
            deadline_at,
        }
    }

    /// Record the parameters the operation applies.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub(crate) fn into_operation(self, instance_id: &str) -> Operation {
        Operation {
            operation_id: self.operation_id,
            instance_id: instance_id.to_string(),
            operation_type: self.operation_type,
            state: LifecycleState::InProgress,
            parameters: self.parameters,
            result: None,
            error_message: None,
            description: Some(format!("{} in progress", self.operation_type)),
            started_at: self.started_at,
            deadline_at: self.deadline_at,
            completed_at: None,
        }
    }
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A new operation was claimed; provider work must be dispatched.
    Accepted(Operation),
    /// Idempotent replay of a request that already succeeded; no new work.
    Existing(Operation),
}

impl ClaimOutcome {
    /// The claimed or replayed operation.
    pub fn operation(&self) -> &Operation {
        match self {
            ClaimOutcome::Accepted(op) | ClaimOutcome::Existing(op) => op,
        }
    }

    /// Whether new provider work was claimed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, ClaimOutcome::Accepted(_))
    }
}

/// Cleanup jobs currently targeting an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupActivity {
    /// A job is waiting for its next attempt.
    pub scheduled: bool,
    /// A job is executing a teardown right now.
    pub running: bool,
}

/// How a provision claim proceeds.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionPlan {
    /// No row exists; insert it.
    Create,
    /// The ID belongs to a soft-deleted instance; reuse the row.
    Revive,
    /// The live instance failed earlier; provision it again.
    Retry,
    /// Identical request after success; hand back the existing operation.
    Replay(Operation),
}

/// How an update claim proceeds.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePlan {
    /// Claim an update operation.
    Apply,
    /// Parameters already applied; hand back the existing operation.
    Replay(Operation),
}

fn busy(instance_id: &str, detail: String) -> CoreError {
    CoreError::OperationInProgress {
        instance_id: instance_id.to_string(),
        detail,
    }
}

fn in_flight_detail(op: &Operation) -> String {
    format!(
        "{} operation {} is in progress",
        op.operation_type, op.operation_id
    )
}

/// Describe how an existing live instance differs from a provision request.
///
/// Parameters are compared with strict structural equality: key order is
/// irrelevant, but `1` and `1.0` differ and so do omitted defaults.
pub fn spec_mismatch(request: &ProvisionRequest, instance: &ServiceInstance) -> Option<String> {
    if request.service_id != instance.service_id {
        return Some("service_id differs".to_string());
    }
    if request.plan_id != instance.plan_id {
        return Some("plan_id differs".to_string());
    }
    if request.provider != instance.provider {
        return Some("provider differs".to_string());
    }
    if request.parameters != instance.parameters {
        return Some("parameters differ".to_string());
    }
    None
}

/// Decide a provision claim.
pub fn plan_provision(
    request: &ProvisionRequest,
    instance: Option<&ServiceInstance>,
    latest: Option<&Operation>,
    cleanup: CleanupActivity,
) -> Result<ProvisionPlan> {
    let id = &request.instance_id;
    let in_flight = latest.filter(|op| op.state == LifecycleState::InProgress);

    let Some(instance) = instance else {
        return Ok(ProvisionPlan::Create);
    };

    if !instance.is_live() {
        if let Some(op) = in_flight {
            return Err(busy(id, in_flight_detail(op)));
        }
        if cleanup.scheduled || cleanup.running {
            return Err(busy(id, "cleanup of previous resources is pending".to_string()));
        }
        return Ok(ProvisionPlan::Revive);
    }

    // Differing parameters conflict no matter what state the instance is in.
    if let Some(reason) = spec_mismatch(request, instance) {
        return Err(CoreError::Conflict {
            instance_id: id.clone(),
            reason,
        });
    }

    if let Some(op) = in_flight {
        return Err(busy(id, in_flight_detail(op)));
    }

    if instance.state == LifecycleState::Succeeded {
        return match latest {
            Some(op) => Ok(ProvisionPlan::Replay(op.clone())),
            None => Err(CoreError::Conflict {
                instance_id: id.clone(),
                reason: "instance has no operation history".to_string(),
            }),
        };
    }

    if cleanup.scheduled || cleanup.running {
        return Err(busy(id, "cleanup of partial resources is pending".to_string()));
    }

    Ok(ProvisionPlan::Retry)
}

/// Decide an update claim.
pub fn plan_update(
    instance_id: &str,
    parameters: &Value,
    instance: Option<&ServiceInstance>,
    latest: Option<&Operation>,
    cleanup: CleanupActivity,
) -> Result<UpdatePlan> {
    let instance = instance
        .filter(|i| i.is_live())
        .ok_or_else(|| CoreError::NotFound {
            instance_id: instance_id.to_string(),
        })?;

    if let Some(op) = latest.filter(|op| op.state == LifecycleState::InProgress) {
        return Err(busy(instance_id, in_flight_detail(op)));
    }

    if instance.state != LifecycleState::Succeeded {
        return Err(CoreError::Conflict {
            instance_id: instance_id.to_string(),
            reason: format!("instance is {} and cannot be updated", instance.state),
        });
    }

    if &instance.parameters == parameters {
        if let Some(op) = latest {
            return Ok(UpdatePlan::Replay(op.clone()));
        }
    }

    if cleanup.running {
        return Err(busy(instance_id, "a cleanup job is running".to_string()));
    }

    Ok(UpdatePlan::Apply)
}

/// Decide a deprovision claim.
pub fn plan_deprovision(
    instance_id: &str,
    instance: Option<&ServiceInstance>,
    latest: Option<&Operation>,
    cleanup: CleanupActivity,
) -> Result<()> {
    if !instance.is_some_and(|i| i.is_live()) {
        return Err(CoreError::NotFound {
            instance_id: instance_id.to_string(),
        });
    }

    if let Some(op) = latest.filter(|op| op.state == LifecycleState::InProgress) {
        return Err(busy(instance_id, in_flight_detail(op)));
    }

    if cleanup.running {
        return Err(busy(instance_id, "a cleanup job is running".to_string()));
    }

    Ok(())
}

/// Terminal write for an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCompletion {
    /// Operation to complete.
    pub operation_id: String,
    /// Terminal state.
    pub state: LifecycleState,
    /// Opaque outcome document.
    pub result: Option<Value>,
    /// Diagnostic message.
    pub error_message: Option<String>,
    /// Human-readable summary.
    pub description: String,
    /// Endpoints reported by the provider.
    pub connection_info: Option<Value>,
    /// Cleanup job enqueued atomically with the failure.
    pub cleanup: Option<NewCleanupJob>,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

impl OperationCompletion {
    /// A successful completion.
    pub fn succeeded(
        operation_id: impl Into<String>,
        description: impl Into<String>,
        connection_info: Option<Value>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            state: LifecycleState::Succeeded,
            result: None,
            error_message: None,
            description: description.into(),
            connection_info,
            cleanup: None,
            completed_at: Utc::now(),
        }
    }

    /// A failed completion.
    pub fn failed(
        operation_id: impl Into<String>,
        kind: FailureKind,
        error_message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            state: LifecycleState::Failed,
            result: Some(serde_json::json!({ "failure": kind.as_str() })),
            error_message: Some(error_message.into()),
            description: description.into(),
            connection_info: None,
            cleanup: None,
            completed_at: Utc::now(),
        }
    }

    /// Enqueue a cleanup job in the same transaction.
    pub fn with_cleanup(mut self, job: NewCleanupJob) -> Self {
        self.cleanup = Some(job);
        self
    }

    /// Override the completion time.
    pub fn at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = completed_at;
        self
    }
}

/// Instance columns written when an operation completes.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTransition {
    /// New instance state.
    pub state: LifecycleState,
    /// New connection info; `None` clears it.
    pub connection_info: Option<Value>,
    /// New parameters; `None` keeps the current ones.
    pub parameters: Option<Value>,
    /// Soft-delete time, for successful deprovisions.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Compute the instance transition for a completing operation.
pub fn transition_for(operation: &Operation, completion: &OperationCompletion) -> InstanceTransition {
    if completion.state != LifecycleState::Succeeded {
        return InstanceTransition {
            state: LifecycleState::Failed,
            connection_info: None,
            parameters: None,
            deleted_at: None,
        };
    }

    match operation.operation_type {
        OperationType::Deprovision => InstanceTransition {
            state: LifecycleState::Succeeded,
            connection_info: None,
            parameters: None,
            deleted_at: Some(completion.completed_at),
        },
        OperationType::Update => InstanceTransition {
            state: LifecycleState::Succeeded,
            connection_info: completion.connection_info.clone(),
            parameters: operation.parameters.clone(),
            deleted_at: None,
        },
        OperationType::Provision | OperationType::Backup | OperationType::Restore => {
            InstanceTransition {
                state: LifecycleState::Succeeded,
                connection_info: completion.connection_info.clone(),
                parameters: None,
                deleted_at: None,
            }
        }
    }
}

/// Creates, completes and queries operations on top of a persistence backend.
#[derive(Clone)]
pub struct OperationTracker {
    persistence: Arc<dyn Persistence>,
}

impl OperationTracker {
    /// Create a tracker over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// The underlying persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Claim a provision operation.
    pub async fn claim_provision(
        &self,
        request: &ProvisionRequest,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome> {
        validate_instance_id(&request.instance_id)?;
        retry_on_race(&request.instance_id, move || {
            self.persistence.claim_provision(request, operation)
        })
        .await
    }

    /// Claim an update operation.
    pub async fn claim_update(
        &self,
        instance_id: &str,
        parameters: &Value,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome> {
        validate_instance_id(instance_id)?;
        retry_on_race(instance_id, move || {
            self.persistence
                .claim_update(instance_id, parameters, operation)
        })
        .await
    }

    /// Claim a deprovision operation.
    pub async fn claim_deprovision(
        &self,
        instance_id: &str,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome> {
        validate_instance_id(instance_id)?;
        retry_on_race(instance_id, move || {
            self.persistence.claim_deprovision(instance_id, operation)
        })
        .await
    }

    /// Write a terminal state. Returns `None` when the operation had already
    /// reached a terminal state (first writer wins).
    pub async fn complete(&self, completion: &OperationCompletion) -> Result<Option<Operation>> {
        let completed = self.persistence.complete_operation(completion).await?;
        if completed.is_none() {
            debug!(
                operation_id = %completion.operation_id,
                "Operation already terminal, completion ignored"
            );
        }
        Ok(completed)
    }

    /// Look up an instance, live or soft-deleted.
    pub async fn instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>> {
        self.persistence.get_instance(instance_id).await
    }

    /// Latest operation of an instance by `started_at`.
    pub async fn last_operation(&self, instance_id: &str) -> Result<Option<Operation>> {
        self.persistence.get_last_operation(instance_id).await
    }

    /// Operation history of an instance, oldest first.
    pub async fn operations(&self, instance_id: &str) -> Result<Vec<Operation>> {
        self.persistence.list_operations(instance_id).await
    }

    /// Operations still in progress.
    pub async fn in_flight(&self, limit: i64) -> Result<Vec<Operation>> {
        self.persistence.list_in_progress_operations(limit).await
    }

    /// In-progress operations whose deadline has passed.
    pub async fn overdue(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Operation>> {
        self.persistence.list_overdue_operations(now, limit).await
    }
}

async fn retry_on_race<F, Fut>(instance_id: &str, mut claim: F) -> Result<ClaimOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ClaimOutcome>>,
{
    match claim().await {
        Err(CoreError::ClaimRace { .. }) => {
            debug!(instance_id = %instance_id, "Claim raced, re-evaluating");
            match claim().await {
                Err(CoreError::ClaimRace { .. }) => Err(busy(
                    instance_id,
                    "a concurrent request is being claimed".to_string(),
                )),
                other => other,
            }
        }
        other => other,
    }
}
