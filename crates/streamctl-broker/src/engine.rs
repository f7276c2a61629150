// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle engine.
//!
//! Every entry point claims an operation through the [`OperationTracker`] and
//! returns as soon as the claim commits. Provider work is dispatched to a
//! supervisor task per operation:
//!
//! ```text
//!   provision / update / deprovision
//!       │ resolve driver, check parameters
//!       │ claim (single transaction)        ──► NotFound / Conflict / OperationInProgress
//!       ▼
//!   supervisor task ── driver task (bounded by deadline_at)
//!       │
//!       ▼
//!   complete: succeeded, or failed + cleanup job (one transaction)
//! ```
//!
//! Operations found `in_progress` without a local supervisor (after a restart)
//! are re-attached: provisions and updates to a status probe loop, deprovisions
//! to a fresh idempotent teardown. Supervision is bounded by the persisted
//! deadline, and the cleanup scheduler expires anything that outlives it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use streamctl_core::{
    ClaimOutcome, CleanupJobType, FailureKind, InstanceFilter, LifecycleState, NewCleanupJob,
    NewOperation, Operation, OperationCompletion, OperationTracker, OperationType, ProviderKind,
    ProvisionRequest, ServiceInstance,
};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditSink, operation_event};
use crate::error::{Error, Result};
use crate::metrics::{OperationMetrics, Outcome};
use crate::provider::{
    ClusterSpec, ConnectionInfo, ProbeStatus, ProviderCadence, ProviderDriver, ProvisionSpec,
    ResourceRef,
};
use crate::registry::ProviderRegistry;
use crate::supervisor::{Supervised, remaining_until, run_until_deadline};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the status probe made while answering `last_operation`.
    pub probe_timeout: Duration,
    /// Retry budget of cleanup jobs enqueued on failure.
    pub cleanup_max_retries: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            cleanup_max_retries: 5,
        }
    }
}

/// Returned by the entry points once the claim has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationHandle {
    pub operation_id: String,
    pub instance_id: String,
    pub operation_type: OperationType,
    pub state: LifecycleState,
    /// True when an identical request was answered without new work.
    pub replayed: bool,
}

impl OperationHandle {
    fn new(operation: &Operation, replayed: bool) -> Self {
        Self {
            operation_id: operation.operation_id.clone(),
            instance_id: operation.instance_id.clone(),
            operation_type: operation.operation_type,
            state: operation.state,
            replayed,
        }
    }
}

/// Answer to `last_operation`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStatus {
    pub operation: Operation,
    /// Endpoints of the instance, present only while it is `succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<Value>,
    /// What a fresh provider probe reported, when one was made and did not
    /// settle the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
}

/// An instance with its operation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceDetails {
    pub instance: ServiceInstance,
    pub operations: Vec<Operation>,
}

/// Work handed to a driver.
#[derive(Debug, Clone)]
enum ProviderWork {
    Provision(ProvisionSpec),
    Update(ProvisionSpec),
    Deprovision(ResourceRef),
}

/// Terminal result of supervised work, before it is written.
#[derive(Debug)]
enum Finish {
    Succeeded(Option<ConnectionInfo>),
    Failed {
        message: String,
        partial: Vec<String>,
    },
    TimedOut,
}

struct EngineInner {
    tracker: OperationTracker,
    registry: Arc<ProviderRegistry>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<OperationMetrics>,
    config: EngineConfig,
    /// Local supervisor per in-flight operation, keyed by operation ID.
    supervisors: DashMap<String, AbortHandle>,
}

/// Lifecycle engine. Cheap to clone; clones share supervisors.
#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<EngineInner>,
}

fn deadline_after(now: DateTime<Utc>, cadence: ProviderCadence) -> DateTime<Utc> {
    let budget =
        chrono::Duration::from_std(cadence.max_duration).unwrap_or(chrono::Duration::hours(24));
    now + budget
}

/// The cluster an operation converges to, from its recorded parameters.
fn expected_cluster(operation: &Operation) -> Option<ClusterSpec> {
    match operation.operation_type {
        OperationType::Provision | OperationType::Update => operation
            .parameters
            .as_ref()
            .and_then(|p| ClusterSpec::from_parameters(p).ok()),
        _ => None,
    }
}

/// Whole seconds when the budget has no fractional part, milliseconds otherwise.
fn format_budget(budget: Duration) -> String {
    if budget.subsec_millis() == 0 && budget.as_secs() > 0 {
        format!("{}s", budget.as_secs())
    } else {
        format!("{}ms", budget.as_millis())
    }
}

impl LifecycleEngine {
    /// Create an engine.
    pub fn new(
        tracker: OperationTracker,
        registry: Arc<ProviderRegistry>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<OperationMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tracker,
                registry,
                audit,
                metrics,
                config,
                supervisors: DashMap::new(),
            }),
        }
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.inner.tracker
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Arc<OperationMetrics> {
        &self.inner.metrics
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.inner.audit
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of operations supervised by this process.
    pub fn active_supervisors(&self) -> usize {
        self.inner.supervisors.len()
    }

    /// Whether this process supervises `operation_id`.
    pub fn is_supervised(&self, operation_id: &str) -> bool {
        self.inner.supervisors.contains_key(operation_id)
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Provision a new instance, or replay an identical successful request.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<OperationHandle> {
        let provider = request.provider;
        let driver = self.inner.registry.resolve(provider)?;
        let cluster = driver
            .check_parameters(&request.parameters)
            .map_err(|e| Error::provider(provider, e))?;

        let now = Utc::now();
        let new_op = NewOperation::new(
            OperationType::Provision,
            now,
            deadline_after(now, driver.cadence()),
        )
        .with_parameters(request.parameters.clone());

        match self.inner.tracker.claim_provision(&request, &new_op).await? {
            ClaimOutcome::Existing(operation) => {
                info!(
                    instance_id = %request.instance_id,
                    operation_id = %operation.operation_id,
                    "Identical provision request replayed"
                );
                self.record(provider, &operation, Outcome::Replayed, None);
                Ok(OperationHandle::new(&operation, true))
            }
            ClaimOutcome::Accepted(operation) => {
                info!(
                    instance_id = %request.instance_id,
                    operation_id = %operation.operation_id,
                    provider = %provider,
                    brokers = cluster.cluster_size,
                    "Provision accepted"
                );
                self.record(provider, &operation, Outcome::Accepted, None);
                let handle = OperationHandle::new(&operation, false);
                let spec = ProvisionSpec {
                    instance_id: request.instance_id,
                    plan_id: request.plan_id,
                    cluster,
                };
                self.dispatch(driver, provider, operation, ProviderWork::Provision(spec));
                Ok(handle)
            }
        }
    }

    /// Apply new parameters to a live instance.
    pub async fn update(&self, instance_id: &str, parameters: Value) -> Result<OperationHandle> {
        let instance = self.live_instance(instance_id).await?;
        let provider = instance.provider;
        let driver = self.inner.registry.resolve(provider)?;
        let cluster = driver
            .check_parameters(&parameters)
            .map_err(|e| Error::provider(provider, e))?;

        let now = Utc::now();
        let new_op = NewOperation::new(
            OperationType::Update,
            now,
            deadline_after(now, driver.cadence()),
        )
        .with_parameters(parameters.clone());

        match self
            .inner
            .tracker
            .claim_update(instance_id, &parameters, &new_op)
            .await?
        {
            ClaimOutcome::Existing(operation) => {
                info!(instance_id = %instance_id, "Update with unchanged parameters replayed");
                self.record(provider, &operation, Outcome::Replayed, None);
                Ok(OperationHandle::new(&operation, true))
            }
            ClaimOutcome::Accepted(operation) => {
                info!(
                    instance_id = %instance_id,
                    operation_id = %operation.operation_id,
                    provider = %provider,
                    "Update accepted"
                );
                self.record(provider, &operation, Outcome::Accepted, None);
                let handle = OperationHandle::new(&operation, false);
                let spec = ProvisionSpec {
                    instance_id: instance_id.to_string(),
                    plan_id: instance.plan_id,
                    cluster,
                };
                self.dispatch(driver, provider, operation, ProviderWork::Update(spec));
                Ok(handle)
            }
        }
    }

    /// Tear down a live instance.
    pub async fn deprovision(&self, instance_id: &str) -> Result<OperationHandle> {
        let instance = self.live_instance(instance_id).await?;
        let provider = instance.provider;
        let driver = self.inner.registry.resolve(provider)?;

        let now = Utc::now();
        let new_op = NewOperation::new(
            OperationType::Deprovision,
            now,
            deadline_after(now, driver.cadence()),
        );

        match self
            .inner
            .tracker
            .claim_deprovision(instance_id, &new_op)
            .await?
        {
            ClaimOutcome::Existing(operation) => {
                self.record(provider, &operation, Outcome::Replayed, None);
                Ok(OperationHandle::new(&operation, true))
            }
            ClaimOutcome::Accepted(operation) => {
                info!(
                    instance_id = %instance_id,
                    operation_id = %operation.operation_id,
                    provider = %provider,
                    "Deprovision accepted"
                );
                self.record(provider, &operation, Outcome::Accepted, None);
                let handle = OperationHandle::new(&operation, false);
                let target = ResourceRef::instance(instance_id);
                self.dispatch(driver, provider, operation, ProviderWork::Deprovision(target));
                Ok(handle)
            }
        }
    }

    /// Latest operation of an instance.
    ///
    /// An in-progress provision or update is refreshed from a provider probe
    /// first, bounded by the configured probe timeout. A ready probe completes
    /// the operation; any other answer leaves it to its supervisor.
    pub async fn last_operation(&self, instance_id: &str) -> Result<OperationStatus> {
        let mut operation = self
            .inner
            .tracker
            .last_operation(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;

        let mut probe = None;
        if operation.state == LifecycleState::InProgress
            && matches!(
                operation.operation_type,
                OperationType::Provision | OperationType::Update
            )
        {
            match self.refresh(&operation).await {
                Ok(Some(refreshed)) => operation = refreshed,
                Ok(None) => {}
                Err(note) => probe = Some(note),
            }
        }

        let connection_info = if operation.state == LifecycleState::Succeeded {
            self.inner
                .tracker
                .instance(instance_id)
                .await?
                .filter(|i| i.state == LifecycleState::Succeeded)
                .and_then(|i| i.connection_info)
        } else {
            None
        };

        Ok(OperationStatus {
            operation,
            connection_info,
            probe,
        })
    }

    /// An instance, live or soft-deleted, with its operations.
    pub async fn instance(&self, instance_id: &str) -> Result<InstanceDetails> {
        let instance = self
            .inner
            .tracker
            .instance(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;
        let operations = self.inner.tracker.operations(instance_id).await?;
        Ok(InstanceDetails {
            instance,
            operations,
        })
    }

    /// Instances matching `filter`.
    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .inner
            .tracker
            .persistence()
            .list_instances(filter)
            .await?)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Resume supervision of in-progress operations this process does not
    /// supervise. Returns how many were re-attached.
    pub async fn reattach_in_flight(&self, limit: i64) -> Result<usize> {
        let mut reattached = 0;

        for operation in self.inner.tracker.in_flight(limit).await? {
            if self.is_supervised(&operation.operation_id) {
                continue;
            }
            let Some(instance) = self.inner.tracker.instance(&operation.instance_id).await? else {
                continue;
            };
            let provider = instance.provider;
            let driver = match self.inner.registry.resolve(provider) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(
                        operation_id = %operation.operation_id,
                        error = %e,
                        "Cannot re-attach operation, it will expire at its deadline"
                    );
                    continue;
                }
            };

            match operation.operation_type {
                OperationType::Provision | OperationType::Update => {
                    if !driver.supports_status_probe() {
                        debug!(
                            operation_id = %operation.operation_id,
                            "Provider has no status probe, operation left to expire"
                        );
                        continue;
                    }
                    let engine = self.clone();
                    let operation_id = operation.operation_id.clone();
                    self.spawn_supervisor(operation_id, async move {
                        engine.watch_until_settled(driver, provider, operation).await;
                    });
                }
                OperationType::Deprovision => {
                    let target = ResourceRef::instance(&operation.instance_id);
                    self.dispatch(driver, provider, operation, ProviderWork::Deprovision(target));
                }
                OperationType::Backup | OperationType::Restore => continue,
            }

            reattached += 1;
        }

        if reattached > 0 {
            info!(count = reattached, "Re-attached in-flight operations");
        }
        Ok(reattached)
    }

    /// Fail in-progress operations whose deadline has passed, enqueueing their
    /// cleanup. Returns how many were expired.
    pub async fn expire_overdue(&self, now: DateTime<Utc>, limit: i64) -> Result<usize> {
        let mut expired = 0;

        for operation in self.inner.tracker.overdue(now, limit).await? {
            let Some(instance) = self.inner.tracker.instance(&operation.instance_id).await? else {
                continue;
            };
            let elapsed = (now - operation.started_at).to_std().unwrap_or_default();
            if self
                .finish(instance.provider, &operation, Finish::TimedOut, elapsed)
                .await
            {
                expired += 1;
            }
            self.abort_supervisor(&operation.operation_id);
        }

        Ok(expired)
    }

    /// Abort every local supervisor. Persisted operations stay in progress and
    /// are re-attached by the next process.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .supervisors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.abort_supervisor(id);
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Aborted operation supervisors");
        }
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    async fn live_instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.inner
            .tracker
            .instance(instance_id)
            .await?
            .filter(ServiceInstance::is_live)
            .ok_or_else(|| Error::NotFound(instance_id.to_string()))
    }

    /// Spawn `supervision`, registered under `operation_id` before it starts.
    fn spawn_supervisor<F>(&self, operation_id: String, supervision: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let engine = self.clone();
        let key = operation_id.clone();

        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            supervision.await;
            engine.inner.supervisors.remove(&key);
        });

        self.inner
            .supervisors
            .insert(operation_id, task.abort_handle());
        let _ = registered_tx.send(());
    }

    fn abort_supervisor(&self, operation_id: &str) {
        if let Some((_, handle)) = self.inner.supervisors.remove(operation_id) {
            handle.abort();
        }
    }

    fn dispatch(
        &self,
        driver: Arc<dyn ProviderDriver>,
        provider: ProviderKind,
        operation: Operation,
        work: ProviderWork,
    ) {
        let engine = self.clone();
        let operation_id = operation.operation_id.clone();
        self.spawn_supervisor(operation_id, async move {
            engine.supervise(driver, provider, operation, work).await;
        });
    }

    async fn supervise(
        &self,
        driver: Arc<dyn ProviderDriver>,
        provider: ProviderKind,
        operation: Operation,
        work: ProviderWork,
    ) {
        let started = Instant::now();
        let remaining = remaining_until(operation.deadline_at, Utc::now());
        debug!(
            operation_id = %operation.operation_id,
            remaining_secs = remaining.as_secs(),
            "Supervising provider work"
        );

        let task = tokio::spawn(async move {
            match work {
                ProviderWork::Provision(spec) => driver.provision(&spec).await.map(Some),
                ProviderWork::Update(spec) => driver.update(&spec).await.map(Some),
                ProviderWork::Deprovision(target) => driver.deprovision(&target).await.map(|()| None),
            }
        });

        let finish = match run_until_deadline(task, remaining).await {
            Supervised::Completed(Ok(info)) => Finish::Succeeded(info),
            Supervised::Completed(Err(e)) => Finish::Failed {
                message: e.to_string(),
                partial: e.partial_resources().to_vec(),
            },
            Supervised::TimedOut => Finish::TimedOut,
            Supervised::Panicked(message) => Finish::Failed {
                message,
                partial: Vec::new(),
            },
        };

        self.finish(provider, &operation, finish, started.elapsed())
            .await;
    }

    /// Probe loop for a re-attached provision or update.
    async fn watch_until_settled(
        &self,
        driver: Arc<dyn ProviderDriver>,
        provider: ProviderKind,
        operation: Operation,
    ) {
        let started = Instant::now();
        let target = ResourceRef::instance(&operation.instance_id)
            .with_expected(expected_cluster(&operation));
        let poll_interval = driver.cadence().poll_interval;

        loop {
            let remaining = remaining_until(operation.deadline_at, Utc::now());
            if remaining.is_zero() {
                self.finish(provider, &operation, Finish::TimedOut, started.elapsed())
                    .await;
                return;
            }

            let probe = tokio::time::timeout(
                self.inner.config.probe_timeout.min(remaining),
                driver.probe_status(&target),
            )
            .await;
            match probe {
                Ok(Ok(ProbeStatus::Ready(info))) => {
                    self.finish(provider, &operation, Finish::Succeeded(info), started.elapsed())
                        .await;
                    return;
                }
                Ok(Ok(ProbeStatus::Failed(message))) => {
                    let finish = Finish::Failed {
                        message,
                        partial: Vec::new(),
                    };
                    self.finish(provider, &operation, finish, started.elapsed())
                        .await;
                    return;
                }
                Ok(Ok(ProbeStatus::Pending)) => {}
                Ok(Err(e)) => {
                    warn!(operation_id = %operation.operation_id, error = %e, "Status probe failed");
                }
                Err(_) => {
                    warn!(operation_id = %operation.operation_id, "Status probe timed out");
                }
            }

            let remaining = remaining_until(operation.deadline_at, Utc::now());
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Probe an in-progress operation on behalf of `last_operation`.
    ///
    /// `Ok(Some)` is the operation completed by a ready probe, `Ok(None)`
    /// means no probe applies, `Err` carries a note about what the probe saw.
    async fn refresh(&self, operation: &Operation) -> std::result::Result<Option<Operation>, String> {
        let instance = match self.inner.tracker.instance(&operation.instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return Ok(None),
            Err(e) => return Err(format!("status probe skipped: {}", e)),
        };
        let provider = instance.provider;
        let driver = match self.inner.registry.resolve(provider) {
            Ok(driver) => driver,
            Err(e) => return Err(e.to_string()),
        };
        if !driver.supports_status_probe() {
            return Ok(None);
        }

        let target = ResourceRef::instance(&operation.instance_id)
            .with_expected(expected_cluster(operation));
        let probe =
            tokio::time::timeout(self.inner.config.probe_timeout, driver.probe_status(&target))
                .await;

        match probe {
            Ok(Ok(ProbeStatus::Ready(info))) => {
                let elapsed = (Utc::now() - operation.started_at)
                    .to_std()
                    .unwrap_or_default();
                self.finish(provider, operation, Finish::Succeeded(info), elapsed)
                    .await;
                self.abort_supervisor(&operation.operation_id);
                match self.inner.tracker.persistence().get_operation(&operation.operation_id).await {
                    Ok(refreshed) => Ok(refreshed),
                    Err(e) => Err(format!("status refresh failed: {}", e)),
                }
            }
            Ok(Ok(ProbeStatus::Pending)) => {
                Err("provider reports resources are still converging".to_string())
            }
            Ok(Ok(ProbeStatus::Failed(message))) => Err(format!("provider reports: {}", message)),
            Ok(Err(e)) => Err(format!("status probe failed: {}", e)),
            Err(_) => Err(format!(
                "status probe timed out after {}s",
                self.inner.config.probe_timeout.as_secs()
            )),
        }
    }

    /// Cleanup job enqueued with a failed operation.
    ///
    /// Provision and deprovision jobs cover the reported partial resources,
    /// or the whole instance when none were reported. An update never tears
    /// the instance down: its rollback covers the reported partial resources,
    /// or else what the update could have added, and is skipped when that is
    /// nothing.
    async fn cleanup_for(
        &self,
        provider: ProviderKind,
        operation: &Operation,
        kind: FailureKind,
        partial: Vec<String>,
    ) -> Option<NewCleanupJob> {
        let (job_type, sub_resources) = match operation.operation_type {
            OperationType::Provision => (CleanupJobType::Rollback, partial),
            OperationType::Deprovision => (CleanupJobType::Teardown, partial),
            OperationType::Update => {
                let scope = if partial.is_empty() {
                    self.update_footprint(provider, operation).await
                } else {
                    partial
                };
                if scope.is_empty() {
                    info!(
                        instance_id = %operation.instance_id,
                        operation_id = %operation.operation_id,
                        "Update added no removable resources, no rollback scheduled"
                    );
                    return None;
                }
                (CleanupJobType::Rollback, scope)
            }
            OperationType::Backup | OperationType::Restore => return None,
        };
        Some(
            NewCleanupJob::for_instance(
                job_type,
                &operation.instance_id,
                provider,
                kind.as_str(),
                self.inner.config.cleanup_max_retries,
                Utc::now(),
            )
            .with_operation(&operation.operation_id)
            .with_sub_resources(sub_resources),
        )
    }

    /// Sub-resources an unfinished update may have added, measured against
    /// the parameters the instance still carries.
    async fn update_footprint(&self, provider: ProviderKind, operation: &Operation) -> Vec<String> {
        let Some(next) = expected_cluster(operation) else {
            return Vec::new();
        };
        let previous = match self.inner.tracker.instance(&operation.instance_id).await {
            Ok(Some(instance)) => match ClusterSpec::from_parameters(&instance.parameters) {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(instance_id = %operation.instance_id, error = %e, "Stored parameters no longer parse");
                    return Vec::new();
                }
            },
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(instance_id = %operation.instance_id, error = %e, "Could not load instance for rollback scope");
                return Vec::new();
            }
        };
        match self.inner.registry.resolve(provider) {
            Ok(driver) => driver.update_footprint(&operation.instance_id, &previous, &next),
            Err(_) => Vec::new(),
        }
    }

    /// Write the terminal state of `operation`. Returns false when another
    /// writer completed it first.
    async fn finish(
        &self,
        provider: ProviderKind,
        operation: &Operation,
        finish: Finish,
        elapsed: Duration,
    ) -> bool {
        let op_type = operation.operation_type;
        let (completion, outcome) = match finish {
            Finish::Succeeded(info) => (
                OperationCompletion::succeeded(
                    &operation.operation_id,
                    format!("{} succeeded", op_type),
                    info.as_ref().map(ConnectionInfo::to_value),
                ),
                Outcome::Succeeded,
            ),
            Finish::Failed { message, partial } => {
                let description = format!("{} failed on {}: {}", op_type, provider, message);
                let mut completion = OperationCompletion::failed(
                    &operation.operation_id,
                    FailureKind::ProviderFailure,
                    message,
                    description,
                );
                if let Some(job) = self
                    .cleanup_for(provider, operation, FailureKind::ProviderFailure, partial)
                    .await
                {
                    completion = completion.with_cleanup(job);
                }
                (completion, Outcome::Failed)
            }
            Finish::TimedOut => {
                let budget = (operation.deadline_at - operation.started_at)
                    .to_std()
                    .unwrap_or_default();
                let mut completion = OperationCompletion::failed(
                    &operation.operation_id,
                    FailureKind::ProviderTimeout,
                    format!(
                        "{} provider did not complete within {}",
                        provider,
                        format_budget(budget)
                    ),
                    format!("{} timed out", op_type),
                );
                if let Some(job) = self
                    .cleanup_for(provider, operation, FailureKind::ProviderTimeout, Vec::new())
                    .await
                {
                    completion = completion.with_cleanup(job);
                }
                (completion, Outcome::TimedOut)
            }
        };

        let cleanup_job = completion.cleanup.as_ref().map(|job| job.job_id.clone());
        match self.inner.tracker.complete(&completion).await {
            Ok(Some(done)) => {
                match outcome {
                    Outcome::Succeeded => info!(
                        instance_id = %done.instance_id,
                        operation_id = %done.operation_id,
                        provider = %provider,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "{} succeeded", op_type
                    ),
                    _ => warn!(
                        instance_id = %done.instance_id,
                        operation_id = %done.operation_id,
                        provider = %provider,
                        error = done.error_message.as_deref().unwrap_or_default(),
                        cleanup_job = cleanup_job.as_deref().unwrap_or("none"),
                        "{} {}", op_type, outcome.as_str()
                    ),
                }
                let details = cleanup_job.map(|job_id| json!({ "cleanup_job": job_id }));
                self.record(provider, &done, outcome, Some((elapsed, details)));
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(
                    operation_id = %operation.operation_id,
                    error = %e,
                    "Failed to record operation completion, it will expire at its deadline"
                );
                false
            }
        }
    }

    /// Emit the audit event and metric for a transition.
    fn record(
        &self,
        provider: ProviderKind,
        operation: &Operation,
        outcome: Outcome,
        measured: Option<(Duration, Option<Value>)>,
    ) {
        self.inner
            .metrics
            .record(provider, operation.operation_type, outcome);
        let (duration_ms, details) = match measured {
            Some((elapsed, details)) => (Some(elapsed.as_millis() as i64), details),
            None => (None, Some(json!({ "provider": provider.as_str() }))),
        };
        self.inner.audit.emit(operation_event(
            operation,
            outcome.as_str(),
            duration_ms,
            details,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(op_type: OperationType, parameters: Option<Value>) -> Operation {
        let now = Utc::now();
        Operation {
            operation_id: "op-1".to_string(),
            instance_id: "c1".to_string(),
            operation_type: op_type,
            state: LifecycleState::InProgress,
            parameters,
            result: None,
            error_message: None,
            description: None,
            started_at: now,
            deadline_at: now + chrono::Duration::seconds(30),
            completed_at: None,
        }
    }

    #[test]
    fn test_expected_cluster_from_parameters() {
        let op = operation(OperationType::Update, Some(json!({"cluster_size": 3})));
        assert_eq!(expected_cluster(&op).unwrap().cluster_size, 3);

        let op = operation(OperationType::Deprovision, None);
        assert!(expected_cluster(&op).is_none());
    }

    #[test]
    fn test_deadline_after_uses_cadence() {
        let now = Utc::now();
        let cadence = ProviderCadence {
            max_duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        };
        assert_eq!((deadline_after(now, cadence) - now).num_seconds(), 300);
    }

    #[test]
    fn test_budget_formatting_keeps_sub_second_precision() {
        assert_eq!(format_budget(Duration::from_secs(300)), "300s");
        assert_eq!(format_budget(Duration::from_millis(200)), "200ms");
        assert_eq!(format_budget(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_budget(Duration::ZERO), "0ms");
    }
}
