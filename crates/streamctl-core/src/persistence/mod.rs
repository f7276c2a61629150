//! Persistence interfaces and backends for streamctl-core.
//!
//! The store is the single source of truth for instances, operations, cleanup
//! jobs and audit events. Claims are exposed as whole transactions rather than
//! row-level primitives so that every backend establishes the one-in-flight and
//! uniqueness rules atomically.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{
    AuditEvent, CleanupJob, CleanupJobState, InstanceFilter, NewCleanupJob, Operation,
    OrphanCandidate, ServiceInstance,
};
use crate::tracker::{ClaimOutcome, NewOperation, OperationCompletion, ProvisionRequest};

pub(crate) const INSTANCE_COLUMNS: &str = "instance_id, service_id, plan_id, provider, \
     parameters, state, connection_info, created_at, updated_at, deleted_at";

pub(crate) const OPERATION_COLUMNS: &str = "operation_id, instance_id, operation_type, state, \
     parameters, result, error_message, description, started_at, deadline_at, completed_at";

pub(crate) const CLEANUP_JOB_COLUMNS: &str = "job_id, job_type, resource_type, resource_id, \
     provider, operation_id, reason, sub_resources, state, retry_count, max_retries, last_error, \
     scheduled_at, executed_at, completed_at, created_at";

pub(crate) const AUDIT_EVENT_COLUMNS: &str =
    "event_type, resource_type, resource_id, action, result, duration_ms, details, created_at";

/// Filter options for listing cleanup jobs.
#[derive(Debug, Clone, Default)]
pub struct CleanupJobFilter {
    /// Only jobs in this state.
    pub state: Option<CleanupJobState>,
    /// Only jobs targeting this resource.
    pub resource_id: Option<String>,
    /// Maximum rows to return.
    pub limit: i64,
}

/// Terminal write for a running cleanup job.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupJobFinish {
    /// Job to finish.
    pub job_id: String,
    /// `Succeeded` or `Failed`.
    pub state: CleanupJobState,
    /// Last teardown error.
    pub error: Option<String>,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// Soft-delete the targeted instance in the same transaction.
    pub soft_delete_instance: bool,
}

/// Persistence backend used by the tracker, engine and scheduler.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Check that the store answers queries.
    async fn health_check(&self) -> Result<bool, CoreError>;

    /// Atomically claim a provision operation.
    async fn claim_provision(
        &self,
        request: &ProvisionRequest,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError>;

    /// Atomically claim an update operation.
    async fn claim_update(
        &self,
        instance_id: &str,
        parameters: &Value,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError>;

    /// Atomically claim a deprovision operation.
    async fn claim_deprovision(
        &self,
        instance_id: &str,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError>;

    /// Move an in-progress operation to its terminal state, update the owning
    /// instance and enqueue the optional cleanup job, all in one transaction.
    ///
    /// Returns `None` if the operation was not in progress.
    async fn complete_operation(
        &self,
        completion: &OperationCompletion,
    ) -> Result<Option<Operation>, CoreError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>, CoreError>;

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<ServiceInstance>, CoreError>;

    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>, CoreError>;

    async fn get_last_operation(&self, instance_id: &str) -> Result<Option<Operation>, CoreError>;

    /// Operation history of an instance, oldest first.
    async fn list_operations(&self, instance_id: &str) -> Result<Vec<Operation>, CoreError>;

    async fn list_in_progress_operations(&self, limit: i64) -> Result<Vec<Operation>, CoreError>;

    /// In-progress operations with `deadline_at <= now`.
    async fn list_overdue_operations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>, CoreError>;

    /// Live instances whose latest operation is a failed deprovision that no
    /// cleanup job references yet.
    async fn find_orphan_candidates(&self, limit: i64)
    -> Result<Vec<OrphanCandidate>, CoreError>;

    /// Insert a cleanup job. Returns `false` if a job of the same type already
    /// exists for the triggering operation.
    async fn insert_cleanup_job(&self, job: &NewCleanupJob) -> Result<bool, CoreError>;

    async fn get_cleanup_job(&self, job_id: &str) -> Result<Option<CleanupJob>, CoreError>;

    async fn list_cleanup_jobs(
        &self,
        filter: &CleanupJobFilter,
    ) -> Result<Vec<CleanupJob>, CoreError>;

    /// Scheduled jobs with `scheduled_at <= now`, oldest first.
    async fn list_due_cleanup_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CleanupJob>, CoreError>;

    /// Move a scheduled job to `running`. Returns `None` if it was already taken
    /// or its instance has an operation in progress.
    async fn start_cleanup_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanupJob>, CoreError>;

    /// Put a running job back to `scheduled` after a failed attempt.
    async fn reschedule_cleanup_job(
        &self,
        job_id: &str,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, CoreError>;

    /// Move a running job to a terminal state.
    async fn finish_cleanup_job(&self, finish: &CleanupJobFinish) -> Result<bool, CoreError>;

    /// Return jobs left `running` by a previous process to `scheduled`.
    async fn requeue_running_cleanup_jobs(&self) -> Result<u64, CoreError>;

    /// Manually re-queue a permanently failed job with a fresh retry budget.
    async fn requeue_failed_cleanup_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanupJob>, CoreError>;

    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), CoreError>;

    /// Audit events for a resource, newest first.
    async fn list_audit_events(
        &self,
        resource_type: &str,
        resource_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, CoreError>;

    /// Delete terminal operations completed before `cutoff`. The latest
    /// operation of every instance is always kept.
    async fn prune_operations(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, CoreError>;

    /// Delete terminal cleanup jobs completed before `cutoff`. Permanently
    /// failed jobs are kept while their instance is still live.
    async fn prune_cleanup_jobs(&self, cutoff: DateTime<Utc>, limit: i64)
    -> Result<u64, CoreError>;

    async fn prune_audit_events(&self, cutoff: DateTime<Utc>, limit: i64)
    -> Result<u64, CoreError>;
}

/// Connect to the backend named by a database URL and run its migrations.
///
/// `sqlite:` URLs (including `sqlite::memory:`) select [`SqlitePersistence`];
/// `postgres://` and `postgresql://` select [`PostgresPersistence`].
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>, CoreError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let persistence = PostgresPersistence::connect(database_url).await?;
        return Ok(Arc::new(persistence));
    }

    if let Some(rest) = database_url.strip_prefix("sqlite:") {
        let path = rest.trim_start_matches("//");
        let path = path.split('?').next().unwrap_or_default();
        let persistence = if path.is_empty() || path == ":memory:" {
            SqlitePersistence::in_memory().await?
        } else {
            SqlitePersistence::from_path(path).await?
        };
        return Ok(Arc::new(persistence));
    }

    Err(CoreError::Validation {
        field: "database_url".to_string(),
        message: "expected a sqlite: or postgres:// URL".to_string(),
    })
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse_json(table: &'static str, column: &str, raw: &str) -> Result<Value, CoreError> {
    serde_json::from_str(raw)
        .map_err(|e| CoreError::corrupt(table, format!("{} is not valid JSON: {}", column, e)))
}

fn parse_optional_json(
    table: &'static str,
    column: &str,
    raw: Option<String>,
) -> Result<Option<Value>, CoreError> {
    raw.map(|r| parse_json(table, column, &r)).transpose()
}

fn parse_enum<T: std::str::FromStr>(table: &'static str, raw: &str) -> Result<T, CoreError> {
    raw.parse::<T>()
        .map_err(|_| CoreError::corrupt(table, format!("unexpected value '{}'", raw)))
}

pub(crate) fn to_json_text(value: &Value) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn to_optional_json_text(value: Option<&Value>) -> Result<Option<String>, CoreError> {
    value.map(to_json_text).transpose()
}

/// Instance row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct InstanceRow {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub provider: String,
    pub parameters: String,
    pub state: String,
    pub connection_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for ServiceInstance {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "service_instances";
        Ok(ServiceInstance {
            provider: parse_enum(TABLE, &row.provider)?,
            parameters: parse_json(TABLE, "parameters", &row.parameters)?,
            state: parse_enum(TABLE, &row.state)?,
            connection_info: parse_optional_json(TABLE, "connection_info", row.connection_info)?,
            instance_id: row.instance_id,
            service_id: row.service_id,
            plan_id: row.plan_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Operation row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct OperationRow {
    pub operation_id: String,
    pub instance_id: String,
    pub operation_type: String,
    pub state: String,
    pub parameters: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = CoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "operations";
        Ok(Operation {
            operation_type: parse_enum(TABLE, &row.operation_type)?,
            state: parse_enum(TABLE, &row.state)?,
            parameters: parse_optional_json(TABLE, "parameters", row.parameters)?,
            result: parse_optional_json(TABLE, "result", row.result)?,
            operation_id: row.operation_id,
            instance_id: row.instance_id,
            error_message: row.error_message,
            description: row.description,
            started_at: row.started_at,
            deadline_at: row.deadline_at,
            completed_at: row.completed_at,
        })
    }
}

/// Cleanup job row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CleanupJobRow {
    pub job_id: String,
    pub job_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub provider: String,
    pub operation_id: Option<String>,
    pub reason: String,
    pub sub_resources: String,
    pub state: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CleanupJobRow> for CleanupJob {
    type Error = CoreError;

    fn try_from(row: CleanupJobRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "cleanup_jobs";
        let sub_resources: Vec<String> = serde_json::from_str(&row.sub_resources)
            .map_err(|e| CoreError::corrupt(TABLE, format!("sub_resources: {}", e)))?;
        Ok(CleanupJob {
            job_type: parse_enum(TABLE, &row.job_type)?,
            provider: parse_enum(TABLE, &row.provider)?,
            state: parse_enum(TABLE, &row.state)?,
            sub_resources,
            job_id: row.job_id,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            operation_id: row.operation_id,
            reason: row.reason,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            executed_at: row.executed_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

/// Audit event row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AuditEventRow {
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub result: String,
    pub duration_ms: Option<i64>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = CoreError;

    fn try_from(row: AuditEventRow) -> Result<Self, Self::Error> {
        Ok(AuditEvent {
            details: parse_optional_json("audit_events", "details", row.details)?,
            event_type: row.event_type,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            action: row.action,
            result: row.result,
            duration_ms: row.duration_ms,
            created_at: row.created_at,
        })
    }
}

pub(crate) fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, CoreError>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
