//! SQLite-backed persistence implementation.
//!
//! SQLite has no row locks, so every claim transaction opens with a no-op
//! `UPDATE` on the instance row. Any write statement takes the database write
//! lock, which serializes concurrent claims for the duration of the transaction.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::error::CoreError;
use crate::migrations::SQLITE as MIGRATOR;
use crate::model::{
    AuditEvent, CleanupJob, CleanupJobState, InstanceFilter, NewCleanupJob, Operation,
    OrphanCandidate, RESOURCE_SERVICE_INSTANCE, ServiceInstance,
};
use crate::tracker::{
    self, ClaimOutcome, CleanupActivity, NewOperation, OperationCompletion, ProvisionPlan,
    ProvisionRequest, UpdatePlan,
};

use super::{
    AUDIT_EVENT_COLUMNS, AuditEventRow, CLEANUP_JOB_COLUMNS, CleanupJobFilter, CleanupJobFinish,
    CleanupJobRow, INSTANCE_COLUMNS, InstanceRow, OPERATION_COLUMNS, OperationRow, Persistence,
    collect, is_unique_violation, to_json_text, to_optional_json_text,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/streamctl.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Persistence {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Persistence {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a migrated in-memory database.
    ///
    /// The pool holds a single connection that never expires, since each
    /// in-memory connection is a separate database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn fetch_instance<'e, E>(
    executor: E,
    instance_id: &str,
) -> Result<Option<ServiceInstance>, CoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM service_instances WHERE instance_id = ?"
    ))
    .bind(instance_id)
    .fetch_optional(executor)
    .await?;

    row.map(ServiceInstance::try_from).transpose()
}

async fn fetch_last_operation<'e, E>(
    executor: E,
    instance_id: &str,
) -> Result<Option<Operation>, CoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        r#"
        SELECT {OPERATION_COLUMNS} FROM operations
        WHERE instance_id = ?
        ORDER BY started_at DESC, operation_id DESC
        LIMIT 1
        "#
    ))
    .bind(instance_id)
    .fetch_optional(executor)
    .await?;

    row.map(Operation::try_from).transpose()
}

async fn fetch_cleanup_activity(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<CleanupActivity, CoreError> {
    let states: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT state FROM cleanup_jobs
        WHERE resource_type = ? AND resource_id = ? AND state IN ('scheduled', 'running')
        "#,
    )
    .bind(RESOURCE_SERVICE_INSTANCE)
    .bind(instance_id)
    .fetch_all(conn)
    .await?;

    Ok(CleanupActivity {
        scheduled: states.iter().any(|(s,)| s == "scheduled"),
        running: states.iter().any(|(s,)| s == "running"),
    })
}

/// Close the outstanding cleanup jobs of an instance whose resources were
/// torn down in full. Nothing is left for them to remove.
async fn retire_cleanup_jobs(
    conn: &mut SqliteConnection,
    instance_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE cleanup_jobs
        SET state = 'succeeded', completed_at = ?
        WHERE resource_type = ? AND resource_id = ? AND state IN ('scheduled', 'failed')
        "#,
    )
    .bind(now)
    .bind(RESOURCE_SERVICE_INSTANCE)
    .bind(instance_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Take the database write lock before reading claim state.
async fn lock_instance(conn: &mut SqliteConnection, instance_id: &str) -> Result<(), CoreError> {
    sqlx::query("UPDATE service_instances SET updated_at = updated_at WHERE instance_id = ?")
        .bind(instance_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn mark_in_progress(
    conn: &mut SqliteConnection,
    instance_id: &str,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE service_instances
        SET state = 'in_progress', connection_info = NULL, updated_at = ?
        WHERE instance_id = ?
        "#,
    )
    .bind(now)
    .bind(instance_id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_operation(
    conn: &mut SqliteConnection,
    instance_id: &str,
    operation: &NewOperation,
) -> Result<(), CoreError> {
    let parameters = to_optional_json_text(operation.parameters.as_ref())?;
    let description = format!("{} in progress", operation.operation_type);

    sqlx::query(
        r#"
        INSERT INTO operations (operation_id, instance_id, operation_type, state, parameters,
                                description, started_at, deadline_at)
        VALUES (?, ?, ?, 'in_progress', ?, ?, ?, ?)
        "#,
    )
    .bind(&operation.operation_id)
    .bind(instance_id)
    .bind(operation.operation_type.as_str())
    .bind(parameters)
    .bind(description)
    .bind(operation.started_at)
    .bind(operation.deadline_at)
    .execute(conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CoreError::OperationInProgress {
                instance_id: instance_id.to_string(),
                detail: "another operation was claimed concurrently".to_string(),
            }
        } else {
            e.into()
        }
    })?;

    Ok(())
}

async fn insert_cleanup_job_with<'e, E>(executor: E, job: &NewCleanupJob) -> Result<bool, CoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sub_resources = serde_json::to_string(&job.sub_resources)?;

    let result = sqlx::query(
        r#"
        INSERT INTO cleanup_jobs (job_id, job_type, resource_type, resource_id, provider,
                                  operation_id, reason, sub_resources, state, retry_count,
                                  max_retries, scheduled_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'scheduled', 0, ?, ?, ?)
        ON CONFLICT (operation_id, job_type) DO NOTHING
        "#,
    )
    .bind(&job.job_id)
    .bind(job.job_type.as_str())
    .bind(RESOURCE_SERVICE_INSTANCE)
    .bind(&job.resource_id)
    .bind(job.provider.as_str())
    .bind(&job.operation_id)
    .bind(&job.reason)
    .bind(sub_resources)
    .bind(job.max_retries)
    .bind(job.scheduled_at)
    .bind(Utc::now())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn health_check(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }

    async fn claim_provision(
        &self,
        request: &ProvisionRequest,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError> {
        let id = request.instance_id.as_str();
        let mut tx = self.pool.begin().await?;

        lock_instance(&mut tx, id).await?;
        let instance = fetch_instance(&mut *tx, id).await?;
        let latest = fetch_last_operation(&mut *tx, id).await?;
        let cleanup = fetch_cleanup_activity(&mut tx, id).await?;

        let plan = tracker::plan_provision(request, instance.as_ref(), latest.as_ref(), cleanup)?;
        let parameters = to_json_text(&request.parameters)?;
        let now = operation.started_at;

        match plan {
            ProvisionPlan::Replay(existing) => {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Existing(existing));
            }
            ProvisionPlan::Create => {
                sqlx::query(
                    r#"
                    INSERT INTO service_instances (instance_id, service_id, plan_id, provider,
                                                   parameters, state, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, 'in_progress', ?, ?)
                    "#,
                )
                .bind(id)
                .bind(&request.service_id)
                .bind(&request.plan_id)
                .bind(request.provider.as_str())
                .bind(&parameters)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        CoreError::ClaimRace {
                            instance_id: id.to_string(),
                        }
                    } else {
                        e.into()
                    }
                })?;
            }
            ProvisionPlan::Revive | ProvisionPlan::Retry => {
                sqlx::query(
                    r#"
                    UPDATE service_instances
                    SET service_id = ?, plan_id = ?, provider = ?, parameters = ?,
                        state = 'in_progress', connection_info = NULL, updated_at = ?,
                        deleted_at = NULL
                    WHERE instance_id = ?
                    "#,
                )
                .bind(&request.service_id)
                .bind(&request.plan_id)
                .bind(request.provider.as_str())
                .bind(&parameters)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        insert_operation(&mut tx, id, operation).await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Accepted(operation.clone().into_operation(id)))
    }

    async fn claim_update(
        &self,
        instance_id: &str,
        parameters: &Value,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        lock_instance(&mut tx, instance_id).await?;
        let instance = fetch_instance(&mut *tx, instance_id).await?;
        let latest = fetch_last_operation(&mut *tx, instance_id).await?;
        let cleanup = fetch_cleanup_activity(&mut tx, instance_id).await?;

        let plan = tracker::plan_update(
            instance_id,
            parameters,
            instance.as_ref(),
            latest.as_ref(),
            cleanup,
        )?;

        if let UpdatePlan::Replay(existing) = plan {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Existing(existing));
        }

        mark_in_progress(&mut tx, instance_id, operation.started_at).await?;
        insert_operation(&mut tx, instance_id, operation).await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Accepted(
            operation.clone().into_operation(instance_id),
        ))
    }

    async fn claim_deprovision(
        &self,
        instance_id: &str,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        lock_instance(&mut tx, instance_id).await?;
        let instance = fetch_instance(&mut *tx, instance_id).await?;
        let latest = fetch_last_operation(&mut *tx, instance_id).await?;
        let cleanup = fetch_cleanup_activity(&mut tx, instance_id).await?;

        tracker::plan_deprovision(instance_id, instance.as_ref(), latest.as_ref(), cleanup)?;

        mark_in_progress(&mut tx, instance_id, operation.started_at).await?;
        insert_operation(&mut tx, instance_id, operation).await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Accepted(
            operation.clone().into_operation(instance_id),
        ))
    }

    async fn complete_operation(
        &self,
        completion: &OperationCompletion,
    ) -> Result<Option<Operation>, CoreError> {
        let result = to_optional_json_text(completion.result.as_ref())?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            UPDATE operations
            SET state = ?, result = ?, error_message = ?, description = ?, completed_at = ?
            WHERE operation_id = ? AND state = 'in_progress'
            RETURNING {OPERATION_COLUMNS}
            "#
        ))
        .bind(completion.state.as_str())
        .bind(result)
        .bind(&completion.error_message)
        .bind(&completion.description)
        .bind(completion.completed_at)
        .bind(&completion.operation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let operation = Operation::try_from(row)?;
        let transition = tracker::transition_for(&operation, completion);

        sqlx::query(
            r#"
            UPDATE service_instances
            SET state = ?, connection_info = ?, parameters = COALESCE(?, parameters),
                deleted_at = COALESCE(?, deleted_at), updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(transition.state.as_str())
        .bind(to_optional_json_text(transition.connection_info.as_ref())?)
        .bind(to_optional_json_text(transition.parameters.as_ref())?)
        .bind(transition.deleted_at)
        .bind(completion.completed_at)
        .bind(&operation.instance_id)
        .execute(&mut *tx)
        .await?;

        if transition.deleted_at.is_some() {
            retire_cleanup_jobs(&mut tx, &operation.instance_id, completion.completed_at).await?;
        }
        if let Some(job) = &completion.cleanup {
            insert_cleanup_job_with(&mut *tx, job).await?;
        }

        tx.commit().await?;
        Ok(Some(operation))
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>, CoreError> {
        fetch_instance(&self.pool, instance_id).await
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<ServiceInstance>, CoreError> {
        let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };
        let provider = filter.provider.map(|p| p.as_str());
        let state = filter.state.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM service_instances
            WHERE (? IS NULL OR provider = ?)
              AND (? IS NULL OR state = ?)
              AND (? OR deleted_at IS NULL)
            ORDER BY created_at DESC, instance_id
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(provider)
        .bind(provider)
        .bind(state)
        .bind(state)
        .bind(filter.include_deleted)
        .bind(limit)
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>, CoreError> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations WHERE operation_id = ?"
        ))
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Operation::try_from).transpose()
    }

    async fn get_last_operation(&self, instance_id: &str) -> Result<Option<Operation>, CoreError> {
        fetch_last_operation(&self.pool, instance_id).await
    }

    async fn list_operations(&self, instance_id: &str) -> Result<Vec<Operation>, CoreError> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE instance_id = ?
            ORDER BY started_at, operation_id
            "#
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn list_in_progress_operations(&self, limit: i64) -> Result<Vec<Operation>, CoreError> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE state = 'in_progress'
            ORDER BY started_at
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn list_overdue_operations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Operation>, CoreError> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE state = 'in_progress' AND deadline_at <= ?
            ORDER BY deadline_at
            LIMIT ?
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn find_orphan_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<OrphanCandidate>, CoreError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT i.instance_id, i.provider, o.operation_id
            FROM service_instances i
            JOIN operations o ON o.instance_id = i.instance_id
            WHERE i.deleted_at IS NULL
              AND o.operation_type = 'deprovision'
              AND o.state = 'failed'
              AND NOT EXISTS (
                  SELECT 1 FROM operations n
                  WHERE n.instance_id = o.instance_id AND n.started_at > o.started_at
              )
              AND NOT EXISTS (
                  SELECT 1 FROM cleanup_jobs c WHERE c.operation_id = o.operation_id
              )
            ORDER BY o.completed_at
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(instance_id, provider, operation_id)| {
                Ok(OrphanCandidate {
                    provider: provider.parse().map_err(|_| {
                        CoreError::corrupt("service_instances", format!("provider '{}'", provider))
                    })?,
                    instance_id,
                    operation_id,
                })
            })
            .collect()
    }

    async fn insert_cleanup_job(&self, job: &NewCleanupJob) -> Result<bool, CoreError> {
        insert_cleanup_job_with(&self.pool, job).await
    }

    async fn get_cleanup_job(&self, job_id: &str) -> Result<Option<CleanupJob>, CoreError> {
        let row = sqlx::query_as::<_, CleanupJobRow>(&format!(
            "SELECT {CLEANUP_JOB_COLUMNS} FROM cleanup_jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CleanupJob::try_from).transpose()
    }

    async fn list_cleanup_jobs(
        &self,
        filter: &CleanupJobFilter,
    ) -> Result<Vec<CleanupJob>, CoreError> {
        let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };
        let state = filter.state.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, CleanupJobRow>(&format!(
            r#"
            SELECT {CLEANUP_JOB_COLUMNS} FROM cleanup_jobs
            WHERE (? IS NULL OR state = ?)
              AND (? IS NULL OR resource_id = ?)
            ORDER BY created_at DESC, job_id
            LIMIT ?
            "#
        ))
        .bind(state)
        .bind(state)
        .bind(&filter.resource_id)
        .bind(&filter.resource_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn list_due_cleanup_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CleanupJob>, CoreError> {
        let rows = sqlx::query_as::<_, CleanupJobRow>(&format!(
            r#"
            SELECT {CLEANUP_JOB_COLUMNS} FROM cleanup_jobs
            WHERE state = 'scheduled' AND scheduled_at <= ?
            ORDER BY scheduled_at
            LIMIT ?
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn start_cleanup_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanupJob>, CoreError> {
        let row = sqlx::query_as::<_, CleanupJobRow>(&format!(
            r#"
            UPDATE cleanup_jobs
            SET state = 'running', executed_at = ?
            WHERE job_id = ? AND state = 'scheduled'
              AND NOT EXISTS (
                  SELECT 1 FROM operations o
                  WHERE o.instance_id = cleanup_jobs.resource_id AND o.state = 'in_progress'
              )
            RETURNING {CLEANUP_JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CleanupJob::try_from).transpose()
    }

    async fn reschedule_cleanup_job(
        &self,
        job_id: &str,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cleanup_jobs
            SET state = 'scheduled', retry_count = ?, scheduled_at = ?, last_error = ?
            WHERE job_id = ? AND state = 'running'
            "#,
        )
        .bind(retry_count)
        .bind(scheduled_at)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_cleanup_job(&self, finish: &CleanupJobFinish) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let resource: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE cleanup_jobs
            SET state = ?, last_error = COALESCE(?, last_error), completed_at = ?
            WHERE job_id = ? AND state = 'running'
            RETURNING resource_id
            "#,
        )
        .bind(finish.state.as_str())
        .bind(&finish.error)
        .bind(finish.completed_at)
        .bind(&finish.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((resource_id,)) = resource else {
            tx.rollback().await?;
            return Ok(false);
        };

        if finish.soft_delete_instance && finish.state == CleanupJobState::Succeeded {
            sqlx::query(
                r#"
                UPDATE service_instances
                SET deleted_at = COALESCE(deleted_at, ?), connection_info = NULL, updated_at = ?
                WHERE instance_id = ?
                "#,
            )
            .bind(finish.completed_at)
            .bind(finish.completed_at)
            .bind(&resource_id)
            .execute(&mut *tx)
            .await?;
            retire_cleanup_jobs(&mut tx, &resource_id, finish.completed_at).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn requeue_running_cleanup_jobs(&self) -> Result<u64, CoreError> {
        let result =
            sqlx::query("UPDATE cleanup_jobs SET state = 'scheduled' WHERE state = 'running'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_failed_cleanup_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanupJob>, CoreError> {
        let row = sqlx::query_as::<_, CleanupJobRow>(&format!(
            r#"
            UPDATE cleanup_jobs
            SET state = 'scheduled', retry_count = 0, scheduled_at = ?, completed_at = NULL
            WHERE job_id = ? AND state = 'failed'
            RETURNING {CLEANUP_JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CleanupJob::try_from).transpose()
    }

    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), CoreError> {
        sqlx::query(&format!(
            "INSERT INTO audit_events ({AUDIT_EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&event.event_type)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.action)
        .bind(&event.result)
        .bind(event.duration_ms)
        .bind(to_optional_json_text(event.details.as_ref())?)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit_events(
        &self,
        resource_type: &str,
        resource_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, CoreError> {
        let rows = sqlx::query_as::<_, AuditEventRow>(&format!(
            r#"
            SELECT {AUDIT_EVENT_COLUMNS} FROM audit_events
            WHERE resource_type = ? AND resource_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(resource_type)
        .bind(resource_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn prune_operations(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM operations WHERE operation_id IN (
                SELECT o.operation_id FROM operations o
                WHERE o.state != 'in_progress'
                  AND o.completed_at < ?
                  AND EXISTS (
                      SELECT 1 FROM operations n
                      WHERE n.instance_id = o.instance_id AND n.started_at > o.started_at
                  )
                LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_cleanup_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cleanup_jobs WHERE job_id IN (
                SELECT c.job_id FROM cleanup_jobs c
                WHERE c.completed_at < ?
                  AND (
                      c.state = 'succeeded'
                      OR (c.state = 'failed' AND NOT EXISTS (
                          SELECT 1 FROM service_instances i
                          WHERE i.instance_id = c.resource_id AND i.deleted_at IS NULL
                      ))
                  )
                LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_audit_events(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM audit_events WHERE id IN (
                SELECT id FROM audit_events WHERE created_at < ? ORDER BY id LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CleanupJobType, FailureKind, LifecycleState, OperationType, ProviderKind};
    use chrono::Duration;
    use serde_json::json;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    async fn persistence() -> SqlitePersistence {
        SqlitePersistence::new(test_pool().await)
    }

    fn request(instance_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: instance_id.to_string(),
            service_id: "kafka-service".to_string(),
            plan_id: "basic".to_string(),
            provider: ProviderKind::Container,
            parameters: json!({ "cluster_size": 1 }),
        }
    }

    fn new_op(op_type: OperationType) -> NewOperation {
        let now = Utc::now();
        NewOperation::new(op_type, now, now + Duration::minutes(10))
    }

    async fn provisioned(p: &SqlitePersistence, instance_id: &str) -> Operation {
        let outcome = p
            .claim_provision(&request(instance_id), &new_op(OperationType::Provision))
            .await
            .expect("claim");
        let op = outcome.operation().clone();
        p.complete_operation(&OperationCompletion::succeeded(
            &op.operation_id,
            "ready",
            Some(json!({ "bootstrap_servers": "localhost:9092" })),
        ))
        .await
        .expect("complete")
        .expect("was in progress");
        op
    }

    #[tokio::test]
    async fn test_claim_provision_creates_instance_and_operation() {
        let p = persistence().await;

        let outcome = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap();
        assert!(outcome.is_accepted());

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert_eq!(instance.state, LifecycleState::InProgress);
        assert_eq!(instance.parameters, json!({ "cluster_size": 1 }));
        assert!(instance.connection_info.is_none());

        let last = p.get_last_operation("c1").await.unwrap().unwrap();
        assert_eq!(last.operation_id, outcome.operation().operation_id);
        assert_eq!(last.state, LifecycleState::InProgress);
        assert_eq!(last.description.as_deref(), Some("provision in progress"));
    }

    #[tokio::test]
    async fn test_second_claim_while_in_flight_is_rejected() {
        let p = persistence().await;
        p.claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap();

        let err = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OperationInProgress { .. }));

        let err = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OperationInProgress { .. }));

        assert_eq!(p.list_operations("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_success_returns_existing_operation() {
        let p = persistence().await;
        let op = provisioned(&p, "c1").await;

        let outcome = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap();
        match outcome {
            ClaimOutcome::Existing(existing) => {
                assert_eq!(existing.operation_id, op.operation_id);
                assert_eq!(existing.state, LifecycleState::Succeeded);
            }
            other => panic!("expected replay, got {:?}", other),
        }
        assert_eq!(p.list_operations("c1").await.unwrap().len(), 1);

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert_eq!(instance.state, LifecycleState::Succeeded);
        assert_eq!(
            instance.connection_info,
            Some(json!({ "bootstrap_servers": "localhost:9092" }))
        );
    }

    #[tokio::test]
    async fn test_complete_operation_first_writer_wins() {
        let p = persistence().await;
        let outcome = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap();
        let op_id = outcome.operation().operation_id.clone();

        let first = p
            .complete_operation(&OperationCompletion::failed(
                &op_id,
                FailureKind::ProviderTimeout,
                "deadline exceeded",
                "provision timed out",
            ))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = p
            .complete_operation(&OperationCompletion::succeeded(&op_id, "ready", None))
            .await
            .unwrap();
        assert!(second.is_none());

        let op = p.get_operation(&op_id).await.unwrap().unwrap();
        assert_eq!(op.state, LifecycleState::Failed);
        assert_eq!(op.failure_kind(), Some(FailureKind::ProviderTimeout));
        assert!(op.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_completion_enqueues_cleanup_once() {
        let p = persistence().await;
        let outcome = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap();
        let op_id = outcome.operation().operation_id.clone();

        let job = NewCleanupJob::for_instance(
            CleanupJobType::Rollback,
            "c1",
            ProviderKind::Container,
            "provision failed",
            3,
            Utc::now(),
        )
        .with_operation(&op_id)
        .with_sub_resources(vec!["streamctl-c1-net".to_string()]);

        p.complete_operation(
            &OperationCompletion::failed(&op_id, FailureKind::ProviderFailure, "boom", "failed")
                .with_cleanup(job.clone()),
        )
        .await
        .unwrap();

        let mut duplicate = job.clone();
        duplicate.job_id = uuid::Uuid::new_v4().to_string();
        assert!(!p.insert_cleanup_job(&duplicate).await.unwrap());

        let jobs = p
            .list_cleanup_jobs(&CleanupJobFilter {
                resource_id: Some("c1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, CleanupJobState::Scheduled);
        assert_eq!(jobs[0].sub_resources, vec!["streamctl-c1-net".to_string()]);

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert_eq!(instance.state, LifecycleState::Failed);

        // Retrying provision is blocked while the rollback is pending.
        let err = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OperationInProgress { .. }));
    }

    #[tokio::test]
    async fn test_deprovision_soft_deletes_and_allows_revive() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let outcome = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        p.complete_operation(&OperationCompletion::succeeded(
            &outcome.operation().operation_id,
            "removed",
            None,
        ))
        .await
        .unwrap();

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert!(instance.deleted_at.is_some());
        assert!(instance.connection_info.is_none());

        let live = p.list_instances(&InstanceFilter::default()).await.unwrap();
        assert!(live.is_empty());
        let all = p
            .list_instances(&InstanceFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let err = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));

        let mut changed = request("c1");
        changed.plan_id = "premium".to_string();
        let outcome = p
            .claim_provision(&changed, &new_op(OperationType::Provision))
            .await
            .unwrap();
        assert!(outcome.is_accepted());
        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert!(instance.deleted_at.is_none());
        assert_eq!(instance.plan_id, "premium");
    }

    /// Fail a provision of `instance_id` with a scheduled rollback.
    async fn failed_with_rollback(p: &SqlitePersistence, instance_id: &str) -> String {
        let outcome = p
            .claim_provision(&request(instance_id), &new_op(OperationType::Provision))
            .await
            .unwrap();
        let op_id = outcome.operation().operation_id.clone();
        let job = NewCleanupJob::for_instance(
            CleanupJobType::Rollback,
            instance_id,
            ProviderKind::Container,
            "provider_failure",
            3,
            Utc::now(),
        )
        .with_operation(&op_id)
        .with_sub_resources(vec![format!("container:streamctl-{}-kafka-1", instance_id)]);
        p.complete_operation(
            &OperationCompletion::failed(&op_id, FailureKind::ProviderFailure, "boom", "failed")
                .with_cleanup(job.clone()),
        )
        .await
        .unwrap();
        job.job_id
    }

    #[tokio::test]
    async fn test_successful_deprovision_retires_pending_rollback() {
        let p = persistence().await;
        let rollback_id = failed_with_rollback(&p, "c1").await;

        // A scheduled rollback does not block the deprovision
        let outcome = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        p.complete_operation(&OperationCompletion::succeeded(
            &outcome.operation().operation_id,
            "removed",
            None,
        ))
        .await
        .unwrap()
        .unwrap();

        let job = p.get_cleanup_job(&rollback_id).await.unwrap().unwrap();
        assert_eq!(job.state, CleanupJobState::Succeeded);
        assert!(job.completed_at.is_some());
        assert!(p.start_cleanup_job(&rollback_id, Utc::now()).await.unwrap().is_none());

        let revived = p
            .claim_provision(&request("c1"), &new_op(OperationType::Provision))
            .await
            .unwrap();
        assert!(revived.is_accepted());
    }

    #[tokio::test]
    async fn test_failed_deprovision_leaves_rollback_scheduled() {
        let p = persistence().await;
        let rollback_id = failed_with_rollback(&p, "c1").await;

        let outcome = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        p.complete_operation(&OperationCompletion::failed(
            &outcome.operation().operation_id,
            FailureKind::ProviderFailure,
            "docker unreachable",
            "deprovision failed",
        ))
        .await
        .unwrap()
        .unwrap();

        let job = p.get_cleanup_job(&rollback_id).await.unwrap().unwrap();
        assert_eq!(job.state, CleanupJobState::Scheduled);
    }

    #[tokio::test]
    async fn test_teardown_success_retires_other_jobs() {
        let p = persistence().await;
        let rollback_id = failed_with_rollback(&p, "c1").await;

        let teardown = NewCleanupJob::for_instance(
            CleanupJobType::Teardown,
            "c1",
            ProviderKind::Container,
            "orphaned",
            3,
            Utc::now(),
        );
        assert!(p.insert_cleanup_job(&teardown).await.unwrap());
        p.start_cleanup_job(&teardown.job_id, Utc::now())
            .await
            .unwrap()
            .expect("teardown should start");
        assert!(
            p.finish_cleanup_job(&CleanupJobFinish {
                job_id: teardown.job_id.clone(),
                state: CleanupJobState::Succeeded,
                error: None,
                completed_at: Utc::now(),
                soft_delete_instance: true,
            })
            .await
            .unwrap()
        );

        let rollback = p.get_cleanup_job(&rollback_id).await.unwrap().unwrap();
        assert_eq!(rollback.state, CleanupJobState::Succeeded);
        assert!(p.get_instance("c1").await.unwrap().unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_update_applies_parameters_on_success() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let params = json!({ "cluster_size": 3 });
        let outcome = p
            .claim_update(
                "c1",
                &params,
                &new_op(OperationType::Update).with_parameters(params.clone()),
            )
            .await
            .unwrap();
        assert!(outcome.is_accepted());

        // Parameters change only once the update succeeds.
        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert_eq!(instance.parameters, json!({ "cluster_size": 1 }));

        p.complete_operation(&OperationCompletion::succeeded(
            &outcome.operation().operation_id,
            "updated",
            Some(json!({ "bootstrap_servers": "localhost:9093" })),
        ))
        .await
        .unwrap();

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert_eq!(instance.parameters, params);
        assert_eq!(instance.state, LifecycleState::Succeeded);
    }

    #[tokio::test]
    async fn test_start_cleanup_job_waits_for_in_flight_operation() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let job = NewCleanupJob::for_instance(
            CleanupJobType::Teardown,
            "c1",
            ProviderKind::Container,
            "orphaned",
            3,
            Utc::now(),
        );
        assert!(p.insert_cleanup_job(&job).await.unwrap());

        let outcome = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        assert!(p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().is_none());

        p.complete_operation(&OperationCompletion::failed(
            &outcome.operation().operation_id,
            FailureKind::ProviderFailure,
            "boom",
            "failed",
        ))
        .await
        .unwrap();

        let started = p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(started.state, CleanupJobState::Running);
        assert!(started.executed_at.is_some());
        assert!(p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().is_none());

        // A running cleanup blocks new claims.
        let err = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OperationInProgress { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_job_retry_and_finish() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let job = NewCleanupJob::for_instance(
            CleanupJobType::Teardown,
            "c1",
            ProviderKind::Container,
            "orphaned",
            2,
            Utc::now(),
        );
        p.insert_cleanup_job(&job).await.unwrap();
        p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().unwrap();

        let later = Utc::now() + Duration::seconds(30);
        assert!(
            p.reschedule_cleanup_job(&job.job_id, 1, later, "docker unavailable")
                .await
                .unwrap()
        );
        assert!(p.list_due_cleanup_jobs(Utc::now(), 10).await.unwrap().is_empty());
        assert_eq!(
            p.list_due_cleanup_jobs(later, 10).await.unwrap()[0].job_id,
            job.job_id
        );

        p.start_cleanup_job(&job.job_id, later).await.unwrap().unwrap();
        assert!(
            p.finish_cleanup_job(&CleanupJobFinish {
                job_id: job.job_id.clone(),
                state: CleanupJobState::Succeeded,
                error: None,
                completed_at: later,
                soft_delete_instance: true,
            })
            .await
            .unwrap()
        );

        let stored = p.get_cleanup_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, CleanupJobState::Succeeded);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("docker unavailable"));

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert!(instance.deleted_at.is_some());

        // Finishing twice is a no-op.
        assert!(
            !p.finish_cleanup_job(&CleanupJobFinish {
                job_id: job.job_id.clone(),
                state: CleanupJobState::Failed,
                error: Some("late".to_string()),
                completed_at: later,
                soft_delete_instance: false,
            })
            .await
            .unwrap()
        );
    }

    #[tokio::test]
    async fn test_retry_count_cannot_exceed_max_retries() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let job = NewCleanupJob::for_instance(
            CleanupJobType::Teardown,
            "c1",
            ProviderKind::Container,
            "orphaned",
            1,
            Utc::now(),
        );
        p.insert_cleanup_job(&job).await.unwrap();
        p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().unwrap();

        let result = p
            .reschedule_cleanup_job(&job.job_id, 2, Utc::now(), "boom")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_requeue_running_and_failed_jobs() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let job = NewCleanupJob::for_instance(
            CleanupJobType::Teardown,
            "c1",
            ProviderKind::Container,
            "orphaned",
            0,
            Utc::now(),
        );
        p.insert_cleanup_job(&job).await.unwrap();
        p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().unwrap();

        assert_eq!(p.requeue_running_cleanup_jobs().await.unwrap(), 1);
        let stored = p.get_cleanup_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, CleanupJobState::Scheduled);

        assert!(
            p.requeue_failed_cleanup_job(&job.job_id, Utc::now())
                .await
                .unwrap()
                .is_none()
        );

        p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().unwrap();
        p.finish_cleanup_job(&CleanupJobFinish {
            job_id: job.job_id.clone(),
            state: CleanupJobState::Failed,
            error: Some("exhausted".to_string()),
            completed_at: Utc::now(),
            soft_delete_instance: true,
        })
        .await
        .unwrap();

        let instance = p.get_instance("c1").await.unwrap().unwrap();
        assert!(instance.deleted_at.is_none());

        let requeued = p
            .requeue_failed_cleanup_job(&job.job_id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.state, CleanupJobState::Scheduled);
        assert_eq!(requeued.retry_count, 0);
        assert!(requeued.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_orphan_candidates() {
        let p = persistence().await;
        provisioned(&p, "c1").await;
        provisioned(&p, "c2").await;

        let outcome = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        let op_id = outcome.operation().operation_id.clone();
        p.complete_operation(&OperationCompletion::failed(
            &op_id,
            FailureKind::ProviderFailure,
            "docker rm failed",
            "failed",
        ))
        .await
        .unwrap();

        let candidates = p.find_orphan_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].instance_id, "c1");
        assert_eq!(candidates[0].operation_id, op_id);
        assert_eq!(candidates[0].provider, ProviderKind::Container);

        let job = NewCleanupJob::for_instance(
            CleanupJobType::Teardown,
            "c1",
            ProviderKind::Container,
            "orphaned",
            3,
            Utc::now(),
        )
        .with_operation(&op_id);
        p.insert_cleanup_job(&job).await.unwrap();

        assert!(p.find_orphan_candidates(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overdue_operations() {
        let p = persistence().await;
        let now = Utc::now();
        let op = NewOperation::new(OperationType::Provision, now, now + Duration::seconds(5));
        p.claim_provision(&request("c1"), &op).await.unwrap();

        assert!(p.list_overdue_operations(now, 10).await.unwrap().is_empty());
        let overdue = p
            .list_overdue_operations(now + Duration::seconds(6), 10)
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].operation_id, op.operation_id);
        assert_eq!(p.list_in_progress_operations(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_latest_operation_and_instances() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let outcome = p
            .claim_deprovision("c1", &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        p.complete_operation(&OperationCompletion::succeeded(
            &outcome.operation().operation_id,
            "removed",
            None,
        ))
        .await
        .unwrap();

        let cutoff = Utc::now() + Duration::days(1);
        assert_eq!(p.prune_operations(cutoff, 100).await.unwrap(), 1);

        let remaining = p.list_operations("c1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].operation_type, OperationType::Deprovision);
        assert!(p.get_instance("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_cleanup_jobs_keeps_failed_jobs_of_live_instances() {
        let p = persistence().await;
        provisioned(&p, "c1").await;

        let mut ids = Vec::new();
        for state in [CleanupJobState::Succeeded, CleanupJobState::Failed] {
            let job = NewCleanupJob::for_instance(
                CleanupJobType::Teardown,
                "c1",
                ProviderKind::Container,
                "orphaned",
                3,
                Utc::now(),
            );
            p.insert_cleanup_job(&job).await.unwrap();
            p.start_cleanup_job(&job.job_id, Utc::now()).await.unwrap().unwrap();
            p.finish_cleanup_job(&CleanupJobFinish {
                job_id: job.job_id.clone(),
                state,
                error: None,
                completed_at: Utc::now(),
                soft_delete_instance: false,
            })
            .await
            .unwrap();
            ids.push(job.job_id);
        }

        let cutoff = Utc::now() + Duration::days(1);
        assert_eq!(p.prune_cleanup_jobs(cutoff, 100).await.unwrap(), 1);
        assert!(p.get_cleanup_job(&ids[0]).await.unwrap().is_none());
        assert!(p.get_cleanup_job(&ids[1]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_audit_events_round_trip() {
        let p = persistence().await;
        let event = AuditEvent {
            event_type: "cleanup".to_string(),
            resource_type: crate::model::RESOURCE_CLEANUP_JOB.to_string(),
            resource_id: "job-1".to_string(),
            action: "teardown".to_string(),
            result: "exhausted".to_string(),
            duration_ms: Some(1200),
            details: Some(json!({ "retry_count": 3 })),
            created_at: Utc::now(),
        };
        p.insert_audit_event(&event).await.unwrap();

        let events = p
            .list_audit_events(crate::model::RESOURCE_CLEANUP_JOB, "job-1", 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, "exhausted");
        assert_eq!(events[0].details, Some(json!({ "retry_count": 3 })));

        let pruned = p
            .prune_audit_events(Utc::now() + Duration::days(1), 100)
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let p = persistence().await;
        assert!(p.health_check().await.unwrap());
    }
}
