// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Claims lock the instance row with `SELECT ... FOR UPDATE`. When the row does
//! not exist yet there is nothing to lock, so two first-time provisions can race
//! to the insert; the loser gets a unique violation, reported as
//! [`CoreError::ClaimRace`], and the tracker re-runs its claim.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres};

use crate::error::CoreError;
use crate::migrations::POSTGRES as MIGRATOR;
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

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run all migrations.
    pub async fn connect(database_url: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Persistence {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Instance Operations
// ============================================================================

/// Get an instance by ID, soft-deleted or not.
pub async fn get_instance<'e, E>(
    executor: E,
    instance_id: &str,
) -> Result<Option<ServiceInstance>, CoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM service_instances WHERE instance_id = $1"
    ))
    .bind(instance_id)
    .fetch_optional(executor)
    .await?;

    row.map(ServiceInstance::try_from).transpose()
}

/// List instances matching a filter, newest first.
pub async fn list_instances(
    pool: &PgPool,
    filter: &InstanceFilter,
) -> Result<Vec<ServiceInstance>, CoreError> {
    let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };

    let rows = sqlx::query_as::<_, InstanceRow>(&format!(
        r#"
        SELECT {INSTANCE_COLUMNS} FROM service_instances
        WHERE ($1::text IS NULL OR provider = $1)
          AND ($2::text IS NULL OR state = $2)
          AND ($3 OR deleted_at IS NULL)
        ORDER BY created_at DESC, instance_id
        LIMIT $4 OFFSET $5
        "#
    ))
    .bind(filter.provider.map(|p| p.as_str()))
    .bind(filter.state.map(|s| s.as_str()))
    .bind(filter.include_deleted)
    .bind(limit)
    .bind(filter.offset.max(0))
    .fetch_all(pool)
    .await?;

    collect(rows)
}

async fn lock_instance(conn: &mut PgConnection, instance_id: &str) -> Result<(), CoreError> {
    sqlx::query("SELECT instance_id FROM service_instances WHERE instance_id = $1 FOR UPDATE")
        .bind(instance_id)
        .fetch_optional(conn)
        .await?;
    Ok(())
}

async fn mark_in_progress(
    conn: &mut PgConnection,
    instance_id: &str,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE service_instances
        SET state = 'in_progress', connection_info = NULL, updated_at = $1
        WHERE instance_id = $2
        "#,
    )
    .bind(now)
    .bind(instance_id)
    .execute(conn)
    .await?;
    Ok(())
}

// ============================================================================
// Operation Operations
// ============================================================================

/// Latest operation of an instance.
pub async fn get_last_operation<'e, E>(
    executor: E,
    instance_id: &str,
) -> Result<Option<Operation>, CoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        r#"
        SELECT {OPERATION_COLUMNS} FROM operations
        WHERE instance_id = $1
        ORDER BY started_at DESC, operation_id DESC
        LIMIT 1
        "#
    ))
    .bind(instance_id)
    .fetch_optional(executor)
    .await?;

    row.map(Operation::try_from).transpose()
}

pub async fn get_operation(
    pool: &PgPool,
    operation_id: &str,
) -> Result<Option<Operation>, CoreError> {
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM operations WHERE operation_id = $1"
    ))
    .bind(operation_id)
    .fetch_optional(pool)
    .await?;

    row.map(Operation::try_from).transpose()
}

async fn insert_operation(
    conn: &mut PgConnection,
    instance_id: &str,
    operation: &NewOperation,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO operations (operation_id, instance_id, operation_type, state, parameters,
                                description, started_at, deadline_at)
        VALUES ($1, $2, $3, 'in_progress', $4, $5, $6, $7)
        "#,
    )
    .bind(&operation.operation_id)
    .bind(instance_id)
    .bind(operation.operation_type.as_str())
    .bind(to_optional_json_text(operation.parameters.as_ref())?)
    .bind(format!("{} in progress", operation.operation_type))
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

// ============================================================================
// Cleanup Job Operations
// ============================================================================

async fn cleanup_activity(
    conn: &mut PgConnection,
    instance_id: &str,
) -> Result<CleanupActivity, CoreError> {
    let states: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT state FROM cleanup_jobs
        WHERE resource_type = $1 AND resource_id = $2 AND state IN ('scheduled', 'running')
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
    conn: &mut PgConnection,
    instance_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE cleanup_jobs
        SET state = 'succeeded', completed_at = $1
        WHERE resource_type = $2 AND resource_id = $3 AND state IN ('scheduled', 'failed')
        "#,
    )
    .bind(now)
    .bind(RESOURCE_SERVICE_INSTANCE)
    .bind(instance_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Insert a cleanup job unless one of the same type exists for its operation.
pub async fn insert_cleanup_job<'e, E>(executor: E, job: &NewCleanupJob) -> Result<bool, CoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO cleanup_jobs (job_id, job_type, resource_type, resource_id, provider,
                                  operation_id, reason, sub_resources, state, retry_count,
                                  max_retries, scheduled_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'scheduled', 0, $9, $10, NOW())
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
    .bind(serde_json::to_string(&job.sub_resources)?)
    .bind(job.max_retries)
    .bind(job.scheduled_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_cleanup_job(pool: &PgPool, job_id: &str) -> Result<Option<CleanupJob>, CoreError> {
    let row = sqlx::query_as::<_, CleanupJobRow>(&format!(
        "SELECT {CLEANUP_JOB_COLUMNS} FROM cleanup_jobs WHERE job_id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(CleanupJob::try_from).transpose()
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn health_check(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }

    async fn claim_provision(
        &self,
        request: &ProvisionRequest,
        operation: &NewOperation,
    ) -> Result<ClaimOutcome, CoreError> {
        let id = request.instance_id.as_str();
        let mut tx = self.pool.begin().await?;

        lock_instance(&mut tx, id).await?;
        let instance = get_instance(&mut *tx, id).await?;
        let latest = get_last_operation(&mut *tx, id).await?;
        let cleanup = cleanup_activity(&mut tx, id).await?;

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
                    VALUES ($1, $2, $3, $4, $5, 'in_progress', $6, $6)
                    "#,
                )
                .bind(id)
                .bind(&request.service_id)
                .bind(&request.plan_id)
                .bind(request.provider.as_str())
                .bind(&parameters)
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
                    SET service_id = $1, plan_id = $2, provider = $3, parameters = $4,
                        state = 'in_progress', connection_info = NULL, updated_at = $5,
                        deleted_at = NULL
                    WHERE instance_id = $6
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
        let instance = get_instance(&mut *tx, instance_id).await?;
        let latest = get_last_operation(&mut *tx, instance_id).await?;
        let cleanup = cleanup_activity(&mut tx, instance_id).await?;

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
        let instance = get_instance(&mut *tx, instance_id).await?;
        let latest = get_last_operation(&mut *tx, instance_id).await?;
        let cleanup = cleanup_activity(&mut tx, instance_id).await?;

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
            SET state = $1, result = $2, error_message = $3, description = $4, completed_at = $5
            WHERE operation_id = $6 AND state = 'in_progress'
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
            SET state = $1, connection_info = $2, parameters = COALESCE($3, parameters),
                deleted_at = COALESCE($4, deleted_at), updated_at = $5
            WHERE instance_id = $6
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
            insert_cleanup_job(&mut *tx, job).await?;
        }

        tx.commit().await?;
        Ok(Some(operation))
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>, CoreError> {
        get_instance(&self.pool, instance_id).await
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<ServiceInstance>, CoreError> {
        list_instances(&self.pool, filter).await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>, CoreError> {
        get_operation(&self.pool, operation_id).await
    }

    async fn get_last_operation(&self, instance_id: &str) -> Result<Option<Operation>, CoreError> {
        get_last_operation(&self.pool, instance_id).await
    }

    async fn list_operations(&self, instance_id: &str) -> Result<Vec<Operation>, CoreError> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE instance_id = $1
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
            LIMIT $1
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
            WHERE state = 'in_progress' AND deadline_at <= $1
            ORDER BY deadline_at
            LIMIT $2
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
            LIMIT $1
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
        insert_cleanup_job(&self.pool, job).await
    }

    async fn get_cleanup_job(&self, job_id: &str) -> Result<Option<CleanupJob>, CoreError> {
        get_cleanup_job(&self.pool, job_id).await
    }

    async fn list_cleanup_jobs(
        &self,
        filter: &CleanupJobFilter,
    ) -> Result<Vec<CleanupJob>, CoreError> {
        let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };

        let rows = sqlx::query_as::<_, CleanupJobRow>(&format!(
            r#"
            SELECT {CLEANUP_JOB_COLUMNS} FROM cleanup_jobs
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR resource_id = $2)
            ORDER BY created_at DESC, job_id
            LIMIT $3
            "#
        ))
        .bind(filter.state.map(|s| s.as_str()))
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
            WHERE state = 'scheduled' AND scheduled_at <= $1
            ORDER BY scheduled_at
            LIMIT $2
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
        let mut tx = self.pool.begin().await?;

        // Serialize against claims on the same instance.
        let target: Option<(String,)> =
            sqlx::query_as("SELECT resource_id FROM cleanup_jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((resource_id,)) = target else {
            tx.rollback().await?;
            return Ok(None);
        };
        lock_instance(&mut tx, &resource_id).await?;

        let row = sqlx::query_as::<_, CleanupJobRow>(&format!(
            r#"
            UPDATE cleanup_jobs
            SET state = 'running', executed_at = $1
            WHERE job_id = $2 AND state = 'scheduled'
              AND NOT EXISTS (
                  SELECT 1 FROM operations o
                  WHERE o.instance_id = cleanup_jobs.resource_id AND o.state = 'in_progress'
              )
            RETURNING {CLEANUP_JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
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
            SET state = 'scheduled', retry_count = $1, scheduled_at = $2, last_error = $3
            WHERE job_id = $4 AND state = 'running'
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
            SET state = $1, last_error = COALESCE($2, last_error), completed_at = $3
            WHERE job_id = $4 AND state = 'running'
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
                SET deleted_at = COALESCE(deleted_at, $1), connection_info = NULL, updated_at = $1
                WHERE instance_id = $2
                "#,
            )
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
            SET state = 'scheduled', retry_count = 0, scheduled_at = $1, completed_at = NULL
            WHERE job_id = $2 AND state = 'failed'
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
            "INSERT INTO audit_events ({AUDIT_EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
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
            WHERE resource_type = $1 AND resource_id = $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3
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
                WHERE o.state <> 'in_progress'
                  AND o.completed_at < $1
                  AND EXISTS (
                      SELECT 1 FROM operations n
                      WHERE n.instance_id = o.instance_id AND n.started_at > o.started_at
                  )
                LIMIT $2
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
                WHERE c.completed_at < $1
                  AND (
                      c.state = 'succeeded'
                      OR (c.state = 'failed' AND NOT EXISTS (
                          SELECT 1 FROM service_instances i
                          WHERE i.instance_id = c.resource_id AND i.deleted_at IS NULL
                      ))
                  )
                LIMIT $2
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
                SELECT id FROM audit_events WHERE created_at < $1 ORDER BY id LIMIT $2
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
    use crate::model::{FailureKind, LifecycleState, OperationType, ProviderKind};
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_STREAMCTL_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        MIGRATOR.run(&pool).await.ok()?;
        Some(pool)
    }

    async fn cleanup_test_instance(pool: &PgPool, instance_id: &str) {
        sqlx::query("DELETE FROM cleanup_jobs WHERE resource_id = $1")
            .bind(instance_id)
            .execute(pool)
            .await
            .ok();
        sqlx::query("DELETE FROM service_instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(pool)
            .await
            .ok();
    }

    fn request(instance_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: instance_id.to_string(),
            service_id: "kafka-service".to_string(),
            plan_id: "standard".to_string(),
            provider: ProviderKind::Orchestrator,
            parameters: json!({ "cluster_size": 3, "replication_factor": 3 }),
        }
    }

    fn new_op(op_type: OperationType) -> NewOperation {
        let now = Utc::now();
        NewOperation::new(op_type, now, now + Duration::minutes(15))
    }

    #[tokio::test]
    async fn test_claim_complete_and_replay() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_STREAMCTL_DATABASE_URL not set");
            return;
        };
        let p = PostgresPersistence::new(pool.clone());
        let id = format!("pg-{}", Uuid::new_v4().simple());

        let outcome = p
            .claim_provision(&request(&id), &new_op(OperationType::Provision))
            .await
            .unwrap();
        assert!(outcome.is_accepted());

        let err = p
            .claim_provision(&request(&id), &new_op(OperationType::Provision))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OperationInProgress { .. }));

        let op_id = outcome.operation().operation_id.clone();
        p.complete_operation(&OperationCompletion::succeeded(
            &op_id,
            "ready",
            Some(json!({ "bootstrap_servers": "kafka:9092" })),
        ))
        .await
        .unwrap()
        .unwrap();

        let replay = p
            .claim_provision(&request(&id), &new_op(OperationType::Provision))
            .await
            .unwrap();
        assert!(!replay.is_accepted());
        assert_eq!(replay.operation().operation_id, op_id);

        let instance = p.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.state, LifecycleState::Succeeded);

        cleanup_test_instance(&pool, &id).await;
    }

    #[tokio::test]
    async fn test_failed_deprovision_becomes_orphan_candidate() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_STREAMCTL_DATABASE_URL not set");
            return;
        };
        let p = PostgresPersistence::new(pool.clone());
        let id = format!("pg-{}", Uuid::new_v4().simple());

        let outcome = p
            .claim_provision(&request(&id), &new_op(OperationType::Provision))
            .await
            .unwrap();
        p.complete_operation(&OperationCompletion::succeeded(
            &outcome.operation().operation_id,
            "ready",
            None,
        ))
        .await
        .unwrap();

        let outcome = p
            .claim_deprovision(&id, &new_op(OperationType::Deprovision))
            .await
            .unwrap();
        p.complete_operation(&OperationCompletion::failed(
            &outcome.operation().operation_id,
            FailureKind::ProviderFailure,
            "kubectl delete failed",
            "deprovision failed",
        ))
        .await
        .unwrap();

        let candidates = p.find_orphan_candidates(1000).await.unwrap();
        assert!(candidates.iter().any(|c| c.instance_id == id));

        cleanup_test_instance(&pool, &id).await;
    }

    #[tokio::test]
    async fn test_successful_deprovision_retires_pending_rollback() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_STREAMCTL_DATABASE_URL not set");
            return;
        };
        let p = PostgresPersistence::new(pool.clone());
        let id = format!("pg-{}", Uuid::new_v4().simple());

        let outcome = p
            .claim_provision(&request(&id), &new_op(OperationType::Provision))
            .await
            .unwrap();
        let op_id = outcome.operation().operation_id.clone();
        let rollback = NewCleanupJob::for_instance(
            crate::model::CleanupJobType::Rollback,
            &id,
            ProviderKind::Orchestrator,
            "provider_failure",
            3,
            Utc::now(),
        )
        .with_operation(&op_id)
        .with_sub_resources(vec![format!("statefulset/streamctl-{}-kafka", id)]);
        p.complete_operation(
            &OperationCompletion::failed(&op_id, FailureKind::ProviderFailure, "boom", "failed")
                .with_cleanup(rollback.clone()),
        )
        .await
        .unwrap();

        let outcome = p
            .claim_deprovision(&id, &new_op(OperationType::Deprovision))
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

        let job = p.get_cleanup_job(&rollback.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, CleanupJobState::Succeeded);
        assert!(p.start_cleanup_job(&rollback.job_id, Utc::now()).await.unwrap().is_none());

        let revived = p
            .claim_provision(&request(&id), &new_op(OperationType::Provision))
            .await
            .unwrap();
        assert!(revived.is_accepted());

        cleanup_test_instance(&pool, &id).await;
    }
}
