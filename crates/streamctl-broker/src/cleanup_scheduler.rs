// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reconciler for leaked resources and stale records.
//!
//! Each tick, in order:
//! 1. Expires in-progress operations past their deadline (failing them and
//!    enqueueing their cleanup in the same transaction)
//! 2. Re-attaches in-progress operations no local supervisor owns
//! 3. Schedules a teardown for every orphan candidate (a live instance whose
//!    latest deprovision failed with no cleanup job recorded)
//! 4. Prunes terminal operations, cleanup jobs and audit events older than the
//!    retention window (instance rows are never pruned)
//! 5. Runs due cleanup jobs concurrently through the owning provider's
//!    deprovision, with exponential backoff between attempts; a job that
//!    exhausts its retries is failed permanently and reported for manual
//!    intervention
//!
//! [`CleanupScheduler::run`] drives steps 1-4 and step 5 from separate loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use streamctl_core::{
    CleanupJob, CleanupJobFinish, CleanupJobState, CleanupJobType, CoreError, NewCleanupJob,
    Persistence,
};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::cleanup_event;
use crate::engine::LifecycleEngine;
use crate::error::{Error, Result};
use crate::provider::ResourceRef;

/// Configuration for the cleanup scheduler.
#[derive(Debug, Clone)]
pub struct CleanupSchedulerConfig {
    /// Whether the scheduler runs at all.
    pub enabled: bool,
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Maximum rows handled per scan.
    pub batch_size: i64,
    /// Retry budget for jobs created by the orphan scan and by the engine.
    pub max_retries: i32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Age after which terminal records are pruned.
    pub retention: Duration,
    /// Log what would happen without calling providers or writing state.
    pub dry_run: bool,
}

impl Default for CleanupSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            max_retries: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),         // 1 hour
            retention: Duration::from_secs(30 * 24 * 3600), // 30 days
            dry_run: false,
        }
    }
}

impl CleanupSchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STREAMCTL_CLEANUP_ENABLED`: "false" or "0" to disable (default: true)
    /// - `STREAMCTL_CLEANUP_POLL_INTERVAL_SECS`: seconds between ticks (default: 30)
    /// - `STREAMCTL_CLEANUP_BATCH_SIZE`: rows per scan (default: 50)
    /// - `STREAMCTL_CLEANUP_MAX_RETRIES`: retry budget per job (default: 5)
    /// - `STREAMCTL_CLEANUP_BASE_BACKOFF_SECS`: first retry delay (default: 30)
    /// - `STREAMCTL_CLEANUP_MAX_BACKOFF_SECS`: retry delay cap (default: 3600)
    /// - `STREAMCTL_CLEANUP_RETENTION_DAYS`: days terminal records are kept (default: 30)
    /// - `STREAMCTL_CLEANUP_DRY_RUN`: "true" or "1" to only log (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("STREAMCTL_CLEANUP_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(defaults.enabled);

        let dry_run = std::env::var("STREAMCTL_CLEANUP_DRY_RUN")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.dry_run);

        let secs = |var: &str, default: Duration| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let retention = std::env::var("STREAMCTL_CLEANUP_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|days| Duration::from_secs(days * 24 * 3600))
            .unwrap_or(defaults.retention);

        Self {
            enabled,
            poll_interval: secs("STREAMCTL_CLEANUP_POLL_INTERVAL_SECS", defaults.poll_interval),
            batch_size: std::env::var("STREAMCTL_CLEANUP_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_retries: std::env::var("STREAMCTL_CLEANUP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            base_backoff: secs("STREAMCTL_CLEANUP_BASE_BACKOFF_SECS", defaults.base_backoff),
            max_backoff: secs("STREAMCTL_CLEANUP_MAX_BACKOFF_SECS", defaults.max_backoff),
            retention,
            dry_run,
        }
    }

    /// Delay before retry number `retry_count` (1-based): base doubled per
    /// earlier retry, capped at `max_backoff`.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let doublings = retry_count.saturating_sub(1).clamp(0, 20) as u32;
        self.base_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

/// What one tick did (or, in dry-run mode, would have done).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub dry_run: bool,
    pub expired: usize,
    pub reattached: usize,
    pub orphans_enqueued: usize,
    pub jobs_succeeded: usize,
    pub jobs_rescheduled: usize,
    pub jobs_exhausted: usize,
    pub pruned_operations: u64,
    pub pruned_jobs: u64,
    pub pruned_audit_events: u64,
}

impl TickReport {
    /// Whether the tick found nothing to do.
    pub fn is_idle(&self) -> bool {
        *self
            == TickReport {
                dry_run: self.dry_run,
                ..TickReport::default()
            }
    }
}

/// Background cleanup scheduler.
pub struct CleanupScheduler {
    engine: LifecycleEngine,
    config: CleanupSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupScheduler {
    /// Create a new cleanup scheduler.
    pub fn new(engine: LifecycleEngine, config: CleanupSchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &CleanupSchedulerConfig {
        &self.config
    }

    fn persistence(&self) -> &Arc<dyn Persistence> {
        self.engine.tracker().persistence()
    }

    /// Run the scheduler until the shutdown signal is received.
    ///
    /// Reconciliation (expiry, re-attachment, orphan scan, pruning) and job
    /// execution run as two independent loops, so a slow teardown never delays
    /// deadline enforcement for other instances. Jobs interrupted by shutdown
    /// stay `running` and are returned to the queue on the next start.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Cleanup scheduler disabled");
            return;
        }

        if !self.config.dry_run {
            match self.persistence().requeue_running_cleanup_jobs().await {
                Ok(0) => {}
                Ok(requeued) => info!(requeued, "Returned interrupted cleanup jobs to the queue"),
                Err(e) => error!(error = %e, "Failed to requeue interrupted cleanup jobs"),
            }
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            retention_days = self.config.retention.as_secs() / 86400,
            dry_run = self.config.dry_run,
            "Cleanup scheduler started"
        );

        tokio::select! {
            biased;

            _ = self.shutdown.notified() => {
                info!("Cleanup scheduler received shutdown signal");
            }
            _ = self.reconcile_loop() => {}
            _ = self.job_loop() => {}
        }

        info!("Cleanup scheduler stopped");
    }

    async fn reconcile_loop(&self) {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let now = Utc::now();
            let result = if self.config.dry_run {
                self.preview(now).await
            } else {
                self.reconcile(now).await
            };
            match result {
                Ok(report) if report.is_idle() => debug!("Cleanup tick found nothing to do"),
                Ok(report) => info!(?report, "Cleanup tick complete"),
                Err(e) => error!(error = %e, "Cleanup tick failed"),
            }
        }
    }

    async fn job_loop(&self) {
        if self.config.dry_run {
            // Previews already list due jobs
            return std::future::pending().await;
        }
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let mut report = TickReport::default();
            match self.run_due_jobs(Utc::now(), &mut report).await {
                Ok(()) if report.is_idle() => {}
                Ok(()) => info!(
                    succeeded = report.jobs_succeeded,
                    rescheduled = report.jobs_rescheduled,
                    exhausted = report.jobs_exhausted,
                    "Cleanup jobs processed"
                ),
                Err(e) => error!(error = %e, "Running cleanup jobs failed"),
            }
        }
    }

    /// Run a single tick: reconcile, then run due jobs to completion.
    pub async fn run_once(&self) -> Result<TickReport> {
        let now = Utc::now();
        if self.config.dry_run {
            return self.preview(now).await;
        }

        let mut report = self.reconcile(now).await?;
        self.run_due_jobs(now, &mut report).await?;
        Ok(report)
    }

    /// Every tick step except running jobs.
    async fn reconcile(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let batch = self.config.batch_size;
        let mut report = TickReport {
            expired: self.engine.expire_overdue(now, batch).await?,
            reattached: self.engine.reattach_in_flight(batch).await?,
            orphans_enqueued: self.enqueue_orphans(now).await?,
            ..TickReport::default()
        };
        self.prune(now, &mut report).await?;
        Ok(report)
    }

    async fn preview(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let batch = self.config.batch_size;
        let overdue = self.engine.tracker().overdue(now, batch).await?;
        let due = self.persistence().list_due_cleanup_jobs(now, batch).await?;
        let orphans = self.persistence().find_orphan_candidates(batch).await?;

        for op in &overdue {
            info!(
                dry_run = true,
                operation_id = %op.operation_id,
                instance_id = %op.instance_id,
                "Would expire overdue operation"
            );
        }
        for job in &due {
            info!(
                dry_run = true,
                job_id = %job.job_id,
                resource_id = %job.resource_id,
                job_type = job.job_type.as_str(),
                retry_count = job.retry_count,
                "Would run cleanup job"
            );
        }
        for candidate in &orphans {
            info!(
                dry_run = true,
                instance_id = %candidate.instance_id,
                provider = %candidate.provider,
                "Would schedule teardown for orphaned instance"
            );
        }

        Ok(TickReport {
            dry_run: true,
            expired: overdue.len(),
            orphans_enqueued: orphans.len(),
            jobs_succeeded: due.len(),
            ..TickReport::default()
        })
    }

    async fn enqueue_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let persistence = self.persistence();
        let mut enqueued = 0;

        for candidate in persistence
            .find_orphan_candidates(self.config.batch_size)
            .await?
        {
            let job = NewCleanupJob::for_instance(
                CleanupJobType::Teardown,
                &candidate.instance_id,
                candidate.provider,
                "orphaned",
                self.config.max_retries,
                now,
            )
            .with_operation(&candidate.operation_id);

            if !persistence.insert_cleanup_job(&job).await? {
                continue;
            }
            enqueued += 1;
            warn!(
                instance_id = %candidate.instance_id,
                job_id = %job.job_id,
                "Orphaned instance found, teardown scheduled"
            );
            if let Some(stored) = persistence.get_cleanup_job(&job.job_id).await? {
                self.engine
                    .audit()
                    .emit(cleanup_event(&stored, "enqueued", None));
            }
        }

        Ok(enqueued)
    }

    /// Start every due job and wait for all of them. Jobs run concurrently,
    /// at most one batch at a time.
    async fn run_due_jobs(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let persistence = self.persistence();
        let due = persistence
            .list_due_cleanup_jobs(now, self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "Running due cleanup jobs");

        let mut running = JoinSet::new();
        for job in due {
            let Some(job) = persistence.start_cleanup_job(&job.job_id, Utc::now()).await? else {
                debug!(job_id = %job.job_id, "Cleanup job taken elsewhere or instance busy");
                continue;
            };
            running.spawn(execute(self.engine.clone(), self.config.clone(), job));
        }

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(JobOutcome::Succeeded)) => report.jobs_succeeded += 1,
                Ok(Ok(JobOutcome::Rescheduled)) => report.jobs_rescheduled += 1,
                Ok(Ok(JobOutcome::Exhausted)) => report.jobs_exhausted += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to record cleanup job result");
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "Cleanup job task aborted"),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn prune(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::days(30));
        let cutoff = now - retention;
        let batch = self.config.batch_size;
        let persistence: &dyn Persistence = self.persistence().as_ref();

        report.pruned_operations =
            drain(batch, move || persistence.prune_operations(cutoff, batch)).await?;
        report.pruned_jobs =
            drain(batch, move || persistence.prune_cleanup_jobs(cutoff, batch)).await?;
        report.pruned_audit_events =
            drain(batch, move || persistence.prune_audit_events(cutoff, batch)).await?;

        let total = report.pruned_operations + report.pruned_jobs + report.pruned_audit_events;
        if total > 0 {
            info!(
                operations = report.pruned_operations,
                cleanup_jobs = report.pruned_jobs,
                audit_events = report.pruned_audit_events,
                "Pruned records past retention"
            );
        }
        Ok(())
    }
}

/// How one cleanup attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Rescheduled,
    Exhausted,
}

/// Run one started job through its provider's deprovision and record the
/// result: success, a backed-off retry, or exhaustion.
async fn execute(
    engine: LifecycleEngine,
    config: CleanupSchedulerConfig,
    job: CleanupJob,
) -> Result<JobOutcome> {
    let persistence = engine.tracker().persistence();
    let target =
        ResourceRef::instance(&job.resource_id).with_sub_resources(job.sub_resources.clone());

    let outcome = match engine.registry().resolve(job.provider) {
        Ok(driver) => {
            let limit = driver.cadence().max_duration;
            match tokio::time::timeout(limit, driver.deprovision(&target)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "teardown did not complete within {}s",
                    limit.as_secs()
                )),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let finished = match outcome {
        Ok(()) => {
            let soft_delete = job.job_type == CleanupJobType::Teardown;
            persistence
                .finish_cleanup_job(&CleanupJobFinish {
                    job_id: job.job_id.clone(),
                    state: CleanupJobState::Succeeded,
                    error: None,
                    completed_at: Utc::now(),
                    soft_delete_instance: soft_delete,
                })
                .await?;
            info!(
                job_id = %job.job_id,
                instance_id = %job.resource_id,
                job_type = job.job_type.as_str(),
                attempts = job.retry_count + 1,
                "Cleanup job succeeded"
            );
            engine.audit().emit(cleanup_event(&job, "succeeded", None));
            JobOutcome::Succeeded
        }
        Err(message) => {
            let retry_count = job.retry_count + 1;
            if retry_count > job.max_retries {
                persistence
                    .finish_cleanup_job(&CleanupJobFinish {
                        job_id: job.job_id.clone(),
                        state: CleanupJobState::Failed,
                        error: Some(message.clone()),
                        completed_at: Utc::now(),
                        soft_delete_instance: false,
                    })
                    .await?;
                error!(
                    job_id = %job.job_id,
                    instance_id = %job.resource_id,
                    provider = %job.provider,
                    retries = job.retry_count,
                    error = %message,
                    "Cleanup job exhausted its retries, manual intervention required"
                );
                engine.audit().emit(cleanup_event(
                    &job,
                    "exhausted",
                    Some(json!({ "error": message, "retry_count": job.retry_count })),
                ));
                JobOutcome::Exhausted
            } else {
                let delay = config.backoff(retry_count);
                let next_attempt = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or(chrono::Duration::hours(1));
                persistence
                    .reschedule_cleanup_job(&job.job_id, retry_count, next_attempt, &message)
                    .await?;
                warn!(
                    job_id = %job.job_id,
                    instance_id = %job.resource_id,
                    retry_count,
                    max_retries = job.max_retries,
                    delay_secs = delay.as_secs(),
                    error = %message,
                    "Cleanup job failed, retry scheduled"
                );
                engine.audit().emit(cleanup_event(
                    &job,
                    "retry_scheduled",
                    Some(json!({
                        "error": message,
                        "retry_count": retry_count,
                        "next_attempt_at": next_attempt,
                    })),
                ));
                JobOutcome::Rescheduled
            }
        }
    };
    Ok(finished)
}

/// Repeat a batched delete until a batch comes back short.
async fn drain<F, Fut>(batch: i64, mut prune: F) -> std::result::Result<u64, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<u64, CoreError>>,
{
    let mut total = 0;
    loop {
        let deleted = prune().await?;
        total += deleted;
        if deleted == 0 || deleted < batch.max(1) as u64 {
            return Ok(total);
        }
    }
}

/// Re-queue a permanently failed cleanup job with a fresh retry budget.
pub async fn requeue_failed_job(engine: &LifecycleEngine, job_id: &str) -> Result<CleanupJob> {
    let persistence = engine.tracker().persistence();
    let existing = persistence
        .get_cleanup_job(job_id)
        .await?
        .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

    if existing.state != CleanupJobState::Failed {
        return Err(Error::Conflict(format!(
            "cleanup job '{}' is {}, only failed jobs can be retried",
            job_id,
            existing.state.as_str()
        )));
    }

    let job = persistence
        .requeue_failed_cleanup_job(job_id, Utc::now())
        .await?
        .ok_or_else(|| Error::Conflict(format!("cleanup job '{}' changed state", job_id)))?;

    info!(job_id = %job_id, instance_id = %job.resource_id, "Cleanup job re-queued");
    engine.audit().emit(cleanup_event(&job, "requeued", None));
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = CleanupSchedulerConfig {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
            ..CleanupSchedulerConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(10));
        assert_eq!(config.backoff(2), Duration::from_secs(20));
        assert_eq!(config.backoff(3), Duration::from_secs(40));
        assert_eq!(config.backoff(4), Duration::from_secs(60));
        assert_eq!(config.backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn test_idle_report() {
        assert!(TickReport::default().is_idle());
        assert!(
            TickReport {
                dry_run: true,
                ..TickReport::default()
            }
            .is_idle()
        );
        assert!(
            !TickReport {
                expired: 1,
                ..TickReport::default()
            }
            .is_idle()
        );
    }

    #[test]
    fn test_default_config() {
        let config = CleanupSchedulerConfig::default();
        assert!(config.enabled);
        assert!(!config.dry_run);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retention, Duration::from_secs(30 * 24 * 3600));
    }
}
