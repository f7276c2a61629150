// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup scheduler tests: retries, exhaustion, orphans, pruning, dry runs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    TEST_MAX_RETRIES, TestBroker, default_parameters, provision_request, wait_until_settled,
};
use serde_json::json;

use streamctl_broker::Error;
use streamctl_broker::cleanup_scheduler::{
    CleanupScheduler, CleanupSchedulerConfig, requeue_failed_job,
};
use streamctl_broker::provider::MockProvider;
use streamctl_core::{
    CleanupJobState, CleanupJobType, FailureKind, LifecycleState, NewOperation,
    OperationCompletion, OperationType, ProviderKind,
};

fn scheduler_config() -> CleanupSchedulerConfig {
    CleanupSchedulerConfig {
        poll_interval: Duration::from_millis(50),
        max_retries: TEST_MAX_RETRIES,
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        ..CleanupSchedulerConfig::default()
    }
}

async fn failed_provision(partial: Vec<String>) -> TestBroker {
    let broker = TestBroker::with_provider(
        MockProvider::failing(ProviderKind::Container).with_partial_resources(partial),
    )
    .await;
    broker
        .engine
        .provision(provision_request("c1", default_parameters()))
        .await
        .unwrap();
    let operation = wait_until_settled(&broker.engine, "c1").await;
    assert_eq!(operation.state, LifecycleState::Failed);
    broker
}

#[tokio::test]
async fn test_rollback_removes_partial_resources_and_keeps_instance() {
    let broker = failed_provision(vec!["container/kafka-c1-0".to_string()]).await;
    assert!(broker.provider.has_cluster("c1").await);

    let scheduler = CleanupScheduler::new(broker.engine.clone(), scheduler_config());
    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.jobs_succeeded, 1);
    assert_eq!(report.jobs_rescheduled, 0);

    let jobs = broker.cleanup_jobs("c1").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, CleanupJobType::Rollback);
    assert_eq!(jobs[0].state, CleanupJobState::Succeeded);
    assert!(jobs[0].completed_at.is_some());

    // A rollback leaves the failed instance in place for the caller to retry
    let instance = broker.engine.instance("c1").await.unwrap().instance;
    assert!(instance.deleted_at.is_none());
    assert_eq!(instance.state, LifecycleState::Failed);
    assert!(!broker.provider.has_cluster("c1").await);
    assert_eq!(broker.provider.deprovision_calls(), 1);

    assert!(scheduler.run_once().await.unwrap().is_idle());
}

#[tokio::test]
async fn test_successful_deprovision_retires_pending_rollback() {
    let broker = failed_provision(vec!["container:streamctl-c1-kafka-1".to_string()]).await;
    let rollback = broker.cleanup_jobs("c1").await.remove(0);
    assert_eq!(rollback.state, CleanupJobState::Scheduled);

    broker.engine.deprovision("c1").await.unwrap();
    let operation = wait_until_settled(&broker.engine, "c1").await;
    assert_eq!(operation.operation_type, OperationType::Deprovision);
    assert_eq!(operation.state, LifecycleState::Succeeded);
    assert_eq!(broker.provider.deprovision_calls(), 1);

    let rollback = broker.cleanup_jobs("c1").await.remove(0);
    assert_eq!(rollback.state, CleanupJobState::Succeeded);

    // Nothing is left for the scheduler to remove
    let scheduler = CleanupScheduler::new(broker.engine.clone(), scheduler_config());
    assert!(scheduler.run_once().await.unwrap().is_idle());
    assert_eq!(broker.provider.deprovision_calls(), 1);

    // The ID is free again straight away
    let revived = broker
        .engine
        .provision(provision_request("c1", default_parameters()))
        .await;
    assert!(revived.is_ok(), "{:?}", revived);
}

#[tokio::test]
async fn test_teardown_retries_until_exhausted_then_requeue_succeeds() {
    let broker = TestBroker::new().await;
    broker.provisioned("c1").await;
    broker.provider.set_deprovision_failures(100);

    broker.engine.deprovision("c1").await.unwrap();
    let operation = wait_until_settled(&broker.engine, "c1").await;
    assert_eq!(operation.state, LifecycleState::Failed);

    let scheduler = CleanupScheduler::new(broker.engine.clone(), scheduler_config());

    for expected_retry in 1..=TEST_MAX_RETRIES {
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.jobs_rescheduled, 1, "tick {}", expected_retry);
        let job = broker.cleanup_jobs("c1").await.remove(0);
        assert_eq!(job.state, CleanupJobState::Scheduled);
        assert_eq!(job.retry_count, expected_retry);
        assert!(job.last_error.is_some());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.jobs_exhausted, 1);

    let job = broker.cleanup_jobs("c1").await.remove(0);
    assert_eq!(job.state, CleanupJobState::Failed);
    assert!(job.retry_count <= job.max_retries);
    assert_eq!(job.retry_count, TEST_MAX_RETRIES);
    assert_eq!(broker.audit.matching(&job.job_id, "exhausted").len(), 1);
    assert_eq!(
        broker.audit.matching(&job.job_id, "retry_scheduled").len(),
        TEST_MAX_RETRIES as usize
    );

    // Exhausted jobs are left alone
    assert!(scheduler.run_once().await.unwrap().is_idle());
    let instance = broker.engine.instance("c1").await.unwrap().instance;
    assert!(instance.deleted_at.is_none());

    // Operator re-queues after fixing the backend
    broker.provider.set_deprovision_failures(0);
    let requeued = requeue_failed_job(&broker.engine, &job.job_id).await.unwrap();
    assert_eq!(requeued.state, CleanupJobState::Scheduled);
    assert_eq!(requeued.retry_count, 0);

    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.jobs_succeeded, 1);
    let instance = broker.engine.instance("c1").await.unwrap().instance;
    assert!(instance.deleted_at.is_some());
    assert!(!broker.provider.has_cluster("c1").await);
}

#[tokio::test]
async fn test_due_jobs_run_concurrently() {
    let broker = TestBroker::with_provider(
        MockProvider::failing(ProviderKind::Container).with_teardown_delay(400),
    )
    .await;
    for id in ["c1", "c2", "c3"] {
        broker
            .engine
            .provision(provision_request(id, default_parameters()))
            .await
            .unwrap();
        wait_until_settled(&broker.engine, id).await;
    }

    let scheduler = CleanupScheduler::new(broker.engine.clone(), scheduler_config());
    let started = std::time::Instant::now();
    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.jobs_succeeded, 3);
    assert_eq!(broker.provider.deprovision_calls(), 3);
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "teardowns ran one after another: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_slow_teardown_does_not_hold_up_expiry() {
    let broker = TestBroker::with_provider(
        MockProvider::failing(ProviderKind::Container).with_teardown_delay(30_000),
    )
    .await;
    broker
        .engine
        .provision(provision_request("c1", default_parameters()))
        .await
        .unwrap();
    wait_until_settled(&broker.engine, "c1").await;

    let scheduler = Arc::new(CleanupScheduler::new(broker.engine.clone(), scheduler_config()));
    let shutdown = scheduler.shutdown_handle();
    let task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    // Wait until the c1 rollback is stuck in its provider
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.cleanup_jobs("c1").await[0].state != CleanupJobState::Running {
        assert!(tokio::time::Instant::now() < deadline, "rollback never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // An operation on another instance, already past its deadline and unsupervised
    let now = Utc::now();
    broker
        .engine
        .tracker()
        .claim_provision(
            &provision_request("c2", default_parameters()),
            &NewOperation::new(
                OperationType::Provision,
                now - chrono::Duration::minutes(2),
                now - chrono::Duration::minutes(1),
            ),
        )
        .await
        .unwrap();

    let expired = wait_until_settled(&broker.engine, "c2").await;
    assert_eq!(expired.state, LifecycleState::Failed);
    assert_eq!(
        broker.cleanup_jobs("c1").await[0].state,
        CleanupJobState::Running
    );

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("scheduler should stop")
        .unwrap();
}

#[tokio::test]
async fn test_requeue_rejects_jobs_that_are_not_failed() {
    let broker = failed_provision(Vec::new()).await;
    let job = broker.cleanup_jobs("c1").await.remove(0);

    let err = requeue_failed_job(&broker.engine, &job.job_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {:?}", err);

    let err = requeue_failed_job(&broker.engine, "missing").await.unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_orphaned_instance_gets_teardown() {
    let broker = TestBroker::new().await;
    broker.provisioned("c1").await;

    // A failed deprovision recorded without its cleanup job
    let now = Utc::now();
    let tracker = broker.engine.tracker();
    let claimed = tracker
        .claim_deprovision(
            "c1",
            &NewOperation::new(
                OperationType::Deprovision,
                now,
                now + chrono::Duration::minutes(5),
            ),
        )
        .await
        .unwrap()
        .operation()
        .clone();
    tracker
        .complete(&OperationCompletion::failed(
            &claimed.operation_id,
            FailureKind::ProviderFailure,
            "backend unreachable",
            "deprovision failed",
        ))
        .await
        .unwrap()
        .expect("operation should complete");
    assert!(broker.cleanup_jobs("c1").await.is_empty());

    let scheduler = CleanupScheduler::new(broker.engine.clone(), scheduler_config());
    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.orphans_enqueued, 1);
    assert_eq!(report.jobs_succeeded, 1);

    let jobs = broker.cleanup_jobs("c1").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, CleanupJobType::Teardown);
    assert_eq!(jobs[0].reason, "orphaned");
    assert_eq!(jobs[0].operation_id.as_deref(), Some(claimed.operation_id.as_str()));

    let instance = broker.engine.instance("c1").await.unwrap().instance;
    assert!(instance.deleted_at.is_some());

    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.orphans_enqueued, 0);
}

#[tokio::test]
async fn test_dry_run_reports_without_acting() {
    let broker = failed_provision(Vec::new()).await;

    let scheduler = CleanupScheduler::new(
        broker.engine.clone(),
        CleanupSchedulerConfig {
            dry_run: true,
            ..scheduler_config()
        },
    );

    let report = scheduler.run_once().await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.jobs_succeeded, 1);

    let job = broker.cleanup_jobs("c1").await.remove(0);
    assert_eq!(job.state, CleanupJobState::Scheduled);
    assert_eq!(job.retry_count, 0);
    assert_eq!(broker.provider.deprovision_calls(), 0);
}

#[tokio::test]
async fn test_prune_keeps_latest_operation() {
    let broker = TestBroker::new().await;
    broker.provisioned("c1").await;

    broker
        .engine
        .update("c1", json!({ "cluster_size": 2, "partition_count": 3 }))
        .await
        .unwrap();
    let latest = wait_until_settled(&broker.engine, "c1").await;
    assert_eq!(latest.operation_type, OperationType::Update);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let scheduler = CleanupScheduler::new(
        broker.engine.clone(),
        CleanupSchedulerConfig {
            retention: Duration::ZERO,
            ..scheduler_config()
        },
    );
    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.pruned_operations, 1);

    let operations = broker.engine.tracker().operations("c1").await.unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].operation_id, latest.operation_id);
}

#[tokio::test]
async fn test_tick_expires_overdue_operations() {
    let broker = TestBroker::with_provider(
        MockProvider::never_completing(ProviderKind::Container)
            .with_cadence(Duration::from_millis(1), Duration::from_millis(1)),
    )
    .await;

    // Drop the supervisor so only the scheduler can notice the deadline
    broker
        .engine
        .provision(provision_request("c1", default_parameters()))
        .await
        .unwrap();
    broker.engine.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let scheduler = CleanupScheduler::new(broker.engine.clone(), scheduler_config());
    let report = scheduler.run_once().await.unwrap();

    let operation = broker
        .engine
        .tracker()
        .last_operation("c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(operation.state, LifecycleState::Failed);
    assert!(report.expired <= 1);
    assert_eq!(report.reattached, 0);
    assert_eq!(broker.cleanup_jobs("c1").await.len(), 1);
}

#[tokio::test]
async fn test_run_requeues_interrupted_jobs_and_stops_on_shutdown() {
    let broker = failed_provision(Vec::new()).await;
    let job = broker.cleanup_jobs("c1").await.remove(0);

    // A previous process crashed mid-attempt
    let running = broker
        .persistence
        .start_cleanup_job(&job.job_id, Utc::now())
        .await
        .unwrap()
        .expect("job should start");
    assert_eq!(running.state, CleanupJobState::Running);

    let scheduler = Arc::new(CleanupScheduler::new(
        broker.engine.clone(),
        CleanupSchedulerConfig {
            poll_interval: Duration::from_secs(3600),
            ..scheduler_config()
        },
    ));
    let shutdown = scheduler.shutdown_handle();
    let task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("scheduler should stop")
        .unwrap();

    let job = broker.cleanup_jobs("c1").await.remove(0);
    assert_eq!(job.state, CleanupJobState::Scheduled);
}

#[tokio::test]
async fn test_disabled_scheduler_returns_immediately() {
    let broker = TestBroker::new().await;
    let scheduler = CleanupScheduler::new(
        broker.engine.clone(),
        CleanupSchedulerConfig {
            enabled: false,
            ..scheduler_config()
        },
    );

    tokio::time::timeout(Duration::from_secs(1), scheduler.run())
        .await
        .expect("disabled scheduler should not loop");
}
