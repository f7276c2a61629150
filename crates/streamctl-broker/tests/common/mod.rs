// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for streamctl-broker integration tests.
//!
//! Provides TestBroker: a lifecycle engine over a file-backed SQLite store, a
//! mock container provider and an in-memory audit sink.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use streamctl_broker::audit::MemoryAuditSink;
use streamctl_broker::engine::{EngineConfig, LifecycleEngine};
use streamctl_broker::metrics::OperationMetrics;
use streamctl_broker::provider::MockProvider;
use streamctl_broker::registry::ProviderRegistry;
use streamctl_core::{
    CleanupJob, CleanupJobFilter, LifecycleState, Operation, OperationTracker, Persistence,
    ProviderKind, ProvisionRequest, SqlitePersistence,
};

/// Default retry budget given to cleanup jobs in tests.
pub const TEST_MAX_RETRIES: i32 = 2;

/// Engine, provider and store wired together for one test.
pub struct TestBroker {
    pub engine: LifecycleEngine,
    pub provider: Arc<MockProvider>,
    pub audit: Arc<MemoryAuditSink>,
    pub persistence: Arc<dyn Persistence>,
    _dir: TempDir,
}

impl TestBroker {
    /// Broker whose container provider succeeds quickly.
    pub async fn new() -> Self {
        Self::with_provider(MockProvider::new(ProviderKind::Container)).await
    }

    /// Broker over a custom container provider.
    pub async fn with_provider(provider: MockProvider) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("streamctl.db"))
            .await
            .expect("Failed to open SQLite store");
        let persistence: Arc<dyn Persistence> = Arc::new(persistence);

        let provider = Arc::new(provider);
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = engine_over(persistence.clone(), provider.clone(), audit.clone());

        Self {
            engine,
            provider,
            audit,
            persistence,
            _dir: dir,
        }
    }

    /// A second engine over the same store, as a restarted process would build.
    pub fn restarted(&self, provider: Arc<MockProvider>) -> (LifecycleEngine, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = engine_over(self.persistence.clone(), provider, audit.clone());
        (engine, audit)
    }

    /// Provision `instance_id` and wait until it has succeeded.
    pub async fn provisioned(&self, instance_id: &str) -> Operation {
        self.engine
            .provision(provision_request(instance_id, default_parameters()))
            .await
            .expect("provision should be accepted");
        let operation = wait_until_settled(&self.engine, instance_id).await;
        assert_eq!(operation.state, LifecycleState::Succeeded, "{:?}", operation);
        operation
    }

    /// Cleanup jobs targeting `instance_id`.
    pub async fn cleanup_jobs(&self, instance_id: &str) -> Vec<CleanupJob> {
        self.persistence
            .list_cleanup_jobs(&CleanupJobFilter {
                state: None,
                resource_id: Some(instance_id.to_string()),
                limit: 100,
            })
            .await
            .expect("Failed to list cleanup jobs")
    }
}

pub fn engine_over(
    persistence: Arc<dyn Persistence>,
    provider: Arc<MockProvider>,
    audit: Arc<MemoryAuditSink>,
) -> LifecycleEngine {
    let registry = ProviderRegistry::new().with(provider);
    LifecycleEngine::new(
        OperationTracker::new(persistence),
        Arc::new(registry),
        audit,
        Arc::new(OperationMetrics::new()),
        EngineConfig {
            probe_timeout: Duration::from_secs(1),
            cleanup_max_retries: TEST_MAX_RETRIES,
        },
    )
}

pub fn provision_request(instance_id: &str, parameters: Value) -> ProvisionRequest {
    ProvisionRequest {
        instance_id: instance_id.to_string(),
        service_id: "kafka-service".to_string(),
        plan_id: "basic".to_string(),
        provider: ProviderKind::Container,
        parameters,
    }
}

pub fn default_parameters() -> Value {
    json!({ "cluster_size": 1, "partition_count": 3 })
}

/// Poll the store until the latest operation of `instance_id` leaves
/// `in_progress`. Reads through the tracker so no probe is triggered.
pub async fn wait_until_settled(engine: &LifecycleEngine, instance_id: &str) -> Operation {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let latest = engine
            .tracker()
            .last_operation(instance_id)
            .await
            .expect("Failed to read last operation");
        if let Some(operation) = latest
            && operation.state != LifecycleState::InProgress
        {
            return operation;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("operation on '{}' did not settle in time", instance_id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the engine has no local supervisors left.
pub async fn wait_for_idle_supervisors(engine: &LifecycleEngine) {
    for _ in 0..250 {
        if engine.active_supervisors() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("supervisors still active: {}", engine.active_supervisors());
}
