// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for streamctl-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use streamctl_core::{
    NewOperation, OperationTracker, OperationType, Persistence, ProviderKind, ProvisionRequest,
    SqlitePersistence,
};

/// A file-backed SQLite store with a multi-connection pool.
///
/// In-memory databases are per-connection, so contention tests need a file.
pub struct TestStore {
    pub tracker: OperationTracker,
    pub persistence: Arc<dyn Persistence>,
    _dir: TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("streamctl.db"))
            .await
            .expect("Failed to open SQLite store");
        let persistence: Arc<dyn Persistence> = Arc::new(persistence);
        Self {
            tracker: OperationTracker::new(persistence.clone()),
            persistence,
            _dir: dir,
        }
    }
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

pub fn new_operation(op_type: OperationType) -> NewOperation {
    let now = Utc::now();
    NewOperation::new(op_type, now, now + Duration::minutes(10))
}
