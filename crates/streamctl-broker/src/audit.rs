// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit events for lifecycle transitions.
//!
//! Emission is fire-and-forget: [`AuditSink::emit`] never blocks and never
//! fails the transition that produced the event.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use streamctl_core::model::{RESOURCE_CLEANUP_JOB, RESOURCE_SERVICE_INSTANCE};
use streamctl_core::{AuditEvent, CleanupJob, Operation, Persistence};
use tracing::{info, warn};

/// Receives lifecycle events.
pub trait AuditSink: Send + Sync {
    /// Record an event without waiting for it to be stored.
    fn emit(&self, event: AuditEvent);
}

/// Event for an operation transition.
pub fn operation_event(
    operation: &Operation,
    result: &str,
    duration_ms: Option<i64>,
    details: Option<Value>,
) -> AuditEvent {
    AuditEvent {
        event_type: "operation".to_string(),
        resource_type: RESOURCE_SERVICE_INSTANCE.to_string(),
        resource_id: operation.instance_id.clone(),
        action: operation.operation_type.as_str().to_string(),
        result: result.to_string(),
        duration_ms,
        details,
        created_at: Utc::now(),
    }
}

/// Event for a cleanup job transition.
pub fn cleanup_event(job: &CleanupJob, result: &str, details: Option<Value>) -> AuditEvent {
    AuditEvent {
        event_type: "cleanup_job".to_string(),
        resource_type: RESOURCE_CLEANUP_JOB.to_string(),
        resource_id: job.job_id.clone(),
        action: job.job_type.as_str().to_string(),
        result: result.to_string(),
        duration_ms: None,
        details,
        created_at: Utc::now(),
    }
}

/// Writes events to the audit collection on a background task and mirrors
/// each one as a tracing event.
pub struct PersistentAuditSink {
    persistence: Arc<dyn Persistence>,
}

impl PersistentAuditSink {
    /// Create a sink over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

impl AuditSink for PersistentAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            target: "streamctl::audit",
            event_type = %event.event_type,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            action = %event.action,
            result = %event.result,
            duration_ms = ?event.duration_ms,
            "audit"
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(resource_id = %event.resource_id, "No runtime available, audit event not stored");
            return;
        };
        let persistence = self.persistence.clone();
        handle.spawn(async move {
            if let Err(e) = persistence.insert_audit_event(&event).await {
                warn!(
                    error = %e,
                    resource_id = %event.resource_id,
                    "Failed to store audit event"
                );
            }
        });
    }
}

/// Keeps events in memory. Used by tests and embedded setups without a store.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event emitted so far, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Events about one resource with the given result.
    pub fn matching(&self, resource_id: &str, result: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.resource_id == resource_id && e.result == result)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use streamctl_core::{LifecycleState, OperationType, SqlitePersistence};

    fn operation() -> Operation {
        let now = Utc::now();
        Operation {
            operation_id: "op-1".to_string(),
            instance_id: "c1".to_string(),
            operation_type: OperationType::Provision,
            state: LifecycleState::Succeeded,
            parameters: None,
            result: None,
            error_message: None,
            description: None,
            started_at: now,
            deadline_at: now + Duration::seconds(60),
            completed_at: Some(now),
        }
    }

    #[test]
    fn test_memory_sink_records_events() {
        let sink = MemoryAuditSink::new();
        sink.emit(operation_event(&operation(), "succeeded", Some(12), None));

        let events = sink.matching("c1", "succeeded");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "provision");
        assert_eq!(events[0].resource_type, RESOURCE_SERVICE_INSTANCE);
    }

    #[tokio::test]
    async fn test_persistent_sink_stores_in_background() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let sink = PersistentAuditSink::new(persistence.clone());

        sink.emit(operation_event(&operation(), "accepted", None, None));

        let mut stored = Vec::new();
        for _ in 0..50 {
            stored = persistence
                .list_audit_events(RESOURCE_SERVICE_INSTANCE, "c1", 10)
                .await
                .unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].result, "accepted");
    }
}
