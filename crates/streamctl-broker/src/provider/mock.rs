// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider for testing.
//!
//! Simulates a backend in memory: provisioning records a cluster that becomes
//! ready after a configurable delay, probes report from that record, and
//! failures can be injected per call type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use streamctl_core::ProviderKind;
use tokio::sync::Mutex;

use super::spec::ClusterSpec;
use super::traits::*;

/// Mock provider for testing.
pub struct MockProvider {
    kind: ProviderKind,
    clusters: Mutex<HashMap<String, bool>>,
    removed_sub_resources: Mutex<Vec<String>>,
    probe_override: Mutex<Option<ProbeStatus>>,
    deprovision_failures: AtomicU32,
    provision_calls: AtomicUsize,
    update_calls: AtomicUsize,
    deprovision_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    /// Deadline and poll interval reported to the engine
    pub cadence: ProviderCadence,
    /// Simulated provisioning time (in milliseconds)
    pub delay_ms: u64,
    /// Simulated teardown time (in milliseconds)
    pub teardown_delay_ms: u64,
    /// If true, provision and update fail after the delay
    pub fail_provision: bool,
    /// If true, provision and update never return
    pub never_complete: bool,
    /// Sub-resources reported with an injected failure
    pub partial_resources: Vec<String>,
    /// Answer to `supports_status_probe`
    pub supports_probe: bool,
    /// If false, `validate` reports the provider unavailable
    pub available: bool,
}

impl MockProvider {
    /// Create a mock provider that succeeds quickly.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            clusters: Mutex::new(HashMap::new()),
            removed_sub_resources: Mutex::new(Vec::new()),
            probe_override: Mutex::new(None),
            deprovision_failures: AtomicU32::new(0),
            provision_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            deprovision_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            cadence: ProviderCadence {
                max_duration: Duration::from_secs(5),
                poll_interval: Duration::from_millis(50),
            },
            delay_ms: 10,
            teardown_delay_ms: 0,
            fail_provision: false,
            never_complete: false,
            partial_resources: Vec::new(),
            supports_probe: true,
            available: true,
        }
    }

    /// Create a mock provider whose provisioning fails.
    pub fn failing(kind: ProviderKind) -> Self {
        Self {
            fail_provision: true,
            ..Self::new(kind)
        }
    }

    /// Create a mock provider whose provisioning never returns.
    /// Useful for testing deadline enforcement.
    pub fn never_completing(kind: ProviderKind) -> Self {
        Self {
            never_complete: true,
            delay_ms: 0,
            ..Self::new(kind)
        }
    }

    /// Set the simulated provisioning time.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set the simulated teardown time.
    pub fn with_teardown_delay(mut self, delay_ms: u64) -> Self {
        self.teardown_delay_ms = delay_ms;
        self
    }

    /// Set the operation deadline and poll interval.
    pub fn with_cadence(mut self, max_duration: Duration, poll_interval: Duration) -> Self {
        self.cadence = ProviderCadence {
            max_duration,
            poll_interval,
        };
        self
    }

    /// Report these sub-resources when provisioning fails.
    pub fn with_partial_resources(mut self, partial: Vec<String>) -> Self {
        self.partial_resources = partial;
        self
    }

    /// Fail the next `count` deprovision calls.
    pub fn failing_deprovision(self, count: u32) -> Self {
        self.deprovision_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Disable status probes.
    pub fn without_probe(mut self) -> Self {
        self.supports_probe = false;
        self
    }

    /// Report the backend as unavailable from `validate`.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Fail the next `count` deprovision calls, on a shared provider.
    pub fn set_deprovision_failures(&self, count: u32) {
        self.deprovision_failures.store(count, Ordering::SeqCst);
    }

    /// Force every probe to answer `status`; `None` restores normal answers.
    pub async fn set_probe(&self, status: Option<ProbeStatus>) {
        *self.probe_override.lock().await = status;
    }

    /// Record a ready cluster as if the backend finished on its own.
    pub async fn mark_ready(&self, instance_id: &str) {
        self.clusters
            .lock()
            .await
            .insert(instance_id.to_string(), true);
    }

    /// Whether the simulated backend still holds resources for an instance.
    pub async fn has_cluster(&self, instance_id: &str) -> bool {
        self.clusters.lock().await.contains_key(instance_id)
    }

    /// Sub-resources removed by scoped deprovision calls, in order.
    pub async fn removed_sub_resources(&self) -> Vec<String> {
        self.removed_sub_resources.lock().await.clone()
    }

    /// Number of provision calls.
    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Number of update calls.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of deprovision calls.
    pub fn deprovision_calls(&self) -> usize {
        self.deprovision_calls.load(Ordering::SeqCst)
    }

    /// Number of probe calls.
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn connection_info(instance_id: &str) -> ConnectionInfo {
        ConnectionInfo::plaintext(
            vec![format!("mock-{}:9092", instance_id)],
            format!("mock-{}:2181", instance_id),
        )
    }

    async fn converge(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        self.clusters
            .lock()
            .await
            .entry(spec.instance_id.clone())
            .or_insert(false);

        if self.never_complete {
            std::future::pending::<()>().await;
        }
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }

        if self.fail_provision {
            return Err(ProviderError::StepFailed {
                step: "mock provision".to_string(),
                message: "Mock failure".to_string(),
                partial: self.partial_resources.clone(),
            });
        }

        self.mark_ready(&spec.instance_id).await;
        Ok(Self::connection_info(&spec.instance_id))
    }
}

#[async_trait]
impl ProviderDriver for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn cadence(&self) -> ProviderCadence {
        self.cadence
    }

    fn supports_status_probe(&self) -> bool {
        self.supports_probe
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.converge(spec).await
    }

    async fn update(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.converge(spec).await
    }

    fn update_footprint(
        &self,
        instance_id: &str,
        previous: &ClusterSpec,
        next: &ClusterSpec,
    ) -> Vec<String> {
        (previous.cluster_size + 1..=next.cluster_size)
            .map(|broker_id| format!("broker:{}-{}", instance_id, broker_id))
            .collect()
    }

    async fn deprovision(&self, resource: &ResourceRef) -> Result<()> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        if self.teardown_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.teardown_delay_ms)).await;
        }

        let injected = self
            .deprovision_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ProviderError::step_failed("mock teardown", "Mock teardown failure"));
        }

        let mut clusters = self.clusters.lock().await;
        if resource.sub_resources.is_empty() {
            clusters.remove(&resource.instance_id);
            return Ok(());
        }

        self.removed_sub_resources
            .lock()
            .await
            .extend(resource.sub_resources.iter().cloned());
        // A cluster that never became ready holds nothing beyond its partial resources
        if clusters.get(&resource.instance_id) == Some(&false) {
            clusters.remove(&resource.instance_id);
        }
        Ok(())
    }

    async fn probe_status(&self, resource: &ResourceRef) -> Result<ProbeStatus> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = self.probe_override.lock().await.clone() {
            return Ok(status);
        }

        Ok(match self.clusters.lock().await.get(&resource.instance_id) {
            Some(true) => ProbeStatus::Ready(Some(Self::connection_info(&resource.instance_id))),
            Some(false) => ProbeStatus::Pending,
            None => ProbeStatus::Failed("no resources found".to_string()),
        })
    }

    async fn validate(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(ProviderError::Unavailable("mock backend disabled".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(instance_id: &str) -> ProvisionSpec {
        ProvisionSpec {
            instance_id: instance_id.to_string(),
            plan_id: "basic".to_string(),
            cluster: ClusterSpec::default(),
        }
    }

    #[tokio::test]
    async fn test_mock_provision_then_probe_ready() {
        let provider = MockProvider::new(ProviderKind::Container);

        let info = provider.provision(&spec("c1")).await.unwrap();
        assert_eq!(info.bootstrap_servers, vec!["mock-c1:9092"]);

        let status = provider
            .probe_status(&ResourceRef::instance("c1"))
            .await
            .unwrap();
        assert!(matches!(status, ProbeStatus::Ready(Some(_))));
        assert_eq!(provider.provision_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_reports_partial_resources() {
        let provider = MockProvider::failing(ProviderKind::Orchestrator)
            .with_partial_resources(vec!["statefulset/x".to_string()]);

        let err = provider.provision(&spec("c1")).await.unwrap_err();
        assert_eq!(err.partial_resources(), ["statefulset/x"]);
    }

    #[tokio::test]
    async fn test_mock_deprovision_failure_budget() {
        let provider = MockProvider::new(ProviderKind::Container).failing_deprovision(2);
        provider.mark_ready("c1").await;

        let target = ResourceRef::instance("c1");
        assert!(provider.deprovision(&target).await.is_err());
        assert!(provider.deprovision(&target).await.is_err());
        assert!(provider.deprovision(&target).await.is_ok());
        assert!(!provider.has_cluster("c1").await);
        assert_eq!(provider.deprovision_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_scoped_deprovision_keeps_ready_cluster() {
        let provider = MockProvider::new(ProviderKind::Container);
        provider.mark_ready("c1").await;

        let target = ResourceRef::instance("c1").with_sub_resources(vec!["broker:c1-2".to_string()]);
        provider.deprovision(&target).await.unwrap();
        assert!(provider.has_cluster("c1").await);
        assert_eq!(provider.removed_sub_resources().await, ["broker:c1-2"]);
    }

    #[tokio::test]
    async fn test_mock_never_completing_stays_pending() {
        let provider = std::sync::Arc::new(MockProvider::never_completing(
            ProviderKind::InfraAsCode,
        ));
        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.provision(&spec("c1")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = provider
            .probe_status(&ResourceRef::instance("c1"))
            .await
            .unwrap();
        assert_eq!(status, ProbeStatus::Pending);
        assert!(!task.is_finished());
        task.abort();
    }
}
