// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation outcome counters.

use dashmap::DashMap;
use serde::Serialize;
use streamctl_core::{OperationType, ProviderKind};

/// How an operation request or execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A new operation was claimed.
    Accepted,
    /// An identical request was answered from the existing operation.
    Replayed,
    /// The provider reported success.
    Succeeded,
    /// The provider reported failure.
    Failed,
    /// The deadline passed first.
    TimedOut,
}

impl Outcome {
    /// Result string used on audit events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Replayed => "replayed",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
        }
    }
}

/// One counter in a [`OperationMetrics::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeCount {
    pub provider: ProviderKind,
    pub operation: OperationType,
    pub outcome: Outcome,
    pub count: u64,
}

/// Counters keyed by provider, operation type and outcome.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    counters: DashMap<(ProviderKind, OperationType, Outcome), u64>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment one counter.
    pub fn record(&self, provider: ProviderKind, operation: OperationType, outcome: Outcome) {
        *self
            .counters
            .entry((provider, operation, outcome))
            .or_insert(0) += 1;
    }

    pub fn count(&self, provider: ProviderKind, operation: OperationType, outcome: Outcome) -> u64 {
        self.counters
            .get(&(provider, operation, outcome))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Every non-zero counter, in a stable order.
    pub fn snapshot(&self) -> Vec<OutcomeCount> {
        let mut counts: Vec<OutcomeCount> = self
            .counters
            .iter()
            .map(|entry| {
                let (provider, operation, outcome) = *entry.key();
                OutcomeCount {
                    provider,
                    operation,
                    outcome,
                    count: *entry.value(),
                }
            })
            .collect();
        counts.sort_by_key(|c| (c.provider, c.operation, c.outcome));
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = OperationMetrics::new();
        metrics.record(ProviderKind::Orchestrator, OperationType::Provision, Outcome::Failed);
        metrics.record(ProviderKind::Container, OperationType::Provision, Outcome::Succeeded);
        metrics.record(ProviderKind::Container, OperationType::Provision, Outcome::Succeeded);

        assert_eq!(
            metrics.count(ProviderKind::Container, OperationType::Provision, Outcome::Succeeded),
            2
        );
        assert_eq!(
            metrics.count(ProviderKind::Container, OperationType::Deprovision, Outcome::Succeeded),
            0
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].provider, ProviderKind::Container);
        assert_eq!(snapshot[1].outcome, Outcome::Failed);
    }
}
