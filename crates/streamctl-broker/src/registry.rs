// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider registry.
//!
//! Maps a persisted [`ProviderKind`] to the driver that serves it. The registry
//! is built once at startup and passed to the engine and scheduler explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use streamctl_core::ProviderKind;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::{ContainerDriver, IacDriver, OrchestratorDriver, ProviderDriver};

/// Outcome of validating one driver.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderValidation {
    /// Provider that was checked.
    pub provider: ProviderKind,
    /// Whether tooling and credentials are usable.
    pub available: bool,
    /// Failure detail when unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time the check took.
    pub duration_ms: u64,
}

/// Registry of provider drivers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    drivers: BTreeMap<ProviderKind, Arc<dyn ProviderDriver>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the drivers enabled in `config`, each configured from the environment.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for kind in &config.providers {
            let driver: Arc<dyn ProviderDriver> = match kind {
                ProviderKind::Container => Arc::new(ContainerDriver::from_env()),
                ProviderKind::Orchestrator => Arc::new(OrchestratorDriver::from_env()),
                ProviderKind::InfraAsCode => Arc::new(IacDriver::from_env()),
            };
            registry.register(driver);
        }
        info!(providers = ?registry.kinds(), "Provider registry initialized");
        registry
    }

    /// Register a driver, replacing any previous driver for its kind.
    pub fn register(&mut self, driver: Arc<dyn ProviderDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, driver: Arc<dyn ProviderDriver>) -> Self {
        self.register(driver);
        self
    }

    /// Driver for `kind`.
    pub fn resolve(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderDriver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::ProviderUnavailable {
                provider: kind,
                message: "no driver registered".to_string(),
            })
    }

    /// Whether a driver is registered for `kind`.
    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.drivers.contains_key(&kind)
    }

    /// Registered provider kinds.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.drivers.keys().copied().collect()
    }

    /// Validate every registered driver concurrently.
    pub async fn validate_all(&self) -> Vec<ProviderValidation> {
        let checks = self.drivers.values().cloned().map(|driver| {
            tokio::spawn(async move {
                let started = Instant::now();
                let result = driver.validate().await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(()) => ProviderValidation {
                        provider: driver.kind(),
                        available: true,
                        message: None,
                        duration_ms,
                    },
                    Err(e) => {
                        warn!(provider = %driver.kind(), error = %e, "Provider validation failed");
                        ProviderValidation {
                            provider: driver.kind(),
                            available: false,
                            message: Some(e.to_string()),
                            duration_ms,
                        }
                    }
                }
            })
        });
        let handles: Vec<_> = checks.collect();

        let mut report = Vec::with_capacity(handles.len());
        for (handle, kind) in handles.into_iter().zip(self.kinds()) {
            match handle.await {
                Ok(validation) => report.push(validation),
                Err(e) => report.push(ProviderValidation {
                    provider: kind,
                    available: false,
                    message: Some(format!("validation task failed: {}", e)),
                    duration_ms: 0,
                }),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[test]
    fn test_resolve_unregistered_provider() {
        let registry =
            ProviderRegistry::new().with(Arc::new(MockProvider::new(ProviderKind::Container)));

        assert!(registry.resolve(ProviderKind::Container).is_ok());
        let err = registry.resolve(ProviderKind::InfraAsCode).err().unwrap();
        assert!(matches!(
            err,
            Error::ProviderUnavailable {
                provider: ProviderKind::InfraAsCode,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_validate_all_reports_each_provider() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider::new(ProviderKind::Container)))
            .with(Arc::new(
                MockProvider::new(ProviderKind::Orchestrator).unavailable(),
            ));

        let report = registry.validate_all().await;
        assert_eq!(report.len(), 2);
        assert!(report[0].available);
        assert_eq!(report[1].provider, ProviderKind::Orchestrator);
        assert!(!report[1].available);
        assert!(report[1].message.as_deref().unwrap().contains("mock backend disabled"));
    }
}
