// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service catalog.
//!
//! The statically configured set of services and plans, and the providers
//! each plan is offered on. Provision requests are checked against it before
//! they reach the engine.

use std::path::Path;

use serde::{Deserialize, Serialize};
use streamctl_core::ProviderKind;

use crate::config::ConfigError;
use crate::error::{Error, Result};

/// Service catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Offered services.
    pub services: Vec<ServiceOffering>,
}

/// One offered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    /// Whether instances may move between plans.
    #[serde(default)]
    pub plan_updateable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub plans: Vec<Plan>,
}

/// One plan of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub free: bool,
    /// Providers the plan is offered on; empty means every registered provider.
    #[serde(default)]
    pub providers: Vec<ProviderKind>,
}

impl Plan {
    fn new(id: &str, name: &str, description: &str, free: bool, providers: &[ProviderKind]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            free,
            providers: providers.to_vec(),
        }
    }

    /// Whether the plan can be provisioned on `provider`.
    pub fn offered_on(&self, provider: ProviderKind) -> bool {
        self.providers.is_empty() || self.providers.contains(&provider)
    }
}

impl Catalog {
    /// Built-in catalog: one Kafka service whose plans are offered on every
    /// provider in `providers`.
    pub fn default_for(providers: &[ProviderKind]) -> Self {
        Self {
            services: vec![ServiceOffering {
                id: "kafka-service".to_string(),
                name: "Apache Kafka".to_string(),
                description: "Distributed streaming platform".to_string(),
                bindable: true,
                plan_updateable: false,
                tags: vec![
                    "kafka".to_string(),
                    "streaming".to_string(),
                    "messaging".to_string(),
                ],
                plans: vec![
                    Plan::new(
                        "basic",
                        "Basic",
                        "Single-node Kafka cluster for development",
                        true,
                        providers,
                    ),
                    Plan::new(
                        "standard",
                        "Standard",
                        "Multi-node Kafka cluster for production",
                        false,
                        providers,
                    ),
                    Plan::new(
                        "premium",
                        "Premium",
                        "High-availability Kafka cluster with SSL/SASL",
                        false,
                        providers,
                    ),
                ],
            }],
        }
    }

    /// Load a catalog from a JSON file.
    pub fn from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidCatalog {
            path: path.to_path_buf(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let catalog: Catalog = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
        if catalog.services.is_empty() {
            return Err(invalid("catalog offers no services".to_string()));
        }
        Ok(catalog)
    }

    /// Service by ID.
    pub fn service(&self, service_id: &str) -> Option<&ServiceOffering> {
        self.services.iter().find(|s| s.id == service_id)
    }

    /// Check that `service_id/plan_id` exists and is offered on `provider`.
    pub fn check(&self, service_id: &str, plan_id: &str, provider: ProviderKind) -> Result<&Plan> {
        let service = self
            .service(service_id)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown service_id '{}'", service_id)))?;
        let plan = service
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "unknown plan_id '{}' for service '{}'",
                    plan_id, service_id
                ))
            })?;
        if !plan.offered_on(provider) {
            return Err(Error::InvalidRequest(format!(
                "plan '{}' is not offered on provider '{}'",
                plan_id, provider
            )));
        }
        Ok(plan)
    }
}
