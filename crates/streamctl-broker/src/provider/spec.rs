// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster parameter schema.
//!
//! Instance parameters are stored as an opaque document. Drivers parse them
//! into a [`ClusterSpec`] at the request boundary and reject anything they
//! cannot honour before an operation is claimed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::{ProviderError, Result};

/// Cloud targeted by the infrastructure-as-code driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services.
    Aws,
    /// Google Cloud.
    Gcp,
    /// Microsoft Azure.
    Azure,
}

impl CloudProvider {
    /// Module variable value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
            CloudProvider::Azure => "azure",
        }
    }

    /// Region used when the request names none.
    pub fn default_region(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "us-west-2",
            CloudProvider::Gcp => "us-central1",
            CloudProvider::Azure => "eastus",
        }
    }

    /// Broker machine type used when the request names none.
    pub fn default_instance_type(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "t3.medium",
            CloudProvider::Gcp => "e2-standard-2",
            CloudProvider::Azure => "Standard_B2s",
        }
    }
}

/// Validated cluster parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
    /// Number of brokers.
    #[serde(default = "default_cluster_size")]
    pub cluster_size: u32,
    /// Default topic replication factor.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    /// Default partitions per topic.
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
    /// Log retention.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,
    /// Volume size per broker.
    #[serde(default = "default_storage_size_gb")]
    pub storage_size_gb: u32,
    /// TLS on client listeners.
    #[serde(default)]
    pub enable_ssl: bool,
    /// SASL authentication on client listeners.
    #[serde(default)]
    pub enable_sasl: bool,
    /// Extra broker settings, forwarded verbatim.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// Target cloud (infrastructure-as-code only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<CloudProvider>,
    /// Target region (infrastructure-as-code only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Broker machine type (infrastructure-as-code only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

fn default_cluster_size() -> u32 {
    1
}

fn default_replication_factor() -> u32 {
    1
}

fn default_partition_count() -> u32 {
    3
}

fn default_retention_hours() -> u32 {
    168
}

fn default_storage_size_gb() -> u32 {
    10
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            cluster_size: default_cluster_size(),
            replication_factor: default_replication_factor(),
            partition_count: default_partition_count(),
            retention_hours: default_retention_hours(),
            storage_size_gb: default_storage_size_gb(),
            enable_ssl: false,
            enable_sasl: false,
            custom_properties: BTreeMap::new(),
            cloud_provider: None,
            region: None,
            instance_type: None,
        }
    }
}

fn invalid(message: impl Into<String>) -> ProviderError {
    ProviderError::InvalidParameters(message.into())
}

fn check_range(field: &str, value: u32, max: u32) -> Result<()> {
    if value == 0 || value > max {
        return Err(invalid(format!("{} must be between 1 and {}", field, max)));
    }
    Ok(())
}

impl ClusterSpec {
    /// Parse and validate request parameters. `null` means all defaults.
    pub fn from_parameters(parameters: &Value) -> Result<Self> {
        let spec: ClusterSpec = if parameters.is_null() {
            ClusterSpec::default()
        } else {
            serde_json::from_value(parameters.clone())
                .map_err(|e| invalid(format!("invalid parameters: {}", e)))?
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check ranges and cross-field rules.
    pub fn validate(&self) -> Result<()> {
        check_range("cluster_size", self.cluster_size, 10)?;
        check_range("replication_factor", self.replication_factor, 10)?;
        check_range("partition_count", self.partition_count, 1000)?;
        check_range("retention_hours", self.retention_hours, 8760)?;
        check_range("storage_size_gb", self.storage_size_gb, 1000)?;

        if self.replication_factor > self.cluster_size {
            return Err(invalid(format!(
                "replication_factor ({}) cannot exceed cluster_size ({})",
                self.replication_factor, self.cluster_size
            )));
        }

        for (key, value) in &self.custom_properties {
            let valid_key = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            if !valid_key {
                return Err(invalid(format!("invalid custom property name '{}'", key)));
            }
            if value.contains(['\n', '\r', '\0']) {
                return Err(invalid(format!(
                    "custom property '{}' contains control characters",
                    key
                )));
            }
        }

        if let Some(region) = &self.region
            && region.trim().is_empty()
        {
            return Err(invalid("region must not be empty"));
        }
        if let Some(instance_type) = &self.instance_type
            && instance_type.trim().is_empty()
        {
            return Err(invalid("instance_type must not be empty"));
        }

        Ok(())
    }

    /// Reject TLS and SASL for drivers that only run plaintext listeners.
    pub fn require_plaintext(&self, provider: &str) -> Result<()> {
        if self.enable_ssl || self.enable_sasl {
            return Err(invalid(format!(
                "enable_ssl and enable_sasl are not supported by the {} provider",
                provider
            )));
        }
        Ok(())
    }

    /// Reject cloud placement fields for drivers that do not use them.
    pub fn reject_cloud_placement(&self, provider: &str) -> Result<()> {
        if self.cloud_provider.is_some() || self.region.is_some() || self.instance_type.is_some() {
            return Err(invalid(format!(
                "cloud_provider, region and instance_type are not supported by the {} provider",
                provider
            )));
        }
        Ok(())
    }

    /// Replication factor for internal topics, bounded by the broker count.
    pub fn offsets_replication_factor(&self) -> u32 {
        self.replication_factor.min(self.cluster_size)
    }

    /// Broker settings as environment variables understood by the Confluent
    /// images: standard settings first, then custom properties.
    pub fn broker_environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR".to_string(),
                self.offsets_replication_factor().to_string(),
            ),
            (
                "KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR".to_string(),
                self.offsets_replication_factor().to_string(),
            ),
            (
                "KAFKA_TRANSACTION_STATE_LOG_MIN_ISR".to_string(),
                "1".to_string(),
            ),
            (
                "KAFKA_DEFAULT_REPLICATION_FACTOR".to_string(),
                self.replication_factor.to_string(),
            ),
            (
                "KAFKA_NUM_PARTITIONS".to_string(),
                self.partition_count.to_string(),
            ),
            (
                "KAFKA_LOG_RETENTION_HOURS".to_string(),
                self.retention_hours.to_string(),
            ),
        ];
        for (key, value) in &self.custom_properties {
            env.push((confluent_env_name(key), value.clone()));
        }
        env
    }
}

/// Map a broker property name to the environment variable the Confluent
/// images translate back into it.
pub fn confluent_env_name(property: &str) -> String {
    let mut name = String::from("KAFKA_");
    for c in property.chars() {
        match c {
            '.' => name.push('_'),
            '-' => name.push_str("__"),
            '_' => name.push_str("___"),
            other => name.push(other.to_ascii_uppercase()),
        }
    }
    name
}
