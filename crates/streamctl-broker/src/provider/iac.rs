// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infrastructure-as-code driver (terraform CLI).
//!
//! Each instance owns a working directory under `work_dir` holding a generated
//! `main.tf.json` that instantiates the configured cluster module. Provisioning
//! runs `init`, `plan -out`, `apply`, then a second `plan -detailed-exitcode`
//! to confirm there is no drift, and finally reads `output -json`. The module
//! must expose `bootstrap_servers` and `zookeeper_connect` outputs.
//!
//! Teardown always destroys the whole working directory's state, so partial
//! sub-resources reported for a failed apply are informational only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use streamctl_core::ProviderKind;
use tracing::{debug, info};

use super::command::CliCommand;
use super::spec::{CloudProvider, ClusterSpec};
use super::traits::*;
use crate::config::{env_secs, env_string};

const MAIN_FILE: &str = "main.tf.json";
const STATE_FILE: &str = "terraform.tfstate";
const PLAN_FILE: &str = "tfplan";
const MODULE_NAME: &str = "kafka_cluster";

/// Infrastructure-as-code driver configuration.
#[derive(Debug, Clone)]
pub struct IacConfig {
    /// terraform CLI binary
    pub terraform_binary: String,
    /// Parent of the per-instance working directories
    pub work_dir: PathBuf,
    /// Module source; relative paths resolve from the instance directory
    pub module_source: String,
    /// Cloud used when a request names none
    pub default_cloud: CloudProvider,
    /// Operation deadline, also the apply and destroy timeout
    pub max_duration: Duration,
    /// Readiness poll interval
    pub poll_interval: Duration,
    /// Timeout for init and plan
    pub command_timeout: Duration,
}

impl Default for IacConfig {
    fn default() -> Self {
        Self {
            terraform_binary: "terraform".to_string(),
            work_dir: PathBuf::from(".data/terraform"),
            module_source: "../modules/kafka-cluster".to_string(),
            default_cloud: CloudProvider::Aws,
            max_duration: Duration::from_secs(45 * 60),
            poll_interval: Duration::from_secs(30),
            command_timeout: Duration::from_secs(600),
        }
    }
}

impl IacConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STREAMCTL_TERRAFORM_BIN` (default: terraform)
    /// - `STREAMCTL_IAC_WORK_DIR` (default: .data/terraform)
    /// - `STREAMCTL_IAC_MODULE_SOURCE` (default: ../modules/kafka-cluster)
    /// - `STREAMCTL_IAC_DEFAULT_CLOUD` (aws, gcp or azure; default: aws)
    /// - `STREAMCTL_IAC_MAX_DURATION_SECS` (default: 2700)
    /// - `STREAMCTL_IAC_POLL_INTERVAL_SECS` (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_cloud = std::env::var("STREAMCTL_IAC_DEFAULT_CLOUD")
            .ok()
            .and_then(|v| serde_json::from_value(Value::String(v.to_ascii_lowercase())).ok())
            .unwrap_or(defaults.default_cloud);

        Self {
            terraform_binary: env_string("STREAMCTL_TERRAFORM_BIN", &defaults.terraform_binary),
            work_dir: std::env::var("STREAMCTL_IAC_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            module_source: env_string("STREAMCTL_IAC_MODULE_SOURCE", &defaults.module_source),
            default_cloud,
            max_duration: env_secs("STREAMCTL_IAC_MAX_DURATION_SECS", defaults.max_duration),
            poll_interval: env_secs("STREAMCTL_IAC_POLL_INTERVAL_SECS", defaults.poll_interval),
            command_timeout: defaults.command_timeout,
        }
    }
}

fn security_protocol(cluster: &ClusterSpec) -> &'static str {
    match (cluster.enable_ssl, cluster.enable_sasl) {
        (false, false) => "PLAINTEXT",
        (true, false) => "SSL",
        (false, true) => "SASL_PLAINTEXT",
        (true, true) => "SASL_SSL",
    }
}

fn missing_output(name: &str) -> ProviderError {
    ProviderError::InvalidOutput {
        step: "terraform output".to_string(),
        message: format!("required output '{}' is missing or empty", name),
    }
}

/// Build connection info from `terraform output -json`.
fn parse_outputs(stdout: &str, cluster: Option<&ClusterSpec>) -> Result<ConnectionInfo> {
    let outputs: Value =
        serde_json::from_str(stdout).map_err(|e| ProviderError::InvalidOutput {
            step: "terraform output".to_string(),
            message: e.to_string(),
        })?;
    let value = |name: &str| outputs.get(name).and_then(|o| o.get("value"));

    let bootstrap_servers: Vec<String> = match value("bootstrap_servers") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        Some(Value::String(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };
    if bootstrap_servers.is_empty() {
        return Err(missing_output("bootstrap_servers"));
    }

    let zookeeper_connect = value("zookeeper_connect")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing_output("zookeeper_connect"))?;

    let protocol = value("security_protocol")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| {
            cluster
                .map(security_protocol)
                .unwrap_or("PLAINTEXT")
                .to_string()
        });

    let mut info = ConnectionInfo::plaintext(bootstrap_servers, zookeeper_connect);
    info.security_protocol = protocol;
    if let Some(cluster_id) = value("cluster_id").and_then(Value::as_str) {
        info = info.with_property("cluster_id", cluster_id);
    }
    Ok(info)
}

/// Infrastructure-as-code driver.
pub struct IacDriver {
    config: IacConfig,
}

impl IacDriver {
    /// Create a driver.
    pub fn new(config: IacConfig) -> Self {
        Self { config }
    }

    /// Create a driver configured from the environment.
    pub fn from_env() -> Self {
        Self::new(IacConfig::from_env())
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.config.work_dir.join(instance_id)
    }

    fn terraform(&self, dir: &Path, step: &str) -> CliCommand {
        CliCommand::new(&self.config.terraform_binary, step)
            .current_dir(dir)
            .timeout(self.config.command_timeout)
    }

    /// Root module for one instance.
    fn main_config(&self, instance_id: &str, cluster: &ClusterSpec) -> Value {
        let cloud = cluster.cloud_provider.unwrap_or(self.config.default_cloud);
        let region = cluster
            .region
            .clone()
            .unwrap_or_else(|| cloud.default_region().to_string());
        let instance_type = cluster
            .instance_type
            .clone()
            .unwrap_or_else(|| cloud.default_instance_type().to_string());

        json!({
            "module": {
                MODULE_NAME: {
                    "source": self.config.module_source,
                    "cluster_name": instance_id,
                    "cloud_provider": cloud.as_str(),
                    "region": region,
                    "instance_type": instance_type,
                    "cluster_size": cluster.cluster_size,
                    "replication_factor": cluster.replication_factor,
                    "partition_count": cluster.partition_count,
                    "retention_hours": cluster.retention_hours,
                    "storage_size_gb": cluster.storage_size_gb,
                    "enable_ssl": cluster.enable_ssl,
                    "enable_sasl": cluster.enable_sasl,
                    "custom_properties": cluster.custom_properties,
                }
            },
            "output": {
                "bootstrap_servers": { "value": format!("${{module.{}.bootstrap_servers}}", MODULE_NAME) },
                "zookeeper_connect": { "value": format!("${{module.{}.zookeeper_connect}}", MODULE_NAME) },
            }
        })
    }

    async fn write_config(&self, dir: &Path, instance_id: &str, cluster: &ClusterSpec) -> Result<()> {
        let body = serde_json::to_string_pretty(&self.main_config(instance_id, cluster))
            .map_err(|e| ProviderError::step_failed("render configuration", e.to_string()))?;
        tokio::fs::write(dir.join(MAIN_FILE), body).await?;
        Ok(())
    }

    async fn init(&self, dir: &Path) -> Result<()> {
        self.terraform(dir, "terraform init")
            .args(["init", "-input=false", "-no-color"])
            .run()
            .await?;
        Ok(())
    }

    /// Exit code of `plan -detailed-exitcode`: 0 clean, 2 pending changes.
    async fn drift(&self, dir: &Path) -> Result<i32> {
        let output = self
            .terraform(dir, "terraform plan (drift check)")
            .args([
                "plan",
                "-input=false",
                "-no-color",
                "-lock=false",
                "-detailed-exitcode",
            ])
            .output()
            .await?;
        match output.code {
            Some(code @ (0 | 2)) => Ok(code),
            _ => Err(ProviderError::step_failed(
                "terraform plan (drift check)",
                output.stderr_tail(),
            )),
        }
    }

    async fn outputs(&self, dir: &Path, cluster: Option<&ClusterSpec>) -> Result<ConnectionInfo> {
        let stdout = self
            .terraform(dir, "terraform output")
            .timeout(Duration::from_secs(60))
            .args(["output", "-json", "-no-color"])
            .run()
            .await?;
        parse_outputs(&stdout, cluster)
    }

    async fn converge(
        &self,
        spec: &ProvisionSpec,
        created: &mut Vec<String>,
    ) -> Result<ConnectionInfo> {
        let dir = self.instance_dir(&spec.instance_id);
        tokio::fs::create_dir_all(&dir).await?;
        if !created.iter().any(|c| c == "workdir") {
            created.push("workdir".to_string());
        }
        self.write_config(&dir, &spec.instance_id, &spec.cluster)
            .await?;

        self.init(&dir).await?;
        self.terraform(&dir, "terraform plan")
            .args([
                "plan",
                "-input=false",
                "-no-color",
                &format!("-out={}", PLAN_FILE),
            ])
            .run()
            .await?;

        created.push("state".to_string());
        self.terraform(&dir, "terraform apply")
            .timeout(self.config.max_duration)
            .args(["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE])
            .run()
            .await?;

        if self.drift(&dir).await? != 0 {
            return Err(ProviderError::step_failed(
                "terraform plan (drift check)",
                "plan reports pending changes after apply",
            ));
        }

        self.outputs(&dir, Some(&spec.cluster)).await
    }
}

#[async_trait]
impl ProviderDriver for IacDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::InfraAsCode
    }

    fn cadence(&self) -> ProviderCadence {
        ProviderCadence {
            max_duration: self.config.max_duration,
            poll_interval: self.config.poll_interval,
        }
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        info!(
            instance_id = %spec.instance_id,
            brokers = spec.cluster.cluster_size,
            "Provisioning infrastructure-as-code cluster"
        );
        let mut created = Vec::new();
        self.converge(spec, &mut created)
            .await
            .map_err(|e| e.with_partial(&created))
    }

    async fn update(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        info!(instance_id = %spec.instance_id, "Applying updated module variables");
        // Terraform state is only ever destroyed whole, so a failed update
        // reports nothing removable and the existing cluster stays in place.
        self.converge(spec, &mut Vec::new()).await
    }

    async fn deprovision(&self, resource: &ResourceRef) -> Result<()> {
        let dir = self.instance_dir(&resource.instance_id);
        if !tokio::fs::try_exists(&dir).await? {
            debug!(instance_id = %resource.instance_id, "No working directory, nothing to destroy");
            return Ok(());
        }

        if tokio::fs::try_exists(dir.join(MAIN_FILE)).await? {
            if !tokio::fs::try_exists(dir.join(".terraform")).await? {
                self.init(&dir).await?;
            }
            info!(instance_id = %resource.instance_id, "Destroying infrastructure");
            self.terraform(&dir, "terraform destroy")
                .timeout(self.config.max_duration)
                .args(["destroy", "-input=false", "-no-color", "-auto-approve"])
                .run()
                .await?;
        }

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn probe_status(&self, resource: &ResourceRef) -> Result<ProbeStatus> {
        let dir = self.instance_dir(&resource.instance_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(ProbeStatus::Failed(
                "no working directory for instance".to_string(),
            ));
        }
        if !tokio::fs::try_exists(dir.join(STATE_FILE)).await? {
            return Ok(ProbeStatus::Pending);
        }
        if let Some(expected) = &resource.expected {
            let written: Value = match tokio::fs::read_to_string(dir.join(MAIN_FILE)).await {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or(Value::Null),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
                Err(e) => return Err(e.into()),
            };
            if written != self.main_config(&resource.instance_id, expected) {
                return Ok(ProbeStatus::Pending);
            }
        }
        if self.drift(&dir).await? != 0 {
            return Ok(ProbeStatus::Pending);
        }
        match self.outputs(&dir, resource.expected.as_ref()).await {
            Ok(info) => Ok(ProbeStatus::Ready(Some(info))),
            Err(ProviderError::InvalidOutput { .. }) => Ok(ProbeStatus::Pending),
            Err(e) => Err(e),
        }
    }

    async fn validate(&self) -> Result<()> {
        let dir = std::env::temp_dir();
        let version = self
            .terraform(&dir, "terraform version")
            .timeout(Duration::from_secs(15))
            .args(["version", "-json"])
            .run()
            .await?;
        let parsed: Value = serde_json::from_str(&version).unwrap_or(Value::Null);
        debug!(
            version = parsed["terraform_version"].as_str().unwrap_or("unknown"),
            "terraform available"
        );
        Ok(())
    }
}
