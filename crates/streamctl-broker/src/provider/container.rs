// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local container driver (docker CLI).
//!
//! Each instance gets a private bridge network, one ZooKeeper container and
//! `cluster_size` broker containers, each with its own named volume. Every
//! object carries the `streamctl.instance` label, so teardown and probing work
//! from labels alone and survive a broker restart.
//!
//! Readiness means every expected broker container is running and answers an
//! ApiVersions request (`kafka-broker-api-versions`) on its internal listener.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use streamctl_core::ProviderKind;
use tracing::{debug, info, warn};

use super::command::CliCommand;
use super::spec::ClusterSpec;
use super::traits::*;
use crate::config::{env_secs, env_string};

const LABEL_INSTANCE: &str = "streamctl.instance";
const LABEL_ROLE: &str = "streamctl.role";
const LABEL_BROKER_ID: &str = "streamctl.broker-id";
const LABEL_PORT: &str = "streamctl.external-port";

const ROLE_BROKER: &str = "broker";
const ROLE_ZOOKEEPER: &str = "zookeeper";

/// Port of the broker listener used between containers.
const INTERNAL_PORT: u16 = 29092;
const ZOOKEEPER_PORT: u16 = 2181;

/// Container driver configuration.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// docker CLI binary
    pub docker_binary: String,
    /// Broker image
    pub kafka_image: String,
    /// ZooKeeper image
    pub zookeeper_image: String,
    /// Host name advertised to clients
    pub advertised_host: String,
    /// Operation deadline
    pub max_duration: Duration,
    /// Readiness poll interval
    pub poll_interval: Duration,
    /// Timeout for a single docker invocation
    pub command_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            kafka_image: "confluentinc/cp-kafka:7.4.0".to_string(),
            zookeeper_image: "confluentinc/cp-zookeeper:7.4.0".to_string(),
            advertised_host: "localhost".to_string(),
            max_duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            command_timeout: Duration::from_secs(120),
        }
    }
}

impl ContainerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STREAMCTL_DOCKER_BIN` (default: docker)
    /// - `STREAMCTL_CONTAINER_KAFKA_IMAGE` / `STREAMCTL_CONTAINER_ZOOKEEPER_IMAGE`
    /// - `STREAMCTL_CONTAINER_ADVERTISED_HOST` (default: localhost)
    /// - `STREAMCTL_CONTAINER_MAX_DURATION_SECS` (default: 300)
    /// - `STREAMCTL_CONTAINER_POLL_INTERVAL_SECS` (default: 2)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            docker_binary: env_string("STREAMCTL_DOCKER_BIN", &defaults.docker_binary),
            kafka_image: env_string("STREAMCTL_CONTAINER_KAFKA_IMAGE", &defaults.kafka_image),
            zookeeper_image: env_string(
                "STREAMCTL_CONTAINER_ZOOKEEPER_IMAGE",
                &defaults.zookeeper_image,
            ),
            advertised_host: env_string(
                "STREAMCTL_CONTAINER_ADVERTISED_HOST",
                &defaults.advertised_host,
            ),
            max_duration: env_secs(
                "STREAMCTL_CONTAINER_MAX_DURATION_SECS",
                defaults.max_duration,
            ),
            poll_interval: env_secs(
                "STREAMCTL_CONTAINER_POLL_INTERVAL_SECS",
                defaults.poll_interval,
            ),
            command_timeout: defaults.command_timeout,
        }
    }
}

fn network_name(instance_id: &str) -> String {
    format!("streamctl-{}-net", instance_id)
}

fn zookeeper_name(instance_id: &str) -> String {
    format!("streamctl-{}-zookeeper", instance_id)
}

fn broker_name(instance_id: &str, broker_id: u32) -> String {
    format!("streamctl-{}-kafka-{}", instance_id, broker_id)
}

fn volume_name(container: &str) -> String {
    format!("{}-data", container)
}

/// One row of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// A container belonging to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerState {
    name: String,
    state: String,
    role: String,
    broker_id: Option<u32>,
    external_port: Option<u16>,
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_ps_output(stdout: &str) -> Result<Vec<ContainerState>> {
    let mut containers = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row: PsRow = serde_json::from_str(line).map_err(|e| ProviderError::InvalidOutput {
            step: "docker ps".to_string(),
            message: e.to_string(),
        })?;
        let labels = parse_labels(&row.labels);
        containers.push(ContainerState {
            name: row.names,
            state: row.state,
            role: labels.get(LABEL_ROLE).cloned().unwrap_or_default(),
            broker_id: labels.get(LABEL_BROKER_ID).and_then(|v| v.parse().ok()),
            external_port: labels.get(LABEL_PORT).and_then(|v| v.parse().ok()),
        });
    }
    Ok(containers)
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

/// Pick a free host port. The listener is dropped before docker binds it.
fn allocate_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Container driver.
pub struct ContainerDriver {
    config: ContainerConfig,
}

impl ContainerDriver {
    /// Create a driver.
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Create a driver configured from the environment.
    pub fn from_env() -> Self {
        Self::new(ContainerConfig::from_env())
    }

    fn docker(&self, step: impl Into<String>) -> CliCommand {
        CliCommand::new(&self.config.docker_binary, step).timeout(self.config.command_timeout)
    }

    fn zookeeper_run_args(&self, instance_id: &str, port: u16) -> Vec<String> {
        let name = zookeeper_name(instance_id);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--hostname".into(),
            name.clone(),
            "--network".into(),
            network_name(instance_id),
            "--restart".into(),
            "unless-stopped".into(),
        ];
        for (key, value) in [
            (LABEL_INSTANCE, instance_id.to_string()),
            (LABEL_ROLE, ROLE_ZOOKEEPER.to_string()),
            (LABEL_PORT, port.to_string()),
        ] {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            "-p".into(),
            format!("{}:{}", port, ZOOKEEPER_PORT),
            "-v".into(),
            format!("{}:/var/lib/zookeeper/data", volume_name(&name)),
            "-e".into(),
            format!("ZOOKEEPER_CLIENT_PORT={}", ZOOKEEPER_PORT),
            "-e".into(),
            "ZOOKEEPER_TICK_TIME=2000".into(),
            self.config.zookeeper_image.clone(),
        ]);
        args
    }

    fn broker_run_args(
        &self,
        instance_id: &str,
        cluster: &ClusterSpec,
        broker_id: u32,
        port: u16,
    ) -> Vec<String> {
        let name = broker_name(instance_id, broker_id);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--hostname".into(),
            name.clone(),
            "--network".into(),
            network_name(instance_id),
            "--restart".into(),
            "unless-stopped".into(),
        ];
        for (key, value) in [
            (LABEL_INSTANCE, instance_id.to_string()),
            (LABEL_ROLE, ROLE_BROKER.to_string()),
            (LABEL_BROKER_ID, broker_id.to_string()),
            (LABEL_PORT, port.to_string()),
        ] {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            "-p".into(),
            format!("{}:{}", port, port),
            "-v".into(),
            format!("{}:/var/lib/kafka/data", volume_name(&name)),
        ]);

        let mut env = vec![
            ("KAFKA_BROKER_ID".to_string(), broker_id.to_string()),
            (
                "KAFKA_ZOOKEEPER_CONNECT".to_string(),
                format!("{}:{}", zookeeper_name(instance_id), ZOOKEEPER_PORT),
            ),
            (
                "KAFKA_LISTENERS".to_string(),
                format!(
                    "INTERNAL://0.0.0.0:{},EXTERNAL://0.0.0.0:{}",
                    INTERNAL_PORT, port
                ),
            ),
            (
                "KAFKA_ADVERTISED_LISTENERS".to_string(),
                format!(
                    "INTERNAL://{}:{},EXTERNAL://{}:{}",
                    name, INTERNAL_PORT, self.config.advertised_host, port
                ),
            ),
            (
                "KAFKA_LISTENER_SECURITY_PROTOCOL_MAP".to_string(),
                "INTERNAL:PLAINTEXT,EXTERNAL:PLAINTEXT".to_string(),
            ),
            (
                "KAFKA_INTER_BROKER_LISTENER_NAME".to_string(),
                "INTERNAL".to_string(),
            ),
        ];
        env.extend(cluster.broker_environment());
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.config.kafka_image.clone());
        args
    }

    async fn create_volume(&self, instance_id: &str, name: &str) -> Result<()> {
        self.docker("docker volume create")
            .args(["volume", "create", "--label"])
            .arg(format!("{}={}", LABEL_INSTANCE, instance_id))
            .arg(name)
            .run()
            .await?;
        Ok(())
    }

    async fn create_zookeeper(&self, instance_id: &str, created: &mut Vec<String>) -> Result<()> {
        let name = zookeeper_name(instance_id);
        let volume = volume_name(&name);
        self.create_volume(instance_id, &volume).await?;
        created.push(format!("volume:{}", volume));

        let port = allocate_port()?;
        self.docker("start zookeeper container")
            .args(self.zookeeper_run_args(instance_id, port))
            .run()
            .await?;
        created.push(format!("container:{}", name));
        Ok(())
    }

    async fn create_broker(
        &self,
        instance_id: &str,
        cluster: &ClusterSpec,
        broker_id: u32,
        created: &mut Vec<String>,
    ) -> Result<()> {
        let name = broker_name(instance_id, broker_id);
        let volume = volume_name(&name);
        self.create_volume(instance_id, &volume).await?;
        created.push(format!("volume:{}", volume));

        let port = allocate_port()?;
        self.docker(format!("start broker {}", broker_id))
            .args(self.broker_run_args(instance_id, cluster, broker_id, port))
            .run()
            .await?;
        created.push(format!("container:{}", name));
        debug!(instance_id = %instance_id, broker_id, port, "Broker container started");
        Ok(())
    }

    async fn list_containers(&self, instance_id: &str) -> Result<Vec<ContainerState>> {
        let stdout = self
            .docker("docker ps")
            .args(["ps", "-a", "--filter"])
            .arg(format!("label={}={}", LABEL_INSTANCE, instance_id))
            .args(["--format", "{{json .}}"])
            .run()
            .await?;
        parse_ps_output(&stdout)
    }

    async fn broker_answers(&self, container: &str) -> bool {
        let result = self
            .docker("broker api versions")
            .timeout(Duration::from_secs(30))
            .args(["exec", container, "kafka-broker-api-versions"])
            .arg("--bootstrap-server")
            .arg(format!("localhost:{}", INTERNAL_PORT))
            .output()
            .await;
        matches!(result, Ok(ref out) if out.success())
    }

    async fn probe(&self, instance_id: &str, expected_brokers: Option<u32>) -> Result<ProbeStatus> {
        let containers = self.list_containers(instance_id).await?;
        if containers.is_empty() {
            return Ok(ProbeStatus::Failed(
                "no containers found for instance".to_string(),
            ));
        }

        if let Some(dead) = containers
            .iter()
            .find(|c| c.state == "exited" || c.state == "dead")
        {
            return Ok(ProbeStatus::Failed(format!(
                "container {} is {}",
                dead.name, dead.state
            )));
        }

        let Some(zookeeper) = containers.iter().find(|c| c.role == ROLE_ZOOKEEPER) else {
            return Ok(ProbeStatus::Failed(
                "coordination container is missing".to_string(),
            ));
        };

        let mut brokers: Vec<&ContainerState> =
            containers.iter().filter(|c| c.role == ROLE_BROKER).collect();
        brokers.sort_by_key(|c| c.broker_id);

        let expected = expected_brokers.unwrap_or(brokers.len() as u32);
        if brokers.is_empty() || brokers.len() as u32 != expected {
            return Ok(ProbeStatus::Pending);
        }
        if containers.iter().any(|c| c.state != "running") {
            return Ok(ProbeStatus::Pending);
        }

        for broker in &brokers {
            if !self.broker_answers(&broker.name).await {
                return Ok(ProbeStatus::Pending);
            }
        }

        let host = &self.config.advertised_host;
        let bootstrap_servers = brokers
            .iter()
            .filter_map(|b| b.external_port)
            .map(|port| format!("{}:{}", host, port))
            .collect::<Vec<_>>();
        let zookeeper_connect = zookeeper
            .external_port
            .map(|port| format!("{}:{}", host, port))
            .unwrap_or_default();

        Ok(ProbeStatus::Ready(Some(
            ConnectionInfo::plaintext(bootstrap_servers, zookeeper_connect)
                .with_property("network", network_name(instance_id)),
        )))
    }

    async fn wait_ready(&self, instance_id: &str, expected_brokers: u32) -> Result<ConnectionInfo> {
        loop {
            match self.probe(instance_id, Some(expected_brokers)).await? {
                ProbeStatus::Ready(Some(info)) => return Ok(info),
                ProbeStatus::Failed(message) => {
                    return Err(ProviderError::step_failed("readiness check", message));
                }
                ProbeStatus::Ready(None) | ProbeStatus::Pending => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn provision_steps(
        &self,
        spec: &ProvisionSpec,
        created: &mut Vec<String>,
    ) -> Result<ConnectionInfo> {
        let id = &spec.instance_id;

        let network = network_name(id);
        self.docker("docker network create")
            .args(["network", "create", "--label"])
            .arg(format!("{}={}", LABEL_INSTANCE, id))
            .arg(&network)
            .run()
            .await?;
        created.push(format!("network:{}", network));

        self.create_zookeeper(id, created).await?;
        for broker_id in 1..=spec.cluster.cluster_size {
            self.create_broker(id, &spec.cluster, broker_id, created)
                .await?;
        }

        self.wait_ready(id, spec.cluster.cluster_size).await
    }

    async fn remove_containers(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let output = self
            .docker("docker rm")
            .args(["rm", "-f"])
            .args(names.iter().cloned())
            .output()
            .await?;
        if !output.success() && !is_missing(&output.stderr) {
            return Err(ProviderError::step_failed("docker rm", output.stderr_tail()));
        }
        Ok(())
    }

    async fn remove_volumes(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let output = self
            .docker("docker volume rm")
            .args(["volume", "rm", "-f"])
            .args(names.iter().cloned())
            .output()
            .await?;
        if !output.success() && !is_missing(&output.stderr) {
            return Err(ProviderError::step_failed(
                "docker volume rm",
                output.stderr_tail(),
            ));
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let output = self
            .docker("docker network rm")
            .args(["network", "rm", name])
            .output()
            .await?;
        if !output.success() && !is_missing(&output.stderr) {
            return Err(ProviderError::step_failed(
                "docker network rm",
                output.stderr_tail(),
            ));
        }
        Ok(())
    }

    async fn labelled(&self, object: &str, instance_id: &str) -> Result<Vec<String>> {
        let mut cmd = self.docker(format!("docker {} ls", object));
        cmd = if object == "container" {
            cmd.args(["ps", "-aq"])
        } else {
            cmd.args([object, "ls", "-q"])
        };
        let stdout = cmd
            .arg("--filter")
            .arg(format!("label={}={}", LABEL_INSTANCE, instance_id))
            .run()
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl ProviderDriver for ContainerDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Container
    }

    fn cadence(&self) -> ProviderCadence {
        ProviderCadence {
            max_duration: self.config.max_duration,
            poll_interval: self.config.poll_interval,
        }
    }

    fn check_parameters(&self, parameters: &Value) -> Result<ClusterSpec> {
        let spec = ClusterSpec::from_parameters(parameters)?;
        spec.require_plaintext("container")?;
        spec.reject_cloud_placement("container")?;
        Ok(spec)
    }

    fn update_footprint(
        &self,
        instance_id: &str,
        previous: &ClusterSpec,
        next: &ClusterSpec,
    ) -> Vec<String> {
        (previous.cluster_size + 1..=next.cluster_size)
            .flat_map(|broker_id| {
                let name = broker_name(instance_id, broker_id);
                [
                    format!("container:{}", name),
                    format!("volume:{}", volume_name(&name)),
                ]
            })
            .collect()
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        info!(
            instance_id = %spec.instance_id,
            brokers = spec.cluster.cluster_size,
            "Provisioning container cluster"
        );
        let mut created = Vec::new();
        self.provision_steps(spec, &mut created)
            .await
            .map_err(|e| e.with_partial(&created))
    }

    /// Add or remove brokers to match `cluster_size`. Existing brokers keep
    /// the settings they were started with.
    async fn update(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        let id = &spec.instance_id;
        let containers = self.list_containers(id).await?;
        if !containers.iter().any(|c| c.role == ROLE_ZOOKEEPER) {
            return Err(ProviderError::step_failed(
                "update",
                "coordination container is missing",
            ));
        }

        let desired = spec.cluster.cluster_size;
        let existing: Vec<u32> = containers
            .iter()
            .filter(|c| c.role == ROLE_BROKER)
            .filter_map(|c| c.broker_id)
            .collect();

        let surplus: Vec<String> = existing
            .iter()
            .filter(|&&broker_id| broker_id > desired)
            .map(|&broker_id| broker_name(id, broker_id))
            .collect();
        if !surplus.is_empty() {
            info!(instance_id = %id, removed = surplus.len(), "Scaling down brokers");
            self.remove_containers(&surplus).await?;
            let volumes: Vec<String> = surplus.iter().map(|n| volume_name(n)).collect();
            self.remove_volumes(&volumes).await?;
        }

        let mut created = Vec::new();
        for broker_id in (1..=desired).filter(|b| !existing.contains(b)) {
            if let Err(e) = self
                .create_broker(id, &spec.cluster, broker_id, &mut created)
                .await
            {
                return Err(e.with_partial(&created));
            }
        }

        self.wait_ready(id, desired)
            .await
            .map_err(|e| e.with_partial(&created))
    }

    async fn deprovision(&self, resource: &ResourceRef) -> Result<()> {
        let id = &resource.instance_id;

        if !resource.sub_resources.is_empty() {
            let mut containers = Vec::new();
            let mut volumes = Vec::new();
            let mut networks = Vec::new();
            for entry in &resource.sub_resources {
                match entry.split_once(':') {
                    Some(("container", name)) => containers.push(name.to_string()),
                    Some(("volume", name)) => volumes.push(name.to_string()),
                    Some(("network", name)) => networks.push(name.to_string()),
                    _ => warn!(instance_id = %id, sub_resource = %entry, "Ignoring unknown sub-resource"),
                }
            }
            self.remove_containers(&containers).await?;
            self.remove_volumes(&volumes).await?;
            for network in networks {
                self.remove_network(&network).await?;
            }
            return Ok(());
        }

        info!(instance_id = %id, "Removing container cluster");
        let containers = self.labelled("container", id).await?;
        self.remove_containers(&containers).await?;
        let volumes = self.labelled("volume", id).await?;
        self.remove_volumes(&volumes).await?;
        self.remove_network(&network_name(id)).await
    }

    async fn probe_status(&self, resource: &ResourceRef) -> Result<ProbeStatus> {
        self.probe(
            &resource.instance_id,
            resource.expected.as_ref().map(|c| c.cluster_size),
        )
        .await
    }

    async fn validate(&self) -> Result<()> {
        let version = self
            .docker("docker version")
            .timeout(Duration::from_secs(15))
            .args(["version", "--format", "{{.Server.Version}}"])
            .run()
            .await
            .map_err(|e| match e {
                ProviderError::StepFailed { message, .. } => {
                    ProviderError::Unavailable(format!("docker daemon not reachable: {}", message))
                }
                other => other,
            })?;
        debug!(version = %version.trim(), "docker daemon reachable");
        Ok(())
    }
}
