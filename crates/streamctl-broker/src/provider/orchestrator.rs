// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container orchestrator driver (kubectl CLI).
//!
//! An instance is declared as one manifest list applied to the configured
//! namespace:
//!
//! - ZooKeeper StatefulSet and its Service
//! - broker StatefulSet with a volume claim template per broker
//! - headless Service for stable broker DNS names
//! - client Service for bootstrap
//!
//! Readiness means every StatefulSet reports all replicas ready and the client
//! Service has endpoints. Everything is labelled with the instance ID, so
//! teardown deletes by label and also removes the claims the StatefulSet
//! controller leaves behind.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Endpoints, Namespace, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec, TCPSocketAction, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::List;
use serde::Serialize;
use serde_json::{Value, json};
use streamctl_core::ProviderKind;
use tracing::{debug, info};

use super::command::CliCommand;
use super::spec::ClusterSpec;
use super::traits::*;
use crate::config::{env_secs, env_string};

const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const LABEL_INSTANCE: &str = "streamctl.io/instance";
const LABEL_COMPONENT: &str = "streamctl.io/component";

const COMPONENT_KAFKA: &str = "kafka";
const COMPONENT_ZOOKEEPER: &str = "zookeeper";

const KAFKA_PORT: i32 = 9092;
const ZOOKEEPER_PORT: i32 = 2181;

/// Orchestrator driver configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// kubectl CLI binary
    pub kubectl_binary: String,
    /// kubeconfig context; the current context when unset
    pub context: Option<String>,
    /// Namespace all instances are created in
    pub namespace: String,
    /// Cluster DNS domain
    pub cluster_domain: String,
    /// Broker image
    pub kafka_image: String,
    /// ZooKeeper image
    pub zookeeper_image: String,
    /// Storage class for broker volumes; the cluster default when unset
    pub storage_class: Option<String>,
    /// Operation deadline
    pub max_duration: Duration,
    /// Readiness poll interval
    pub poll_interval: Duration,
    /// Timeout for a single kubectl invocation
    pub command_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            kubectl_binary: "kubectl".to_string(),
            context: None,
            namespace: "streamctl-clusters".to_string(),
            cluster_domain: "cluster.local".to_string(),
            kafka_image: "confluentinc/cp-kafka:7.4.0".to_string(),
            zookeeper_image: "confluentinc/cp-zookeeper:7.4.0".to_string(),
            storage_class: None,
            max_duration: Duration::from_secs(900),
            poll_interval: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STREAMCTL_KUBECTL_BIN` (default: kubectl)
    /// - `STREAMCTL_K8S_CONTEXT`
    /// - `STREAMCTL_K8S_NAMESPACE` (default: streamctl-clusters)
    /// - `STREAMCTL_K8S_STORAGE_CLASS`
    /// - `STREAMCTL_K8S_MAX_DURATION_SECS` (default: 900)
    /// - `STREAMCTL_K8S_POLL_INTERVAL_SECS` (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kubectl_binary: env_string("STREAMCTL_KUBECTL_BIN", &defaults.kubectl_binary),
            context: std::env::var("STREAMCTL_K8S_CONTEXT")
                .ok()
                .filter(|v| !v.is_empty()),
            namespace: env_string("STREAMCTL_K8S_NAMESPACE", &defaults.namespace),
            cluster_domain: env_string("STREAMCTL_K8S_CLUSTER_DOMAIN", &defaults.cluster_domain),
            kafka_image: env_string("STREAMCTL_K8S_KAFKA_IMAGE", &defaults.kafka_image),
            zookeeper_image: env_string("STREAMCTL_K8S_ZOOKEEPER_IMAGE", &defaults.zookeeper_image),
            storage_class: std::env::var("STREAMCTL_K8S_STORAGE_CLASS")
                .ok()
                .filter(|v| !v.is_empty()),
            max_duration: env_secs("STREAMCTL_K8S_MAX_DURATION_SECS", defaults.max_duration),
            poll_interval: env_secs("STREAMCTL_K8S_POLL_INTERVAL_SECS", defaults.poll_interval),
            command_timeout: defaults.command_timeout,
        }
    }
}

/// Object names of one instance.
#[derive(Debug, Clone)]
struct Names {
    zookeeper: String,
    kafka: String,
    headless: String,
    client: String,
}

impl Names {
    fn new(instance_id: &str) -> Self {
        Self {
            zookeeper: format!("streamctl-{}-zookeeper", instance_id),
            kafka: format!("streamctl-{}-kafka", instance_id),
            headless: format!("streamctl-{}-kafka-headless", instance_id),
            client: format!("streamctl-{}-kafka", instance_id),
        }
    }

    fn sub_resources(&self) -> Vec<String> {
        vec![
            format!("statefulset/{}", self.kafka),
            format!("statefulset/{}", self.zookeeper),
            format!("service/{}", self.client),
            format!("service/{}", self.headless),
            format!("service/{}", self.zookeeper),
        ]
    }
}

/// Objects declared for one instance, in apply order.
#[derive(Debug, Clone)]
struct Manifests {
    zookeeper_service: Service,
    zookeeper: StatefulSet,
    headless: Service,
    client: Service,
    kafka: StatefulSet,
}

impl Manifests {
    /// A `v1/List` document kubectl applies in one call.
    fn to_document(&self) -> Result<String> {
        let items = vec![
            render(&self.zookeeper_service)?,
            render(&self.zookeeper)?,
            render(&self.headless)?,
            render(&self.client)?,
            render(&self.kafka)?,
        ];
        Ok(json!({ "apiVersion": "v1", "kind": "List", "items": items }).to_string())
    }
}

fn render(object: &impl Serialize) -> Result<Value> {
    serde_json::to_value(object).map_err(|e| invalid_output("render manifests", e))
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn tcp_readiness(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_claim(
    labels: &BTreeMap<String, String>,
    size: String,
    class: Option<String>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            storage_class_name: class,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(
    name: &str,
    labels: &BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    port: (&str, i32),
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(port.0.to_string()),
                port: port.1,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stateful_set(
    name: &str,
    service_name: &str,
    labels: &BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    replicas: i32,
    container: Container,
    claim: PersistentVolumeClaim,
) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: service_name.to_string(),
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ready_replicas(set: &StatefulSet) -> i32 {
    set.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

fn desired_replicas(set: &StatefulSet) -> i32 {
    set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

fn component(set: &StatefulSet) -> &str {
    set.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_COMPONENT))
        .map(String::as_str)
        .unwrap_or_default()
}

fn has_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

fn invalid_output(step: &str, err: serde_json::Error) -> ProviderError {
    ProviderError::InvalidOutput {
        step: step.to_string(),
        message: err.to_string(),
    }
}

/// Orchestrator driver.
pub struct OrchestratorDriver {
    config: OrchestratorConfig,
}

impl OrchestratorDriver {
    /// Create a driver.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Create a driver configured from the environment.
    pub fn from_env() -> Self {
        Self::new(OrchestratorConfig::from_env())
    }

    fn kubectl(&self, step: impl Into<String>) -> CliCommand {
        let mut cmd = CliCommand::new(&self.config.kubectl_binary, step)
            .timeout(self.config.command_timeout);
        if let Some(context) = &self.config.context {
            cmd = cmd.arg("--context").arg(context);
        }
        cmd.arg("--namespace").arg(&self.config.namespace)
    }

    fn labels(&self, instance_id: &str, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), "streamctl".to_string()),
            (LABEL_INSTANCE.to_string(), instance_id.to_string()),
            (LABEL_COMPONENT.to_string(), component.to_string()),
        ])
    }

    fn dns(&self, host: &str) -> String {
        format!(
            "{}.{}.svc.{}",
            host, self.config.namespace, self.config.cluster_domain
        )
    }

    /// Objects for one instance.
    fn manifests(&self, instance_id: &str, cluster: &ClusterSpec) -> Manifests {
        let names = Names::new(instance_id);
        let zk_labels = self.labels(instance_id, COMPONENT_ZOOKEEPER);
        let kafka_labels = self.labels(instance_id, COMPONENT_KAFKA);
        let selector = |component: &str| {
            BTreeMap::from([
                (LABEL_INSTANCE.to_string(), instance_id.to_string()),
                (LABEL_COMPONENT.to_string(), component.to_string()),
            ])
        };

        let zookeeper_container = Container {
            name: "zookeeper".to_string(),
            image: Some(self.config.zookeeper_image.clone()),
            ports: Some(vec![ContainerPort {
                container_port: ZOOKEEPER_PORT,
                ..Default::default()
            }]),
            env: Some(vec![
                env("ZOOKEEPER_CLIENT_PORT", ZOOKEEPER_PORT.to_string()),
                env("ZOOKEEPER_TICK_TIME", "2000"),
            ]),
            readiness_probe: Some(tcp_readiness(ZOOKEEPER_PORT)),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: "/var/lib/zookeeper/data".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut kafka_env = vec![
            env(
                "KAFKA_ZOOKEEPER_CONNECT",
                format!("{}:{}", self.dns(&names.zookeeper), ZOOKEEPER_PORT),
            ),
            env("KAFKA_LISTENERS", format!("PLAINTEXT://0.0.0.0:{}", KAFKA_PORT)),
        ];
        kafka_env.extend(
            cluster
                .broker_environment()
                .into_iter()
                .map(|(name, value)| env(&name, value)),
        );

        let advertised = format!(
            "PLAINTEXT://${{HOSTNAME}}.{}:{}",
            self.dns(&names.headless),
            KAFKA_PORT
        );
        let start_script = format!(
            "export KAFKA_BROKER_ID=$((${{HOSTNAME##*-}} + 1)); \
             export KAFKA_ADVERTISED_LISTENERS={}; \
             exec /etc/confluent/docker/run",
            advertised
        );
        let kafka_container = Container {
            name: "kafka".to_string(),
            image: Some(self.config.kafka_image.clone()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), start_script]),
            ports: Some(vec![ContainerPort {
                container_port: KAFKA_PORT,
                ..Default::default()
            }]),
            env: Some(kafka_env),
            readiness_probe: Some(tcp_readiness(KAFKA_PORT)),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: "/var/lib/kafka/data".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut headless = service(
            &names.headless,
            &kafka_labels,
            selector(COMPONENT_KAFKA),
            ("broker", KAFKA_PORT),
        );
        if let Some(spec) = headless.spec.as_mut() {
            spec.cluster_ip = Some("None".to_string());
            spec.publish_not_ready_addresses = Some(true);
        }

        let mut kafka = stateful_set(
            &names.kafka,
            &names.headless,
            &kafka_labels,
            selector(COMPONENT_KAFKA),
            cluster.cluster_size as i32,
            kafka_container,
            data_claim(
                &kafka_labels,
                format!("{}Gi", cluster.storage_size_gb),
                self.config.storage_class.clone(),
            ),
        );
        if let Some(spec) = kafka.spec.as_mut() {
            spec.pod_management_policy = Some("Parallel".to_string());
        }

        Manifests {
            zookeeper_service: service(
                &names.zookeeper,
                &zk_labels,
                selector(COMPONENT_ZOOKEEPER),
                ("client", ZOOKEEPER_PORT),
            ),
            zookeeper: stateful_set(
                &names.zookeeper,
                &names.zookeeper,
                &zk_labels,
                selector(COMPONENT_ZOOKEEPER),
                1,
                zookeeper_container,
                data_claim(&zk_labels, "1Gi".to_string(), None),
            ),
            headless,
            client: service(
                &names.client,
                &kafka_labels,
                selector(COMPONENT_KAFKA),
                ("broker", KAFKA_PORT),
            ),
            kafka,
        }
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.kubectl("apply namespace")
            .args(["apply", "-f", "-"])
            .stdin(render(&namespace)?.to_string())
            .run()
            .await?;
        Ok(())
    }

    async fn apply(&self, instance_id: &str, cluster: &ClusterSpec) -> Result<()> {
        let document = self.manifests(instance_id, cluster).to_document()?;
        self.kubectl("apply manifests")
            .args(["apply", "-f", "-"])
            .stdin(document)
            .run()
            .await?;
        Ok(())
    }

    /// StatefulSets of one instance, read straight from the API so the
    /// answer is a typed `StatefulSetList` rather than kubectl's generic list.
    async fn stateful_sets(&self, instance_id: &str) -> Result<List<StatefulSet>> {
        let path = format!(
            "/apis/apps/v1/namespaces/{}/statefulsets?labelSelector={}%3D{}",
            self.config.namespace,
            LABEL_INSTANCE.replace('/', "%2F"),
            instance_id
        );
        let stdout = self
            .kubectl("get statefulsets")
            .args(["get", "--raw"])
            .arg(path)
            .run()
            .await?;
        serde_json::from_str(&stdout).map_err(|e| invalid_output("get statefulsets", e))
    }

    async fn probe(&self, instance_id: &str, expected_brokers: Option<u32>) -> Result<ProbeStatus> {
        let names = Names::new(instance_id);
        let sets = self.stateful_sets(instance_id).await?;

        if sets.items.is_empty() {
            return Ok(ProbeStatus::Failed("no workloads found for instance".to_string()));
        }

        let Some(kafka) = sets.items.iter().find(|s| component(s) == COMPONENT_KAFKA) else {
            return Ok(ProbeStatus::Failed("broker workload is missing".to_string()));
        };
        if !sets.items.iter().any(|s| component(s) == COMPONENT_ZOOKEEPER) {
            return Ok(ProbeStatus::Failed(
                "coordination workload is missing".to_string(),
            ));
        }

        let desired = desired_replicas(kafka);
        if expected_brokers.is_some_and(|expected| i64::from(expected) != i64::from(desired)) {
            return Ok(ProbeStatus::Pending);
        }
        if !sets.items.iter().all(|s| ready_replicas(s) >= desired_replicas(s)) {
            debug!(
                instance_id = %instance_id,
                workload = kafka.metadata.name.as_deref().unwrap_or_default(),
                "Replicas not ready"
            );
            return Ok(ProbeStatus::Pending);
        }

        let stdout = self
            .kubectl("get endpoints")
            .args(["get", "endpoints", names.client.as_str(), "-o", "json", "--ignore-not-found"])
            .run()
            .await?;
        let endpoints: Endpoints = if stdout.trim().is_empty() {
            Endpoints::default()
        } else {
            serde_json::from_str(&stdout).map_err(|e| invalid_output("get endpoints", e))?
        };
        if !has_addresses(&endpoints) {
            return Ok(ProbeStatus::Pending);
        }

        let bootstrap_servers = (0..desired)
            .map(|ordinal| {
                format!(
                    "{}-{}.{}:{}",
                    names.kafka,
                    ordinal,
                    self.dns(&names.headless),
                    KAFKA_PORT
                )
            })
            .collect();
        let info = ConnectionInfo::plaintext(
            bootstrap_servers,
            format!("{}:{}", self.dns(&names.zookeeper), ZOOKEEPER_PORT),
        )
        .with_property(
            "client_service",
            format!("{}:{}", self.dns(&names.client), KAFKA_PORT),
        )
        .with_property("namespace", self.config.namespace.clone());

        Ok(ProbeStatus::Ready(Some(info)))
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
}

#[async_trait]
impl ProviderDriver for OrchestratorDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Orchestrator
    }

    fn cadence(&self) -> ProviderCadence {
        ProviderCadence {
            max_duration: self.config.max_duration,
            poll_interval: self.config.poll_interval,
        }
    }

    fn check_parameters(&self, parameters: &Value) -> Result<ClusterSpec> {
        let spec = ClusterSpec::from_parameters(parameters)?;
        spec.require_plaintext("orchestrator")?;
        spec.reject_cloud_placement("orchestrator")?;
        Ok(spec)
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        info!(
            instance_id = %spec.instance_id,
            namespace = %self.config.namespace,
            brokers = spec.cluster.cluster_size,
            "Provisioning orchestrator cluster"
        );
        let declared = Names::new(&spec.instance_id).sub_resources();

        self.ensure_namespace().await?;
        self.apply(&spec.instance_id, &spec.cluster)
            .await
            .map_err(|e| e.with_partial(&declared))?;
        self.wait_ready(&spec.instance_id, spec.cluster.cluster_size)
            .await
            .map_err(|e| e.with_partial(&declared))
    }

    async fn update(&self, spec: &ProvisionSpec) -> Result<ConnectionInfo> {
        info!(instance_id = %spec.instance_id, "Re-applying orchestrator manifests");
        self.apply(&spec.instance_id, &spec.cluster).await?;
        self.wait_ready(&spec.instance_id, spec.cluster.cluster_size)
            .await
    }

    async fn deprovision(&self, resource: &ResourceRef) -> Result<()> {
        let selector = format!("{}={}", LABEL_INSTANCE, resource.instance_id);

        if resource.sub_resources.is_empty() {
            self.kubectl("delete workloads")
                .args(["delete", "statefulsets,services", "--ignore-not-found", "-l"])
                .arg(&selector)
                .run()
                .await?;
        } else {
            self.kubectl("delete workloads")
                .args(["delete", "--ignore-not-found"])
                .args(resource.sub_resources.iter().cloned())
                .run()
                .await?;
        }

        self.kubectl("delete volume claims")
            .args(["delete", "pvc", "--ignore-not-found", "--wait=false", "-l"])
            .arg(&selector)
            .run()
            .await?;
        Ok(())
    }

    async fn probe_status(&self, resource: &ResourceRef) -> Result<ProbeStatus> {
        self.probe(
            &resource.instance_id,
            resource.expected.as_ref().map(|c| c.cluster_size),
        )
        .await
    }

    async fn validate(&self) -> Result<()> {
        self.kubectl("kubectl version")
            .timeout(Duration::from_secs(15))
            .args(["version", "-o", "json"])
            .run()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("cluster not reachable: {}", e)))?;

        let answer = self
            .kubectl("kubectl auth can-i")
            .timeout(Duration::from_secs(15))
            .args(["auth", "can-i", "create", "statefulsets"])
            .output()
            .await?;
        if answer.stdout.trim() != "yes" {
            return Err(ProviderError::Unavailable(format!(
                "not allowed to create statefulsets in namespace {}",
                self.config.namespace
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> OrchestratorDriver {
        OrchestratorDriver::new(OrchestratorConfig {
            storage_class: Some("fast-ssd".to_string()),
            ..OrchestratorConfig::default()
        })
    }

    fn cluster(size: u32) -> ClusterSpec {
        ClusterSpec {
            cluster_size: size,
            storage_size_gb: 50,
            ..ClusterSpec::default()
        }
    }

    fn kafka_spec(manifests: &Manifests) -> &StatefulSetSpec {
        manifests.kafka.spec.as_ref().unwrap()
    }

    #[test]
    fn test_manifest_list_shape() {
        let manifests = driver().manifests("c1", &cluster(3));
        let document: Value = serde_json::from_str(&manifests.to_document().unwrap()).unwrap();
        assert_eq!(document["kind"], "List");
        let kinds: Vec<&str> = document["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["kind"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["Service", "StatefulSet", "Service", "Service", "StatefulSet"]
        );
        assert_eq!(document["items"][4]["apiVersion"], "apps/v1");
        assert_eq!(document["items"][4]["spec"]["replicas"], 3);

        assert_eq!(manifests.kafka.metadata.name.as_deref(), Some("streamctl-c1-kafka"));
        let spec = kafka_spec(&manifests);
        assert_eq!(spec.service_name, "streamctl-c1-kafka-headless");
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));

        let claim = &spec.volume_claim_templates.as_ref().unwrap()[0];
        let claim_spec = claim.spec.as_ref().unwrap();
        let requests = claim_spec.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["storage"], Quantity("50Gi".to_string()));
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("fast-ssd"));
        assert_eq!(claim.metadata.labels.as_ref().unwrap()[LABEL_INSTANCE], "c1");

        let headless = manifests.headless.spec.as_ref().unwrap();
        assert_eq!(headless.cluster_ip.as_deref(), Some("None"));
        assert_eq!(headless.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn test_broker_environment_points_at_zookeeper_service() {
        let manifests = driver().manifests("c1", &cluster(1));
        let container = &kafka_spec(&manifests).template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env.contains(&EnvVar {
            name: "KAFKA_ZOOKEEPER_CONNECT".to_string(),
            value: Some(
                "streamctl-c1-zookeeper.streamctl-clusters.svc.cluster.local:2181".to_string()
            ),
            ..Default::default()
        }));
    }

    #[test]
    fn test_parse_statefulset_list() {
        let raw = r#"{
            "apiVersion": "apps/v1",
            "kind": "StatefulSetList",
            "metadata": {"resourceVersion": "42"},
            "items": [{
                "metadata": {"name": "streamctl-c1-kafka", "labels": {"streamctl.io/component": "kafka"}},
                "spec": {"replicas": 3, "serviceName": "streamctl-c1-kafka-headless", "selector": {}, "template": {}},
                "status": {"replicas": 3, "readyReplicas": 2}
            }, {
                "metadata": {"name": "x"},
                "spec": {"serviceName": "x", "selector": {}, "template": {}},
                "status": {"replicas": 0}
            }]
        }"#;
        let list: List<StatefulSet> = serde_json::from_str(raw).unwrap();
        assert_eq!(desired_replicas(&list.items[0]), 3);
        assert_eq!(ready_replicas(&list.items[0]), 2);
        assert_eq!(component(&list.items[0]), COMPONENT_KAFKA);

        assert_eq!(desired_replicas(&list.items[1]), 1);
        assert_eq!(ready_replicas(&list.items[1]), 0);
        assert_eq!(component(&list.items[1]), "");
    }

    #[test]
    fn test_endpoints_without_addresses_are_not_ready() {
        let empty: Endpoints =
            serde_json::from_str(r#"{"metadata":{"name":"streamctl-c1-kafka"},"subsets":[{"notReadyAddresses":[{"ip":"10.0.0.7"}]}]}"#)
                .unwrap();
        assert!(!has_addresses(&empty));
        assert!(!has_addresses(&Endpoints::default()));

        let ready: Endpoints =
            serde_json::from_str(r#"{"metadata":{"name":"streamctl-c1-kafka"},"subsets":[{"addresses":[{"ip":"10.0.0.7"}]}]}"#)
                .unwrap();
        assert!(has_addresses(&ready));
    }

    #[test]
    fn test_sub_resources_cover_declared_objects() {
        let subs = Names::new("c1").sub_resources();
        assert!(subs.contains(&"statefulset/streamctl-c1-kafka".to_string()));
        assert!(subs.contains(&"service/streamctl-c1-kafka-headless".to_string()));
        assert_eq!(subs.len(), 5);
    }
}
