//! Kubernetes driver
//!
//! Services are Deployments in the target namespace whose pods carry an
//! `app=<service>` label. `kubectl -o json` output is decoded into the
//! k8s-openapi types.

use super::{
    ClusterDriver, DriverConfig, Platform, ReplicaCount, ResourceUsage, RolloutState,
    TaskInstance,
};
use crate::exec::{CliExecutor, CommandSpec};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// `kubectl get <kind> -o json` list wrapper
#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

pub struct KubernetesDriver {
    exec: CliExecutor,
    namespace: String,
    probe_image: String,
    drain_timeout: Duration,
}

impl KubernetesDriver {
    pub fn new(exec: CliExecutor, config: &DriverConfig) -> Self {
        Self {
            exec,
            namespace: config.target.clone(),
            probe_image: config.probe_image.clone(),
            drain_timeout: config.drain_timeout,
        }
    }

    fn kubectl(&self) -> CommandSpec {
        CommandSpec::new("kubectl")
    }

    fn namespaced(&self, spec: CommandSpec) -> CommandSpec {
        spec.args(["-n", self.namespace.as_str()])
    }

    async fn get_json<T: DeserializeOwned>(&self, spec: CommandSpec) -> Option<T> {
        let stdout = self.exec.output(&spec).await?;
        serde_json::from_str(&stdout)
            .inspect_err(|e| warn!(command = %spec.display(), error = %e, "Unparseable kubectl JSON"))
            .ok()
    }

    async fn deployment(&self, service: &str) -> Option<Deployment> {
        let spec = self.kubectl().args(["get", "deployment", service, "-o", "json"]);
        self.get_json(self.namespaced(spec)).await
    }

    async fn pods(&self, service: &str) -> Vec<Pod> {
        let spec = self.kubectl().args([
            "get".to_string(),
            "pods".to_string(),
            "-l".to_string(),
            format!("app={service}"),
            "-o".to_string(),
            "json".to_string(),
        ]);
        self.get_json::<ItemList<Pod>>(self.namespaced(spec))
            .await
            .map(|list| list.items)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClusterDriver for KubernetesDriver {
    fn platform(&self) -> Platform {
        Platform::K8s
    }

    fn target(&self) -> &str {
        &self.namespace
    }

    async fn scale(&self, service: &str, replicas: u32) -> bool {
        let spec = self.kubectl().args([
            "scale".to_string(),
            "deployment".to_string(),
            service.to_string(),
            format!("--replicas={replicas}"),
        ]);
        self.exec.succeeded(&self.namespaced(spec)).await
    }

    async fn replica_count(&self, service: &str) -> ReplicaCount {
        match self.deployment(service).await {
            Some(deployment) => deployment_replicas(&deployment),
            None => ReplicaCount::UNKNOWN,
        }
    }

    async fn worker_nodes(&self) -> Vec<String> {
        let spec = self.kubectl().args(["get", "nodes", "-o", "json"]);
        self.get_json::<ItemList<Node>>(spec)
            .await
            .map(|list| schedulable_workers(&list.items))
            .unwrap_or_default()
    }

    async fn drain_node(&self, node: &str) -> bool {
        let spec = self.kubectl().args([
            "drain",
            node,
            "--ignore-daemonsets",
            "--delete-emptydir-data",
            "--force",
            "--timeout=60s",
        ]);
        self.exec
            .run_with_timeout(&spec, self.drain_timeout)
            .await
            .inspect_err(|e| warn!(node = %node, error = %e, "Drain failed"))
            .is_ok()
    }

    async fn restore_node(&self, node: &str) -> bool {
        let spec = self.kubectl().args(["uncordon", node]);
        self.exec.succeeded(&spec).await
    }

    async fn trigger_rolling_update(&self, service: &str) -> bool {
        let spec = self.kubectl().args([
            "rollout".to_string(),
            "restart".to_string(),
            format!("deployment/{service}"),
        ]);
        self.exec.succeeded(&self.namespaced(spec)).await
    }

    async fn count_running_tasks(&self, service: &str) -> u32 {
        running_pods(&self.pods(service).await).len() as u32
    }

    async fn running_instances(&self, service: &str) -> Vec<TaskInstance> {
        running_pods(&self.pods(service).await)
    }

    async fn rollout_state(&self, service: &str) -> RolloutState {
        match self.deployment(service).await {
            Some(deployment) => deployment_rollout(&deployment),
            None => RolloutState::Unknown,
        }
    }

    async fn create_probe_service(&self, name: &str, replicas: u32) -> bool {
        let create = self.kubectl().args([
            "create".to_string(),
            "deployment".to_string(),
            name.to_string(),
            format!("--image={}", self.probe_image),
            format!("--replicas={replicas}"),
        ]);
        let create = self
            .namespaced(create)
            .args(["--", "sleep", "infinity"]);
        if let Err(e) = self.exec.run_once(&create).await {
            warn!(probe = %name, error = %e, "Probe deployment creation failed");
            return false;
        }

        // A ClusterIP Service makes the probe resolvable by name
        let expose = self
            .kubectl()
            .args(["expose", "deployment", name, "--port=80"]);
        if let Err(e) = self.exec.run_once(&self.namespaced(expose)).await {
            warn!(probe = %name, error = %e, "Probe service exposure failed");
        }
        true
    }

    async fn remove_probe_service(&self, name: &str) -> bool {
        let service = self
            .kubectl()
            .args(["delete", "service", name, "--ignore-not-found"]);
        let service_removed = match self.exec.run_once(&self.namespaced(service)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(service = %name, error = %e, "Throwaway service deletion failed");
                false
            }
        };

        let deployment = self
            .kubectl()
            .args(["delete", "deployment", name, "--ignore-not-found"]);
        let deployment_removed = self.exec.run_once(&self.namespaced(deployment)).await.is_ok();
        service_removed && deployment_removed
    }

    async fn exec_in_service(&self, service: &str, argv: &[&str]) -> Option<String> {
        let spec = self
            .kubectl()
            .args(["exec".to_string(), format!("deploy/{service}")]);
        let spec = self
            .namespaced(spec)
            .arg("--")
            .args(argv.iter().copied());
        self.exec.run_once(&spec).await.ok()
    }

    fn discovery_name(&self, service: &str) -> String {
        service.to_string()
    }

    async fn resource_usage(&self) -> ResourceUsage {
        let spec = self.kubectl().args(["top", "pods", "--no-headers"]);
        match self.exec.output(&self.namespaced(spec)).await {
            Some(stdout) => parse_top_pods(&stdout),
            None => ResourceUsage::default(),
        }
    }
}

fn clamp(value: Option<i32>) -> u32 {
    value.unwrap_or(0).max(0) as u32
}

/// Ready replicas over the requested replica count
pub(crate) fn deployment_replicas(deployment: &Deployment) -> ReplicaCount {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas);
    let ready = deployment.status.as_ref().and_then(|s| s.ready_replicas);
    ReplicaCount::new(clamp(ready), clamp(desired))
}

/// Mirrors the checks `kubectl rollout status` performs
pub(crate) fn deployment_rollout(deployment: &Deployment) -> RolloutState {
    let Some(status) = deployment.status.as_ref() else {
        return RolloutState::Unknown;
    };

    let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return RolloutState::Failed;
    }

    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return RolloutState::InProgress;
    }

    let desired = clamp(deployment.spec.as_ref().and_then(|s| s.replicas));
    let updated = clamp(status.updated_replicas);
    let total = clamp(status.replicas);
    let available = clamp(status.available_replicas);

    if updated < desired || total > updated || available < updated {
        RolloutState::InProgress
    } else {
        RolloutState::Completed
    }
}

/// Running pods that are not being deleted
pub(crate) fn running_pods(pods: &[Pod]) -> Vec<TaskInstance> {
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .filter(|pod| {
            pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
        })
        .filter_map(|pod| {
            Some(TaskInstance {
                id: pod.metadata.name.clone()?,
                node: pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.clone())
                    .unwrap_or_default(),
            })
        })
        .collect()
}

pub(crate) fn schedulable_workers(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|node| {
            let labels = node.metadata.labels.as_ref();
            !CONTROL_PLANE_LABELS
                .iter()
                .any(|label| labels.is_some_and(|l| l.contains_key(*label)))
        })
        .filter(|node| {
            node.spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                != Some(true)
        })
        .filter_map(|node| node.metadata.name.clone())
        .collect()
}

/// Parse `kubectl top pods --no-headers` lines such as `web-1  3m  25Mi`
pub(crate) fn parse_top_pods(stdout: &str) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        usage.container_count += 1;
        usage.cpu_percent += parse_millicores(parts[1]) / 10.0;
        usage.memory_mb += super::parse_memory_mb(parts[2]).unwrap_or(0.0);
    }
    usage
}

fn parse_millicores(text: &str) -> f64 {
    match text.strip_suffix('m') {
        Some(milli) => milli.parse().unwrap_or(0.0),
        None => text.parse::<f64>().map(|cores| cores * 1000.0).unwrap_or(0.0),
    }
}
