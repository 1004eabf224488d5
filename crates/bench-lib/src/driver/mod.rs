//! Platform drivers
//!
//! A driver exposes one capability set over Docker Swarm, Kubernetes and
//! Nomad by shelling out to the platform CLI. Queries never fail: when a
//! command errors or its output cannot be parsed the driver logs a warning
//! and returns a benign default (zero counts, empty lists, `Unknown`).

mod k8s;
mod nomad;
mod swarm;

#[cfg(test)]
mod tests;

pub use k8s::KubernetesDriver;
pub use nomad::NomadDriver;
pub use swarm::SwarmDriver;

use crate::exec::{CliExecutor, CommandRunner, CommandSpec, ExecConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Supported orchestration platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Swarm,
    #[serde(alias = "kubernetes")]
    K8s,
    Nomad,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Swarm => "swarm",
            Platform::K8s => "k8s",
            Platform::Nomad => "nomad",
        }
    }

    /// Default stack / namespace / job name
    pub fn default_target(&self) -> &'static str {
        "cob-service"
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "swarm" | "docker-swarm" => Ok(Platform::Swarm),
            "k8s" | "kubernetes" => Ok(Platform::K8s),
            "nomad" => Ok(Platform::Nomad),
            other => Err(format!(
                "unknown platform '{other}' (expected swarm, k8s or nomad)"
            )),
        }
    }
}

/// Running and desired instance counts of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCount {
    pub running: u32,
    pub desired: u32,
}

impl ReplicaCount {
    /// Reported when the platform could not be queried
    pub const UNKNOWN: ReplicaCount = ReplicaCount {
        running: 0,
        desired: 0,
    };

    pub fn new(running: u32, desired: u32) -> Self {
        Self { running, desired }
    }

    /// Both counts have reached `target`
    pub fn is_converged(&self, target: u32) -> bool {
        self.running == target && self.desired == target
    }
}

/// One running task, pod or allocation of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    /// Node the instance is placed on, in the form `worker_nodes` reports
    pub node: String,
}

/// Progress of a rolling update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    InProgress,
    Completed,
    Failed,
    Unknown,
}

impl RolloutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutState::InProgress => "in_progress",
            RolloutState::Completed => "completed",
            RolloutState::Failed => "failed",
            RolloutState::Unknown => "unknown",
        }
    }
}

/// Aggregate resource consumption of the containers on the observed host
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Sum of per-container CPU percentages (100 = one core)
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub container_count: u32,
}

/// Uniform control surface over an orchestration platform
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    fn platform(&self) -> Platform;

    /// Stack, namespace or job the driver operates on
    fn target(&self) -> &str;

    /// Request `replicas` instances; returns once the command is accepted
    async fn scale(&self, service: &str, replicas: u32) -> bool;

    async fn replica_count(&self, service: &str) -> ReplicaCount;

    /// Schedulable worker node identifiers
    async fn worker_nodes(&self) -> Vec<String>;

    /// Make `node` unschedulable and evict its workloads
    async fn drain_node(&self, node: &str) -> bool;

    async fn restore_node(&self, node: &str) -> bool;

    /// Force a redeploy of every instance of `service`
    async fn trigger_rolling_update(&self, service: &str) -> bool;

    async fn count_running_tasks(&self, service: &str) -> u32;

    async fn running_instances(&self, service: &str) -> Vec<TaskInstance>;

    async fn rollout_state(&self, service: &str) -> RolloutState;

    /// Create a throwaway service running the probe image
    async fn create_probe_service(&self, name: &str, replicas: u32) -> bool;

    async fn remove_probe_service(&self, name: &str) -> bool;

    /// Running instances of a probe service
    async fn probe_running_tasks(&self, name: &str) -> u32 {
        self.count_running_tasks(name).await
    }

    /// Run `argv` inside one running instance of `service`, returning stdout
    async fn exec_in_service(&self, service: &str, argv: &[&str]) -> Option<String>;

    /// DNS name under which `service` is discoverable from inside the cluster
    fn discovery_name(&self, service: &str) -> String;

    async fn resource_usage(&self) -> ResourceUsage;
}

/// Driver construction parameters
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub platform: Platform,
    pub target: String,
    /// Image used for scheduling and discovery probes
    pub probe_image: String,
    /// Swarm overlay network probes attach to
    pub probe_network: Option<String>,
    pub exec: ExecConfig,
    /// Node drains can take much longer than ordinary commands
    pub drain_timeout: Duration,
    /// Budget for re-reading Nomad status while the desired count lags
    pub status_retry: RetryBudget,
}

impl DriverConfig {
    pub fn new(platform: Platform, target: impl Into<String>) -> Self {
        Self {
            platform,
            target: target.into(),
            probe_image: "alpine:latest".to_string(),
            probe_network: None,
            exec: ExecConfig::default(),
            drain_timeout: Duration::from_secs(90),
            status_retry: RetryBudget::default(),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Create the driver for the configured platform
pub fn create_driver(config: &DriverConfig, runner: Arc<dyn CommandRunner>) -> Arc<dyn ClusterDriver> {
    let exec = CliExecutor::new(runner, config.exec.clone());
    match config.platform {
        Platform::Swarm => {
            tracing::info!(stack = %config.target, "Using Docker Swarm driver");
            Arc::new(SwarmDriver::new(exec, config))
        }
        Platform::K8s => {
            tracing::info!(namespace = %config.target, "Using Kubernetes driver");
            Arc::new(KubernetesDriver::new(exec, config))
        }
        Platform::Nomad => {
            tracing::info!(job = %config.target, "Using Nomad driver");
            Arc::new(NomadDriver::new(exec, config))
        }
    }
}

/// Sum `docker stats` over every container on the local engine
///
/// Swarm uses it directly; the Nomad docker task driver runs containers on
/// the same engine so Nomad falls back to it as well.
pub(crate) async fn docker_stats_usage(exec: &CliExecutor) -> ResourceUsage {
    let spec = CommandSpec::new("docker").args(["stats", "--no-stream", "--format", "{{json .}}"]);
    match exec.output(&spec).await {
        Some(stdout) => parse_docker_stats(&stdout),
        None => ResourceUsage::default(),
    }
}

#[derive(Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
}

pub(crate) fn parse_docker_stats(stdout: &str) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(stats) = serde_json::from_str::<DockerStatsLine>(line) else {
            tracing::warn!(line = %line, "Unparseable docker stats line");
            continue;
        };
        usage.container_count += 1;
        usage.cpu_percent += stats
            .cpu_perc
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .unwrap_or(0.0);
        // "20.5MiB / 1.944GiB": the first half is current usage
        let used = stats.mem_usage.split('/').next().unwrap_or_default();
        usage.memory_mb += parse_memory_mb(used).unwrap_or(0.0);
    }
    usage
}

/// Parse a size such as `20.5MiB`, `512kB` or `1.2GiB` into megabytes
pub(crate) fn parse_memory_mb(text: &str) -> Option<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let factor = match unit.trim() {
        "B" | "" => 1.0 / (1024.0 * 1024.0),
        "KiB" | "Ki" | "kB" | "KB" | "K" => 1.0 / 1024.0,
        "MiB" | "Mi" | "MB" | "M" => 1.0,
        "GiB" | "Gi" | "GB" | "G" => 1024.0,
        "TiB" | "Ti" | "TB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * factor)
}
