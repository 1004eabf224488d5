//! Docker Swarm driver
//!
//! Services belong to a stack and are addressed as `{stack}_{service}`.
//! Probe services are created outside the stack under their bare name.

use super::{
    docker_stats_usage, ClusterDriver, DriverConfig, Platform, ReplicaCount, ResourceUsage,
    RolloutState, TaskInstance,
};
use crate::exec::{CliExecutor, CommandSpec};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

pub struct SwarmDriver {
    exec: CliExecutor,
    stack: String,
    probe_image: String,
    probe_network: Option<String>,
    drain_timeout: Duration,
}

impl SwarmDriver {
    pub fn new(exec: CliExecutor, config: &DriverConfig) -> Self {
        Self {
            exec,
            stack: config.target.clone(),
            probe_image: config.probe_image.clone(),
            probe_network: config.probe_network.clone(),
            drain_timeout: config.drain_timeout,
        }
    }

    fn full_name(&self, service: &str) -> String {
        format!("{}_{}", self.stack, service)
    }

    fn docker(&self) -> CommandSpec {
        CommandSpec::new("docker")
    }

    async fn service_ps(&self, name: &str) -> Vec<TaskInstance> {
        let spec = self.docker().args([
            "service",
            "ps",
            name,
            "--filter",
            "desired-state=running",
            "--format",
            "{{.ID}} {{.Node}} {{.CurrentState}}",
        ]);
        match self.exec.output(&spec).await {
            Some(stdout) => parse_running_tasks(&stdout),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl ClusterDriver for SwarmDriver {
    fn platform(&self) -> Platform {
        Platform::Swarm
    }

    fn target(&self) -> &str {
        &self.stack
    }

    async fn scale(&self, service: &str, replicas: u32) -> bool {
        let spec = self.docker().args([
            "service".to_string(),
            "scale".to_string(),
            "--detach".to_string(),
            format!("{}={}", self.full_name(service), replicas),
        ]);
        self.exec.succeeded(&spec).await
    }

    async fn replica_count(&self, service: &str) -> ReplicaCount {
        let name = self.full_name(service);
        let spec = self.docker().args([
            "service",
            "ls",
            "--filter",
            &format!("name={name}"),
            "--format",
            "{{.Name}} {{.Replicas}}",
        ]);
        match self.exec.output(&spec).await {
            Some(stdout) => parse_replicas(&stdout, &name).unwrap_or_else(|| {
                warn!(service = %name, "Service not listed by docker service ls");
                ReplicaCount::UNKNOWN
            }),
            None => ReplicaCount::UNKNOWN,
        }
    }

    async fn worker_nodes(&self) -> Vec<String> {
        let spec = self.docker().args([
            "node",
            "ls",
            "--filter",
            "role=worker",
            "--format",
            "{{.Hostname}} {{.Availability}}",
        ]);
        match self.exec.output(&spec).await {
            Some(stdout) => stdout
                .lines()
                .filter_map(|line| {
                    let mut parts = line.split_whitespace();
                    let host = parts.next()?;
                    match parts.next() {
                        Some("Active") | None => Some(host.to_string()),
                        _ => None,
                    }
                })
                .collect(),
            None => Vec::new(),
        }
    }

    async fn drain_node(&self, node: &str) -> bool {
        let spec = self
            .docker()
            .args(["node", "update", "--availability", "drain", node]);
        self.exec
            .run_with_timeout(&spec, self.drain_timeout)
            .await
            .inspect_err(|e| warn!(node = %node, error = %e, "Drain failed"))
            .is_ok()
    }

    async fn restore_node(&self, node: &str) -> bool {
        let spec = self
            .docker()
            .args(["node", "update", "--availability", "active", node]);
        self.exec.succeeded(&spec).await
    }

    async fn trigger_rolling_update(&self, service: &str) -> bool {
        let spec = self.docker().args([
            "service".to_string(),
            "update".to_string(),
            "--force".to_string(),
            "--detach".to_string(),
            self.full_name(service),
        ]);
        self.exec.succeeded(&spec).await
    }

    async fn count_running_tasks(&self, service: &str) -> u32 {
        self.service_ps(&self.full_name(service)).await.len() as u32
    }

    async fn running_instances(&self, service: &str) -> Vec<TaskInstance> {
        self.service_ps(&self.full_name(service)).await
    }

    async fn rollout_state(&self, service: &str) -> RolloutState {
        let spec = self.docker().args([
            "service".to_string(),
            "inspect".to_string(),
            self.full_name(service),
            "--format".to_string(),
            "{{json .UpdateStatus}}".to_string(),
        ]);
        match self.exec.output(&spec).await {
            Some(stdout) => parse_update_status(&stdout),
            None => RolloutState::Unknown,
        }
    }

    async fn create_probe_service(&self, name: &str, replicas: u32) -> bool {
        let mut spec = self.docker().args([
            "service".to_string(),
            "create".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--replicas".to_string(),
            replicas.to_string(),
            "--restart-condition".to_string(),
            "none".to_string(),
        ]);
        if let Some(network) = &self.probe_network {
            spec = spec.args(["--network", network.as_str()]);
        }
        let spec = spec.args([self.probe_image.as_str(), "sleep", "infinity"]);

        self.exec
            .run_once(&spec)
            .await
            .inspect_err(|e| warn!(probe = %name, error = %e, "Probe service creation failed"))
            .is_ok()
    }

    async fn remove_probe_service(&self, name: &str) -> bool {
        let spec = self.docker().args(["service", "rm", name]);
        self.exec.run_once(&spec).await.is_ok()
    }

    async fn probe_running_tasks(&self, name: &str) -> u32 {
        self.service_ps(name).await.len() as u32
    }

    async fn exec_in_service(&self, service: &str, argv: &[&str]) -> Option<String> {
        let name = self.full_name(service);
        let ps = self.docker().args([
            "ps",
            "--filter",
            &format!("name={name}"),
            "--format",
            "{{.ID}}",
        ]);
        let stdout = self.exec.output(&ps).await?;
        let Some(container) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            warn!(service = %name, "No local container to exec into");
            return None;
        };

        let spec = self.docker().arg("exec").arg(container).args(argv.iter().copied());
        // A failed lookup exits non-zero; that is an answer, not an error
        self.exec.run_once(&spec).await.ok()
    }

    fn discovery_name(&self, service: &str) -> String {
        service.to_string()
    }

    async fn resource_usage(&self) -> ResourceUsage {
        docker_stats_usage(&self.exec).await
    }
}

/// Find `name` in `docker service ls` output and parse its `running/desired`
pub(crate) fn parse_replicas(stdout: &str, name: &str) -> Option<ReplicaCount> {
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != name {
            return None;
        }
        // "2/3" possibly followed by "(max 1 per node)"
        let (running, desired) = parts.next()?.split_once('/')?;
        Some(ReplicaCount::new(
            running.parse().ok()?,
            desired.parse().ok()?,
        ))
    })
}

/// Keep only tasks whose current state is Running
pub(crate) fn parse_running_tasks(stdout: &str) -> Vec<TaskInstance> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let node = parts.next()?;
            (parts.next()? == "Running").then(|| TaskInstance {
                id: id.to_string(),
                node: node.to_string(),
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct UpdateStatus {
    #[serde(rename = "State", default)]
    state: String,
}

pub(crate) fn parse_update_status(stdout: &str) -> RolloutState {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return RolloutState::Unknown;
    }
    match serde_json::from_str::<UpdateStatus>(trimmed) {
        Ok(status) => match status.state.as_str() {
            "updating" | "rollback_started" => RolloutState::InProgress,
            "completed" => RolloutState::Completed,
            "paused" | "rollback_paused" | "rollback_completed" => RolloutState::Failed,
            _ => RolloutState::Unknown,
        },
        Err(e) => {
            warn!(error = %e, "Unparseable UpdateStatus");
            RolloutState::Unknown
        }
    }
}
