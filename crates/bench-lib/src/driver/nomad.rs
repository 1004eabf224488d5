//! Nomad driver
//!
//! The benchmarked application is a single job; each service is a task
//! group inside it. Probe services are submitted as separate jobs.

use super::{
    docker_stats_usage, ClusterDriver, DriverConfig, Platform, ReplicaCount, ResourceUsage,
    RetryBudget, RolloutState, TaskInstance,
};
use crate::exec::{CliExecutor, CommandSpec};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub struct NomadDriver {
    exec: CliExecutor,
    job: String,
    probe_image: String,
    drain_timeout: Duration,
    status_retry: RetryBudget,
}

/// Task group name for a service of the benchmarked job
pub(crate) fn group_for(service: &str) -> String {
    match service {
        "backend" => "backend-group".to_string(),
        "frontend" => "frontend-group".to_string(),
        "database" | "db" => "db-group".to_string(),
        other => format!("{other}-group"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NodeID", default)]
    pub node_id: String,
    #[serde(default)]
    pub task_group: String,
    #[serde(default)]
    pub client_status: String,
    #[serde(default)]
    pub desired_status: String,
}

impl Allocation {
    fn is_running(&self) -> bool {
        self.client_status == "running" && self.desired_status == "run"
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeStub {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    scheduling_eligibility: String,
}

impl NomadDriver {
    pub fn new(exec: CliExecutor, config: &DriverConfig) -> Self {
        Self {
            exec,
            job: config.target.clone(),
            probe_image: config.probe_image.clone(),
            drain_timeout: config.drain_timeout,
            status_retry: config.status_retry,
        }
    }

    fn nomad(&self) -> CommandSpec {
        CommandSpec::new("nomad")
    }

    async fn allocations(&self, job: &str) -> Vec<Allocation> {
        let spec = self.nomad().args(["job", "allocs", "-json", job]);
        let Some(stdout) = self.exec.output(&spec).await else {
            return Vec::new();
        };
        serde_json::from_str(&stdout)
            .inspect_err(|e| warn!(job = %job, error = %e, "Unparseable allocation list"))
            .unwrap_or_default()
    }

    async fn running_in_group(&self, job: &str, group: &str) -> Vec<TaskInstance> {
        self.allocations(job)
            .await
            .into_iter()
            .filter(|a| a.task_group == group && a.is_running())
            .map(|a| TaskInstance {
                id: a.id,
                node: a.node_id,
            })
            .collect()
    }

    async fn read_replicas(&self, group: &str) -> Option<ReplicaCount> {
        let spec = self.nomad().args(["job", "status", "-json", self.job.as_str()]);
        let stdout = self.exec.output(&spec).await?;
        let parsed = parse_job_status(&stdout, group);
        if parsed.is_none() {
            warn!(job = %self.job, group = %group, "Unparseable job status");
        }
        parsed
    }
}

#[async_trait]
impl ClusterDriver for NomadDriver {
    fn platform(&self) -> Platform {
        Platform::Nomad
    }

    fn target(&self) -> &str {
        &self.job
    }

    async fn scale(&self, service: &str, replicas: u32) -> bool {
        let spec = self.nomad().args([
            "job".to_string(),
            "scale".to_string(),
            "-detach".to_string(),
            self.job.clone(),
            group_for(service),
            replicas.to_string(),
        ]);
        self.exec.succeeded(&spec).await
    }

    /// The desired count can briefly read as zero while allocations are
    /// already running. Such observations are re-read with backoff and the
    /// last one is returned unchanged if the budget runs out.
    async fn replica_count(&self, service: &str) -> ReplicaCount {
        let group = group_for(service);
        let budget = self.status_retry;
        let mut backoff = budget.initial_backoff;
        let mut last = ReplicaCount::UNKNOWN;

        for attempt in 1..=budget.max_attempts.max(1) {
            let Some(count) = self.read_replicas(&group).await else {
                return ReplicaCount::UNKNOWN;
            };
            if !(count.desired == 0 && count.running > 0) {
                return count;
            }
            debug!(
                group = %group,
                attempt = attempt,
                running = count.running,
                "Desired count not yet visible, re-reading"
            );
            last = count;
            if attempt < budget.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, budget.max_backoff);
            }
        }

        warn!(
            group = %group,
            running = last.running,
            "Desired count still zero with running allocations"
        );
        last
    }

    async fn worker_nodes(&self) -> Vec<String> {
        let spec = self.nomad().args(["node", "status", "-json"]);
        let Some(stdout) = self.exec.output(&spec).await else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<NodeStub>>(&stdout) {
            Ok(nodes) => nodes
                .into_iter()
                .filter(|n| n.status == "ready" && n.scheduling_eligibility == "eligible")
                .map(|n| n.id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Unparseable node list");
                Vec::new()
            }
        }
    }

    async fn drain_node(&self, node: &str) -> bool {
        let spec = self.nomad().args([
            "node", "drain", "-enable", "-yes", "-detach", "-deadline", "1m", node,
        ]);
        self.exec
            .run_with_timeout(&spec, self.drain_timeout)
            .await
            .inspect_err(|e| warn!(node = %node, error = %e, "Drain failed"))
            .is_ok()
    }

    async fn restore_node(&self, node: &str) -> bool {
        let disable = self
            .nomad()
            .args(["node", "drain", "-disable", "-yes", node]);
        let drained_off = self.exec.succeeded(&disable).await;

        let eligible = self
            .nomad()
            .args(["node", "eligibility", "-enable", node]);
        self.exec.succeeded(&eligible).await && drained_off
    }

    /// `nomad job restart` blocks until every allocation is replaced, so it
    /// runs detached and progress is observed through `rollout_state`.
    async fn trigger_rolling_update(&self, service: &str) -> bool {
        let spec = self.nomad().args([
            "job".to_string(),
            "restart".to_string(),
            "-reschedule".to_string(),
            "-yes".to_string(),
            "-group".to_string(),
            group_for(service),
            self.job.clone(),
        ]);
        self.exec
            .spawn_detached(&spec)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to start job restart"))
            .is_ok()
    }

    async fn count_running_tasks(&self, service: &str) -> u32 {
        self.running_in_group(&self.job, &group_for(service))
            .await
            .len() as u32
    }

    async fn running_instances(&self, service: &str) -> Vec<TaskInstance> {
        self.running_in_group(&self.job, &group_for(service)).await
    }

    async fn rollout_state(&self, service: &str) -> RolloutState {
        let group = group_for(service);
        let desired = self.replica_count(service).await.desired;
        let allocs: Vec<Allocation> = self
            .allocations(&self.job)
            .await
            .into_iter()
            .filter(|a| a.task_group == group)
            .collect();
        allocation_rollout(&allocs, desired)
    }

    async fn create_probe_service(&self, name: &str, replicas: u32) -> bool {
        let jobspec = probe_jobspec(name, replicas, &self.probe_image);
        let spec = self
            .nomad()
            .args(["job", "run", "-detach", "-json", "-"])
            .stdin(jobspec.to_string());
        self.exec
            .run_once(&spec)
            .await
            .inspect_err(|e| warn!(probe = %name, error = %e, "Probe job submission failed"))
            .is_ok()
    }

    async fn remove_probe_service(&self, name: &str) -> bool {
        let spec = self
            .nomad()
            .args(["job", "stop", "-purge", "-detach", "-yes", name]);
        self.exec.run_once(&spec).await.is_ok()
    }

    async fn probe_running_tasks(&self, name: &str) -> u32 {
        self.running_in_group(name, &group_for(name)).await.len() as u32
    }

    async fn exec_in_service(&self, service: &str, argv: &[&str]) -> Option<String> {
        let spec = self.nomad().args([
            "alloc", "exec", "-i=false", "-t=false", "-job", self.job.as_str(), "-task", service,
        ]);
        let spec = spec.args(argv.iter().copied());
        self.exec.run_once(&spec).await.ok()
    }

    fn discovery_name(&self, service: &str) -> String {
        format!("{service}.service.consul")
    }

    async fn resource_usage(&self) -> ResourceUsage {
        docker_stats_usage(&self.exec).await
    }
}

/// Extract the running and desired counts of `group` from
/// `nomad job status -json` output
///
/// The CLI returns a list of job summaries whose `Summary` and `Job` fields
/// are themselves nested objects; flat objects are accepted as well.
pub(crate) fn parse_job_status(stdout: &str, group: &str) -> Option<ReplicaCount> {
    let value: Value = serde_json::from_str(stdout).ok()?;
    let status = match &value {
        Value::Array(items) => items.first()?,
        other => other,
    };

    let job = status.get("Job").unwrap_or(status);
    let desired = job
        .get("TaskGroups")
        .and_then(Value::as_array)
        .and_then(|groups| {
            groups
                .iter()
                .find(|g| g.get("Name").and_then(Value::as_str) == Some(group))
        })
        .and_then(|g| g.get("Count"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    // Nested `Summary.Summary.<group>` first, then a flat `Summary.<group>`
    let summary = status.get("Summary");
    let running = summary
        .and_then(|s| s.get("Summary"))
        .and_then(|nested| nested.get(group))
        .or_else(|| summary.and_then(|s| s.get(group)))
        .and_then(|g| g.get("Running"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Some(ReplicaCount::new(running as u32, desired as u32))
}

/// Infer rollout progress from the allocations of one task group
pub(crate) fn allocation_rollout(allocs: &[Allocation], desired: u32) -> RolloutState {
    if allocs.is_empty() {
        return RolloutState::Unknown;
    }
    let stopping = allocs
        .iter()
        .any(|a| a.desired_status == "stop" && a.client_status == "running");
    let pending = allocs
        .iter()
        .any(|a| a.desired_status == "run" && a.client_status == "pending");
    let running = allocs.iter().filter(|a| a.is_running()).count() as u32;

    if stopping || pending || running < desired {
        RolloutState::InProgress
    } else {
        RolloutState::Completed
    }
}

fn probe_jobspec(name: &str, replicas: u32, image: &str) -> Value {
    json!({
        "Job": {
            "ID": name,
            "Name": name,
            "Type": "service",
            "Datacenters": ["*"],
            "TaskGroups": [{
                "Name": group_for(name),
                "Count": replicas,
                "RestartPolicy": { "Attempts": 0, "Mode": "fail" },
                "Services": [{ "Name": name }],
                "Tasks": [{
                    "Name": name,
                    "Driver": "docker",
                    "Config": {
                        "image": image,
                        "command": "sleep",
                        "args": ["infinity"]
                    },
                    "Resources": { "CPU": 20, "MemoryMB": 16 }
                }]
            }]
        }
    })
}
