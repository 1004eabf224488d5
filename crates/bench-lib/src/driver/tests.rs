//! Driver tests
//!
//! A scripted command runner stands in for the platform CLIs so parsing
//! and command construction can be checked without a cluster.

use super::*;
use crate::exec::{CommandError, CommandOutput, CommandRunner, CommandSpec, ExecConfig};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
enum Reply {
    Stdout(String),
    Exit(i32, String),
    Timeout,
}

/// Replies to commands whose display line starts with a registered prefix.
/// The last queued reply for a prefix repeats.
#[derive(Default)]
struct ScriptedRunner {
    rules: Mutex<Vec<(String, VecDeque<Reply>)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    fn on(self, prefix: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, replies)) => replies.push_back(reply),
                None => rules.push((prefix.to_string(), VecDeque::from([reply]))),
            }
        }
        self
    }

    fn stdout(self, prefix: &str, stdout: &str) -> Self {
        self.on(prefix, Reply::Stdout(stdout.to_string()))
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.display()).collect()
    }

    fn next_reply(&self, line: &str) -> Option<Reply> {
        let mut rules = self.rules.lock().unwrap();
        let (_, replies) = rules
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())?;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        match self.next_reply(&spec.display()) {
            Some(Reply::Stdout(stdout)) => Ok(CommandOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            }),
            Some(Reply::Exit(code, stderr)) => Ok(CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr,
            }),
            Some(Reply::Timeout) => Err(CommandError::Timeout {
                command: spec.display(),
                timeout,
            }),
            None => Ok(CommandOutput {
                code: Some(127),
                stdout: String::new(),
                stderr: "unscripted command".to_string(),
            }),
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

fn config(platform: Platform) -> DriverConfig {
    let mut config = DriverConfig::new(platform, "cob-service");
    config.exec = ExecConfig {
        timeout: Duration::from_secs(1),
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
    };
    config.status_retry = RetryBudget {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    config
}

fn driver(platform: Platform, runner: ScriptedRunner) -> (Arc<dyn ClusterDriver>, Arc<ScriptedRunner>) {
    let runner = Arc::new(runner);
    (create_driver(&config(platform), runner.clone()), runner)
}

mod swarm_tests {
    use super::*;

    #[tokio::test]
    async fn test_replica_count_parses_service_ls() {
        let runner = ScriptedRunner::default().stdout(
            "docker service ls",
            "cob-service_backend 2/3\ncob-service_backend-worker 1/1 (max 1 per node)\n",
        );
        let (driver, runner) = driver(Platform::Swarm, runner);

        let count = driver.replica_count("backend").await;
        assert_eq!(count, ReplicaCount::new(2, 3));
        assert_eq!(
            runner.calls()[0],
            "docker service ls --filter name=cob-service_backend --format {{.Name}} {{.Replicas}}"
        );
    }

    #[tokio::test]
    async fn test_failed_command_yields_unknown() {
        let runner = ScriptedRunner::default().on(
            "docker service ls",
            Reply::Exit(1, "Cannot connect to the Docker daemon".to_string()),
        );
        let (driver, _) = driver(Platform::Swarm, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::UNKNOWN);
    }

    #[tokio::test]
    async fn test_timeout_yields_unknown() {
        let runner = ScriptedRunner::default().on("docker service ls", Reply::Timeout);
        let (driver, _) = driver(Platform::Swarm, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::UNKNOWN);
    }

    #[tokio::test]
    async fn test_scale_uses_full_service_name() {
        let runner = ScriptedRunner::default().stdout("docker service scale", "");
        let (driver, runner) = driver(Platform::Swarm, runner);

        assert!(driver.scale("backend", 5).await);
        assert_eq!(
            runner.calls()[0],
            "docker service scale --detach cob-service_backend=5"
        );
    }

    #[tokio::test]
    async fn test_repeated_scale_is_identical() {
        let runner = ScriptedRunner::default().stdout("docker service scale", "");
        let (driver, runner) = driver(Platform::Swarm, runner);

        assert!(driver.scale("backend", 3).await);
        assert!(driver.scale("backend", 3).await);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    #[tokio::test]
    async fn test_running_instances_filters_state() {
        let runner = ScriptedRunner::default().stdout(
            "docker service ps",
            "abc123 worker1 Running 5 minutes ago\n\
             def456 worker2 Preparing 1 second ago\n\
             ghi789 worker2 Running 2 minutes ago\n",
        );
        let (driver, _) = driver(Platform::Swarm, runner);

        let instances = driver.running_instances("backend").await;
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "abc123");
        assert_eq!(instances[0].node, "worker1");
        assert_eq!(driver.count_running_tasks("backend").await, 2);
    }

    #[tokio::test]
    async fn test_worker_nodes_skip_drained() {
        let runner = ScriptedRunner::default().stdout(
            "docker node ls",
            "worker1 Active\nworker2 Drain\nworker3 Active\n",
        );
        let (driver, _) = driver(Platform::Swarm, runner);

        assert_eq!(driver.worker_nodes().await, vec!["worker1", "worker3"]);
    }

    #[tokio::test]
    async fn test_rollout_state_from_update_status() {
        let runner = ScriptedRunner::default()
            .stdout("docker service inspect", "{\"State\":\"updating\"}\n")
            .stdout("docker service inspect", "{\"State\":\"completed\"}\n")
            .stdout("docker service inspect", "{\"State\":\"rollback_completed\"}\n");
        let (driver, _) = driver(Platform::Swarm, runner);

        assert_eq!(driver.rollout_state("backend").await, RolloutState::InProgress);
        assert_eq!(driver.rollout_state("backend").await, RolloutState::Completed);
        assert_eq!(driver.rollout_state("backend").await, RolloutState::Failed);
    }

    #[test]
    fn test_update_status_null_is_unknown() {
        assert_eq!(swarm::parse_update_status("null\n"), RolloutState::Unknown);
    }

    #[tokio::test]
    async fn test_probe_creation_attaches_network() {
        let runner = ScriptedRunner::default().stdout("docker service create", "xyz\n");
        let runner = Arc::new(runner);
        let mut cfg = config(Platform::Swarm);
        cfg.probe_network = Some("cob-service_default".to_string());
        let driver = create_driver(&cfg, runner.clone());

        assert!(driver.create_probe_service("benchmark-dummy", 10).await);
        let call = &runner.calls()[0];
        assert!(call.contains("--name benchmark-dummy --replicas 10 --restart-condition none"));
        assert!(call.contains("--network cob-service_default"));
        assert!(call.ends_with("alpine:latest sleep infinity"));
    }

    #[tokio::test]
    async fn test_exec_resolves_container_first() {
        let runner = ScriptedRunner::default()
            .stdout("docker ps", "c0ffee\nbeef01\n")
            .stdout("docker exec c0ffee getent hosts db", "10.0.1.5      db\n");
        let (driver, runner) = driver(Platform::Swarm, runner);

        let out = driver
            .exec_in_service("backend", &["getent", "hosts", "db"])
            .await;
        assert_eq!(out.as_deref(), Some("10.0.1.5      db\n"));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_resource_usage_sums_docker_stats() {
        let runner = ScriptedRunner::default().stdout(
            "docker stats",
            "{\"Name\":\"a\",\"CPUPerc\":\"0.50%\",\"MemUsage\":\"20.5MiB / 1.9GiB\"}\n\
             {\"Name\":\"b\",\"CPUPerc\":\"1.50%\",\"MemUsage\":\"1GiB / 1.9GiB\"}\n",
        );
        let (driver, _) = driver(Platform::Swarm, runner);

        let usage = driver.resource_usage().await;
        assert_eq!(usage.container_count, 2);
        assert!((usage.cpu_percent - 2.0).abs() < 1e-9);
        assert!((usage.memory_mb - 1044.5).abs() < 1e-9);
    }
}

mod k8s_tests {
    use super::*;

    const DEPLOYMENT: &str = r#"{
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "backend", "namespace": "cob-service", "generation": 4},
        "spec": {
            "replicas": 3,
            "selector": {"matchLabels": {"app": "backend"}},
            "template": {"metadata": {"labels": {"app": "backend"}}}
        },
        "status": {
            "observedGeneration": 4,
            "replicas": 3,
            "updatedReplicas": 3,
            "readyReplicas": 2,
            "availableReplicas": 3
        }
    }"#;

    const PODS: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "backend-7d9f-abc"},
                "spec": {"nodeName": "node-a", "containers": []},
                "status": {"phase": "Running"}
            },
            {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "backend-7d9f-def"},
                "spec": {"nodeName": "node-b", "containers": []},
                "status": {"phase": "Pending"}
            }
        ]
    }"#;

    const NODES: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": "cp-1", "labels": {"node-role.kubernetes.io/control-plane": ""}}
            },
            {
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": "worker-1"}
            },
            {
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": "worker-2"},
                "spec": {"unschedulable": true}
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_replica_count_from_deployment() {
        let runner = ScriptedRunner::default().stdout("kubectl get deployment", DEPLOYMENT);
        let (driver, runner) = driver(Platform::K8s, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::new(2, 3));
        assert_eq!(
            runner.calls()[0],
            "kubectl get deployment backend -o json -n cob-service"
        );
    }

    #[tokio::test]
    async fn test_missing_ready_replicas_counts_as_zero() {
        let deployment = r#"{
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "backend"},
            "spec": {"replicas": 4, "selector": {}, "template": {}},
            "status": {"replicas": 4}
        }"#;
        let runner = ScriptedRunner::default().stdout("kubectl get deployment", deployment);
        let (driver, _) = driver(Platform::K8s, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::new(0, 4));
    }

    #[tokio::test]
    async fn test_running_pods_and_nodes() {
        let runner = ScriptedRunner::default()
            .stdout("kubectl get pods", PODS)
            .stdout("kubectl get nodes", NODES);
        let (driver, _) = driver(Platform::K8s, runner);

        let instances = driver.running_instances("backend").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "backend-7d9f-abc");
        assert_eq!(instances[0].node, "node-a");
        assert_eq!(driver.worker_nodes().await, vec!["worker-1"]);
    }

    #[tokio::test]
    async fn test_rollout_completed_when_all_updated() {
        let runner = ScriptedRunner::default().stdout("kubectl get deployment", DEPLOYMENT);
        let (driver, _) = driver(Platform::K8s, runner);

        assert_eq!(driver.rollout_state("backend").await, RolloutState::Completed);
    }

    #[tokio::test]
    async fn test_rollout_in_progress_with_old_replicas() {
        let mut deployment: serde_json::Value = serde_json::from_str(DEPLOYMENT).unwrap();
        deployment["status"]["replicas"] = 4.into();
        deployment["status"]["updatedReplicas"] = 2.into();
        let runner = ScriptedRunner::default()
            .stdout("kubectl get deployment", &deployment.to_string());
        let (driver, _) = driver(Platform::K8s, runner);

        assert_eq!(driver.rollout_state("backend").await, RolloutState::InProgress);
    }

    #[tokio::test]
    async fn test_invalid_json_yields_defaults() {
        let runner = ScriptedRunner::default()
            .stdout("kubectl get deployment", "Error from server (NotFound)")
            .stdout("kubectl get pods", "not json");
        let (driver, _) = driver(Platform::K8s, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::UNKNOWN);
        assert_eq!(driver.rollout_state("backend").await, RolloutState::Unknown);
        assert!(driver.running_instances("backend").await.is_empty());
    }

    #[tokio::test]
    async fn test_removal_reports_failed_service_delete() {
        let runner = ScriptedRunner::default()
            .on(
                "kubectl delete service",
                Reply::Exit(1, "error: You must be logged in to the server".to_string()),
            )
            .stdout("kubectl delete deployment", "deployment.apps \"discovery-test\" deleted");
        let (driver, runner) = driver(Platform::K8s, runner);

        assert!(!driver.remove_probe_service("discovery-test").await);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2, "deployment is still deleted: {calls:?}");
        assert!(calls[1].starts_with("kubectl delete deployment discovery-test"));
    }

    #[tokio::test]
    async fn test_removal_succeeds_when_both_deletes_succeed() {
        let runner = ScriptedRunner::default()
            .stdout("kubectl delete service", "")
            .stdout("kubectl delete deployment", "");
        let (driver, _) = driver(Platform::K8s, runner);

        assert!(driver.remove_probe_service("discovery-test").await);
    }

    #[test]
    fn test_parse_top_pods() {
        let usage = k8s::parse_top_pods("backend-1   250m   64Mi\nbackend-2   1   1Gi\n");
        assert_eq!(usage.container_count, 2);
        assert!((usage.cpu_percent - 125.0).abs() < 1e-9);
        assert!((usage.memory_mb - 1088.0).abs() < 1e-9);
    }
}

mod nomad_tests {
    use super::*;

    fn job_status(running: u32, count: u32) -> String {
        format!(
            r#"[{{
                "Job": {{"ID": "cob-service", "TaskGroups": [
                    {{"Name": "backend-group", "Count": {count}}},
                    {{"Name": "db-group", "Count": 1}}
                ]}},
                "Summary": {{"JobID": "cob-service", "Summary": {{
                    "backend-group": {{"Running": {running}, "Starting": 0}},
                    "db-group": {{"Running": 1}}
                }}}}
            }}]"#
        )
    }

    #[test]
    fn test_group_mapping() {
        assert_eq!(nomad::group_for("backend"), "backend-group");
        assert_eq!(nomad::group_for("database"), "db-group");
        assert_eq!(nomad::group_for("cache"), "cache-group");
    }

    #[tokio::test]
    async fn test_replica_count_from_nested_status() {
        let runner = ScriptedRunner::default().stdout("nomad job status", &job_status(2, 3));
        let (driver, runner) = driver(Platform::Nomad, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::new(2, 3));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_flat_status_object() {
        let flat = r#"{"TaskGroups": [{"Name": "backend-group", "Count": 2}],
                       "Summary": {"backend-group": {"Running": 2}}}"#;
        assert_eq!(
            nomad::parse_job_status(flat, "backend-group"),
            Some(ReplicaCount::new(2, 2))
        );
    }

    #[test]
    fn test_missing_summary_keeps_desired() {
        let no_summary = r#"[{"Job": {"TaskGroups": [{"Name": "backend-group", "Count": 3}]}}]"#;
        assert_eq!(
            nomad::parse_job_status(no_summary, "backend-group"),
            Some(ReplicaCount::new(0, 3))
        );
    }

    #[test]
    fn test_nested_summary_without_group_falls_back_to_flat() {
        let mixed = r#"{"TaskGroups": [{"Name": "backend-group", "Count": 4}],
                        "Summary": {"Summary": {"db-group": {"Running": 1}},
                                    "backend-group": {"Running": 3}}}"#;
        assert_eq!(
            nomad::parse_job_status(mixed, "backend-group"),
            Some(ReplicaCount::new(3, 4))
        );
    }

    #[tokio::test]
    async fn test_zero_desired_is_reread() {
        let runner = ScriptedRunner::default()
            .stdout("nomad job status", &job_status(3, 0))
            .stdout("nomad job status", &job_status(3, 3));
        let (driver, runner) = driver(Platform::Nomad, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::new(3, 3));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_desired_returned_unchanged_when_budget_exhausted() {
        let runner = ScriptedRunner::default().stdout("nomad job status", &job_status(3, 0));
        let (driver, runner) = driver(Platform::Nomad, runner);

        assert_eq!(driver.replica_count("backend").await, ReplicaCount::new(3, 0));
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_scale_targets_task_group() {
        let runner = ScriptedRunner::default().stdout("nomad job scale", "");
        let (driver, runner) = driver(Platform::Nomad, runner);

        assert!(driver.scale("backend", 4).await);
        assert_eq!(
            runner.calls()[0],
            "nomad job scale -detach cob-service backend-group 4"
        );
    }

    #[tokio::test]
    async fn test_rolling_update_is_detached() {
        let (driver, runner) = driver(Platform::Nomad, ScriptedRunner::default());

        assert!(driver.trigger_rolling_update("backend").await);
        assert_eq!(
            runner.calls()[0],
            "nomad job restart -reschedule -yes -group backend-group cob-service"
        );
    }

    #[tokio::test]
    async fn test_allocations_and_rollout() {
        let allocs = r#"[
            {"ID": "a1", "NodeID": "n1", "TaskGroup": "backend-group", "ClientStatus": "running", "DesiredStatus": "run"},
            {"ID": "a2", "NodeID": "n2", "TaskGroup": "backend-group", "ClientStatus": "running", "DesiredStatus": "stop"},
            {"ID": "a3", "NodeID": "n2", "TaskGroup": "db-group", "ClientStatus": "running", "DesiredStatus": "run"}
        ]"#;
        let runner = ScriptedRunner::default()
            .stdout("nomad job allocs", allocs)
            .stdout("nomad job status", &job_status(1, 2));
        let (driver, _) = driver(Platform::Nomad, runner);

        let instances = driver.running_instances("backend").await;
        assert_eq!(instances, vec![TaskInstance { id: "a1".into(), node: "n1".into() }]);
        assert_eq!(driver.rollout_state("backend").await, RolloutState::InProgress);
    }

    #[tokio::test]
    async fn test_worker_nodes_require_ready_and_eligible() {
        let nodes = r#"[
            {"ID": "n1", "Status": "ready", "SchedulingEligibility": "eligible"},
            {"ID": "n2", "Status": "ready", "SchedulingEligibility": "ineligible"},
            {"ID": "n3", "Status": "down", "SchedulingEligibility": "eligible"}
        ]"#;
        let runner = ScriptedRunner::default().stdout("nomad node status", nodes);
        let (driver, _) = driver(Platform::Nomad, runner);

        assert_eq!(driver.worker_nodes().await, vec!["n1"]);
    }

    #[tokio::test]
    async fn test_probe_job_submitted_on_stdin() {
        let runner = Arc::new(ScriptedRunner::default().stdout("nomad job run", ""));
        let driver = create_driver(&config(Platform::Nomad), runner.clone());

        assert!(driver.create_probe_service("discovery-test", 1).await);
        let call = runner.calls.lock().unwrap()[0].clone();
        let jobspec: serde_json::Value = serde_json::from_str(call.stdin.as_deref().unwrap()).unwrap();
        assert_eq!(jobspec["Job"]["ID"], "discovery-test");
        assert_eq!(jobspec["Job"]["TaskGroups"][0]["Name"], "discovery-test-group");
        assert_eq!(driver.discovery_name("discovery-test"), "discovery-test.service.consul");
    }
}

#[test]
fn test_parse_memory_units() {
    assert_eq!(parse_memory_mb("20.5MiB"), Some(20.5));
    assert_eq!(parse_memory_mb("1.5GiB"), Some(1536.0));
    assert_eq!(parse_memory_mb("512KiB"), Some(0.5));
    assert_eq!(parse_memory_mb("bogus"), None);
}

#[test]
fn test_platform_from_str() {
    assert_eq!("kubernetes".parse::<Platform>(), Ok(Platform::K8s));
    assert_eq!("Swarm".parse::<Platform>(), Ok(Platform::Swarm));
    assert!("mesos".parse::<Platform>().is_err());
}
