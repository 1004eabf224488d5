//! Tunables for every scenario, deserializable from the runner config

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_service() -> String {
    "backend".to_string()
}

fn default_database_service() -> String {
    "db".to_string()
}

fn default_api_url() -> String {
    "http://localhost:5001/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_failure_threshold() -> f64 {
    5.0
}

fn default_restore_replicas() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSettings {
    /// Logical name of the service under test
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default = "default_database_service")]
    pub database_service: String,

    /// Base URL of the service under test
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Failed-request percentage above which traffic counts as disrupted
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_percent: f64,

    /// Replica count the service is returned to after scaling scenarios
    #[serde(default = "default_restore_replicas")]
    pub restore_replicas: u32,

    /// Embed every traffic sample in the result
    #[serde(default)]
    pub include_raw_samples: bool,

    #[serde(default)]
    pub fault_tolerance: FaultToleranceSettings,
    #[serde(default)]
    pub rolling_update: RollingUpdateSettings,
    #[serde(default)]
    pub scheduling: SchedulingSettings,
    #[serde(default)]
    pub scalability: ScalabilitySettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub resource_overhead: ResourceOverheadSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
    #[serde(default)]
    pub network_latency: NetworkLatencySettings,
    #[serde(default)]
    pub concurrent_deployments: ConcurrentDeploymentSettings,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            service: default_service(),
            database_service: default_database_service(),
            api_url: default_api_url(),
            request_timeout_ms: default_request_timeout_ms(),
            failure_threshold_percent: default_failure_threshold(),
            restore_replicas: default_restore_replicas(),
            include_raw_samples: false,
            fault_tolerance: FaultToleranceSettings::default(),
            rolling_update: RollingUpdateSettings::default(),
            scheduling: SchedulingSettings::default(),
            scalability: ScalabilitySettings::default(),
            discovery: DiscoverySettings::default(),
            resource_overhead: ResourceOverheadSettings::default(),
            persistence: PersistenceSettings::default(),
            health_check: HealthCheckSettings::default(),
            network_latency: NetworkLatencySettings::default(),
            concurrent_deployments: ConcurrentDeploymentSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceSettings {
    pub baseline_replicas: u32,
    pub convergence_timeout_secs: u64,
    /// Traffic observed before the fault is injected
    pub baseline_window_ms: u64,
    pub recovery_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub rps: f64,
    pub workers: usize,
    pub iterations: u32,
    /// Pause after a node is restored before the next iteration
    pub iteration_cooldown_secs: u64,
}

impl Default for FaultToleranceSettings {
    fn default() -> Self {
        Self {
            baseline_replicas: 4,
            convergence_timeout_secs: 60,
            baseline_window_ms: 2000,
            recovery_timeout_secs: 60,
            poll_interval_ms: 100,
            rps: 20.0,
            workers: 5,
            iterations: 5,
            iteration_cooldown_secs: 10,
        }
    }
}

impl FaultToleranceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingUpdateSettings {
    pub replicas: u32,
    pub iterations: u32,
    pub convergence_timeout_secs: u64,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Completed states before this window are ignored unless progress was seen
    pub min_update_window_secs: u64,
    /// Traffic before the update is triggered
    pub warmup_secs: u64,
    /// Traffic kept flowing after the update completes
    pub tail_secs: u64,
    pub iteration_cooldown_secs: u64,
    pub rps: f64,
    pub workers: usize,
    pub sla_error_rate_percent: f64,
}

impl Default for RollingUpdateSettings {
    fn default() -> Self {
        Self {
            replicas: 3,
            iterations: 3,
            convergence_timeout_secs: 60,
            timeout_secs: 120,
            poll_interval_ms: 500,
            min_update_window_secs: 5,
            warmup_secs: 3,
            tail_secs: 2,
            iteration_cooldown_secs: 10,
            rps: 20.0,
            workers: 5,
            sla_error_rate_percent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSettings {
    pub levels: Vec<u32>,
    pub warmup_replicas: u32,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Pause after removing a probe before the next level
    pub cooldown_secs: u64,
    pub probe_name: String,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            levels: vec![10, 50, 100],
            warmup_replicas: 3,
            timeout_secs: 120,
            poll_interval_ms: 100,
            cooldown_secs: 5,
            probe_name: "benchmark-dummy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalabilitySettings {
    pub levels: Vec<u32>,
    pub requests: usize,
    pub workers: usize,
    pub convergence_timeout_secs: u64,
    /// Budget for every replica to show up as a responder
    pub responder_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ScalabilitySettings {
    fn default() -> Self {
        Self {
            levels: vec![1, 3, 5],
            requests: 500,
            workers: 10,
            convergence_timeout_secs: 60,
            responder_timeout_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

/// A name to resolve and whether it should resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTarget {
    pub name: String,
    pub expected: bool,
}

impl LookupTarget {
    pub fn new(name: impl Into<String>, expected: bool) -> Self {
        Self {
            name: name.into(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub lookups: Vec<LookupTarget>,
    pub lookups_per_name: u32,
    pub lookup_interval_ms: u64,
    pub consistency_lookups: u32,
    pub propagation_iterations: u32,
    pub propagation_timeout_secs: u64,
    pub propagation_poll_ms: u64,
    pub removal_poll_ms: u64,
    pub probe_name: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            lookups: vec![
                LookupTarget::new("backend", true),
                LookupTarget::new("db", true),
                LookupTarget::new("frontend", true),
                LookupTarget::new("nonexistent-service", false),
            ],
            lookups_per_name: 5,
            lookup_interval_ms: 100,
            consistency_lookups: 20,
            propagation_iterations: 3,
            propagation_timeout_secs: 60,
            propagation_poll_ms: 200,
            removal_poll_ms: 500,
            probe_name: "discovery-test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverheadSettings {
    pub containers: u32,
    pub samples: u32,
    pub sample_interval_ms: u64,
    /// Wait after convergence before sampling
    pub settle_secs: u64,
    pub convergence_timeout_secs: u64,
}

impl Default for ResourceOverheadSettings {
    fn default() -> Self {
        Self {
            containers: 10,
            samples: 5,
            sample_interval_ms: 2000,
            settle_secs: 15,
            convergence_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Collection path the record is written to
    pub collection: String,
    pub restart_timeout_secs: u64,
    pub min_restart_window_secs: u64,
    /// Budget for the record to become readable after the restart
    pub read_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            collection: "assignments".to_string(),
            restart_timeout_secs: 120,
            min_restart_window_secs: 5,
            read_timeout_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub replicas: u32,
    pub iterations: u32,
    /// Run inside one instance to make its application process exit
    pub kill_command: Vec<String>,
    pub convergence_timeout_secs: u64,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub iteration_cooldown_secs: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            replicas: 1,
            iterations: 3,
            kill_command: ["sh", "-c", "pkill -f flask || pkill -f python"]
                .map(String::from)
                .to_vec(),
            convergence_timeout_secs: 60,
            timeout_secs: 120,
            poll_interval_ms: 500,
            iteration_cooldown_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkLatencySettings {
    /// Services pinged from inside an instance of the service under test
    pub ping_targets: Vec<String>,
    pub pings: u32,
    /// Port the service under test listens on inside the cluster network
    pub http_port: u16,
    pub http_requests: u32,
    /// Requests sent through the published endpoint
    pub external_requests: usize,
}

impl Default for NetworkLatencySettings {
    fn default() -> Self {
        Self {
            ping_targets: vec!["backend".to_string(), "db".to_string()],
            pings: 20,
            http_port: 5000,
            http_requests: 10,
            external_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentDeploymentSettings {
    /// Number of services created at the same instant, per level
    pub levels: Vec<u32>,
    pub iterations: u32,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub cooldown_secs: u64,
    pub name_prefix: String,
}

impl Default for ConcurrentDeploymentSettings {
    fn default() -> Self {
        Self {
            levels: vec![1, 3, 5, 10],
            iterations: 3,
            timeout_secs: 120,
            poll_interval_ms: 500,
            cooldown_secs: 5,
            name_prefix: "concurrent-test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: ScenarioSettings = serde_json::from_value(serde_json::json!({
            "service": "web",
            "scheduling": { "levels": [5] }
        }))
        .unwrap();

        assert_eq!(settings.service, "web");
        assert_eq!(settings.database_service, "db");
        assert_eq!(settings.scheduling.levels, vec![5]);
        assert_eq!(settings.scheduling.timeout_secs, 120);
        assert_eq!(settings.scalability.levels, vec![1, 3, 5]);
        assert_eq!(settings.fault_tolerance.iterations, 5);
        assert_eq!(settings.concurrent_deployments.levels, vec![1, 3, 5, 10]);
        assert_eq!(settings.health_check.kill_command[0], "sh");
    }
}
