//! Benchmark scenarios
//!
//! Every scenario follows the same shape: bring the service to a known
//! state, perturb the cluster, poll until it settles or a deadline passes,
//! undo the perturbation and turn the observations into a [`ScenarioResult`].

mod concurrent_deployments;
mod discovery;
mod fault_tolerance;
mod health_check;
mod network_latency;
mod persistence;
mod resource_overhead;
mod rolling_update;
mod scalability;
mod scheduling;
mod settings;


pub use concurrent_deployments::ConcurrentDeployments;
pub use discovery::ServiceDiscovery;
pub use fault_tolerance::FaultTolerance;
pub use health_check::HealthCheck;
pub use network_latency::NetworkLatency;
pub use persistence::StoragePersistence;
pub use resource_overhead::ResourceOverhead;
pub use rolling_update::RollingUpdate;
pub use scalability::Scalability;
pub use scheduling::SchedulingOverhead;
pub use settings::{
    ConcurrentDeploymentSettings, DiscoverySettings, FaultToleranceSettings, HealthCheckSettings,
    LookupTarget, NetworkLatencySettings, PersistenceSettings, ResourceOverheadSettings,
    RollingUpdateSettings, ScalabilitySettings, ScenarioSettings, SchedulingSettings,
};

use crate::driver::{ClusterDriver, ReplicaCount, RolloutState};
use crate::models::ScenarioResult;
use crate::observability::{BenchMetrics, StructuredLogger};
use crate::traffic::TrafficConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Scenario categories, in suite order
pub const CATEGORIES: &[&str] = &[
    "resource_management",
    "application_model",
    "scheduler_architecture",
    "system_objectives",
    "container_orchestration",
    "network_isolation",
    "storage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    FaultTolerance,
    HealthCheck,
    ResourceOverhead,
    RollingUpdate,
    SchedulingOverhead,
    ConcurrentDeployments,
    Scalability,
    ServiceDiscovery,
    NetworkLatency,
    StoragePersistence,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 10] = [
        ScenarioKind::FaultTolerance,
        ScenarioKind::HealthCheck,
        ScenarioKind::ResourceOverhead,
        ScenarioKind::RollingUpdate,
        ScenarioKind::SchedulingOverhead,
        ScenarioKind::ConcurrentDeployments,
        ScenarioKind::Scalability,
        ScenarioKind::ServiceDiscovery,
        ScenarioKind::NetworkLatency,
        ScenarioKind::StoragePersistence,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::FaultTolerance => "fault-tolerance",
            ScenarioKind::HealthCheck => "health-check",
            ScenarioKind::ConcurrentDeployments => "concurrent-deployments",
            ScenarioKind::NetworkLatency => "network-latency",
            ScenarioKind::ResourceOverhead => "resource-overhead",
            ScenarioKind::RollingUpdate => "rolling-update",
            ScenarioKind::SchedulingOverhead => "scheduling-overhead",
            ScenarioKind::Scalability => "scalability",
            ScenarioKind::ServiceDiscovery => "service-discovery",
            ScenarioKind::StoragePersistence => "storage-persistence",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ScenarioKind::FaultTolerance
            | ScenarioKind::HealthCheck
            | ScenarioKind::ResourceOverhead => "resource_management",
            ScenarioKind::RollingUpdate => "application_model",
            ScenarioKind::SchedulingOverhead | ScenarioKind::ConcurrentDeployments => {
                "scheduler_architecture"
            }
            ScenarioKind::NetworkLatency => "network_isolation",
            ScenarioKind::Scalability => "system_objectives",
            ScenarioKind::ServiceDiscovery => "container_orchestration",
            ScenarioKind::StoragePersistence => "storage",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioKind::FaultTolerance => "Drain a worker node and measure recovery time",
            ScenarioKind::HealthCheck => "Replacement time for an instance whose process died",
            ScenarioKind::ConcurrentDeployments => "Scheduler behaviour under simultaneous deployments",
            ScenarioKind::NetworkLatency => "In-cluster and ingress request latency",
            ScenarioKind::ResourceOverhead => "Per-container CPU and memory overhead",
            ScenarioKind::RollingUpdate => "Downtime and errors during a forced redeploy",
            ScenarioKind::SchedulingOverhead => "Time to place bursts of probe containers",
            ScenarioKind::Scalability => "Throughput and load balancing across replica counts",
            ScenarioKind::ServiceDiscovery => "DNS resolution, consistency and propagation",
            ScenarioKind::StoragePersistence => "Data survival across a database restart",
        }
    }

    /// Member of the fast subset selected with `--quick`
    pub fn is_quick(&self) -> bool {
        matches!(
            self,
            ScenarioKind::FaultTolerance | ScenarioKind::RollingUpdate | ScenarioKind::Scalability
        )
    }

    /// Metric key shown as the one-line summary of a result
    pub fn headline_metric(&self) -> &'static str {
        match self {
            ScenarioKind::FaultTolerance => "recovery_time_seconds",
            ScenarioKind::HealthCheck => "avg_time_to_healthy_seconds",
            ScenarioKind::ConcurrentDeployments => "degradation_factor",
            ScenarioKind::NetworkLatency => "avg_ping_ms",
            ScenarioKind::ResourceOverhead => "memory_per_container_mb",
            ScenarioKind::RollingUpdate => "zero_downtime",
            ScenarioKind::SchedulingOverhead => "best_containers_per_second",
            ScenarioKind::Scalability => "max_throughput_rps",
            ScenarioKind::ServiceDiscovery => "avg_lookup_ms",
            ScenarioKind::StoragePersistence => "data_survived",
        }
    }

    /// Resolve the scenarios to run from CLI filters
    ///
    /// Explicit names win over category and quick filters.
    pub fn select(categories: &[String], quick: bool, names: &[String]) -> Result<Vec<ScenarioKind>> {
        if !names.is_empty() {
            return names
                .iter()
                .map(|n| n.parse::<ScenarioKind>().map_err(anyhow::Error::msg))
                .collect();
        }

        for category in categories {
            if !CATEGORIES.contains(&category.as_str()) {
                bail!(
                    "unknown category '{category}' (expected one of: {})",
                    CATEGORIES.join(", ")
                );
            }
        }

        Ok(Self::ALL
            .into_iter()
            .filter(|k| categories.is_empty() || categories.iter().any(|c| c == k.category()))
            .filter(|k| !quick || k.is_quick())
            .collect())
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|k| k.name() == normalized)
            .ok_or_else(|| format!("unknown scenario '{s}'"))
    }
}

/// Everything a scenario needs to run
#[derive(Clone)]
pub struct ScenarioContext {
    pub driver: Arc<dyn ClusterDriver>,
    pub settings: ScenarioSettings,
    pub logger: StructuredLogger,
    pub metrics: BenchMetrics,
}

impl ScenarioContext {
    pub fn new(driver: Arc<dyn ClusterDriver>, settings: ScenarioSettings) -> Self {
        let logger = StructuredLogger::new(driver.platform().as_str());
        Self {
            driver,
            settings,
            logger,
            metrics: BenchMetrics::new(),
        }
    }

    /// Empty result record for `kind` on this platform
    pub fn begin(&self, kind: ScenarioKind) -> ScenarioResult {
        ScenarioResult::begin(kind.name(), kind.category(), self.driver.platform().as_str())
    }

    pub fn api_url(&self) -> Result<Url> {
        Url::parse(&self.settings.api_url)
            .with_context(|| format!("invalid API URL '{}'", self.settings.api_url))
    }

    /// Traffic generator settings pointed at the service root
    pub fn traffic_config(&self) -> Result<TrafficConfig> {
        let mut config = TrafficConfig::new(self.api_url()?);
        config.request_timeout = Duration::from_millis(self.settings.request_timeout_ms);
        Ok(config)
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn kind(&self) -> ScenarioKind;

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult>;

    /// Undo cluster changes left behind by a run that was aborted
    async fn cleanup(&self, _ctx: &ScenarioContext) {}
}

pub fn build_scenario(kind: ScenarioKind) -> Arc<dyn Scenario> {
    match kind {
        ScenarioKind::FaultTolerance => Arc::new(FaultTolerance::default()),
        ScenarioKind::HealthCheck => Arc::new(HealthCheck),
        ScenarioKind::ConcurrentDeployments => Arc::new(ConcurrentDeployments::default()),
        ScenarioKind::NetworkLatency => Arc::new(NetworkLatency),
        ScenarioKind::ResourceOverhead => Arc::new(ResourceOverhead),
        ScenarioKind::RollingUpdate => Arc::new(RollingUpdate),
        ScenarioKind::SchedulingOverhead => Arc::new(SchedulingOverhead),
        ScenarioKind::Scalability => Arc::new(Scalability),
        ScenarioKind::ServiceDiscovery => Arc::new(ServiceDiscovery),
        ScenarioKind::StoragePersistence => Arc::new(StoragePersistence),
    }
}

/// Outcome of waiting for a replica count
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Convergence {
    pub converged: bool,
    pub elapsed_seconds: f64,
    pub polls: u32,
    pub last: ReplicaCount,
}

/// Poll `replica_count` until running and desired both equal `target`
pub async fn wait_for_convergence(
    driver: &dyn ClusterDriver,
    service: &str,
    target: u32,
    timeout: Duration,
    poll: Duration,
) -> Convergence {
    let start = Instant::now();
    let mut polls = 0;
    loop {
        let last = driver.replica_count(service).await;
        polls += 1;
        if last.is_converged(target) || start.elapsed() >= timeout {
            return Convergence {
                converged: last.is_converged(target),
                elapsed_seconds: start.elapsed().as_secs_f64(),
                polls,
                last,
            };
        }
        tokio::time::sleep(poll).await;
    }
}

/// State change observed while a rollout was monitored
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RolloutTransition {
    pub at_seconds: f64,
    pub state: RolloutState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutOutcome {
    /// Last state observed; `Unknown` if nothing was observed
    pub state: RolloutState,
    pub timed_out: bool,
    pub elapsed_seconds: f64,
    pub transitions: Vec<RolloutTransition>,
}

impl RolloutOutcome {
    pub fn completed(&self) -> bool {
        !self.timed_out && self.state == RolloutState::Completed
    }
}

/// Poll `rollout_state` until the update completes, fails or times out
///
/// `Completed` only counts once an in-progress state was seen or
/// `min_window` has elapsed: right after the trigger the platform may still
/// report the previous update as complete.
pub async fn wait_for_rollout(
    ctx: &ScenarioContext,
    service: &str,
    timeout: Duration,
    poll: Duration,
    min_window: Duration,
) -> RolloutOutcome {
    let start = Instant::now();
    let mut saw_progress = false;
    let mut last = RolloutState::Unknown;
    let mut transitions = Vec::new();

    loop {
        if start.elapsed() >= timeout {
            return RolloutOutcome {
                state: last,
                timed_out: true,
                elapsed_seconds: start.elapsed().as_secs_f64(),
                transitions,
            };
        }
        tokio::time::sleep(poll).await;

        let state = ctx.driver.rollout_state(service).await;
        let at_seconds = start.elapsed().as_secs_f64();
        if transitions.is_empty() || state != last {
            ctx.logger.log_rollout(service, state.as_str(), at_seconds);
            transitions.push(RolloutTransition { at_seconds, state });
        }
        last = state;

        let done = match state {
            RolloutState::InProgress => {
                saw_progress = true;
                false
            }
            RolloutState::Completed => saw_progress || start.elapsed() >= min_window,
            RolloutState::Failed => true,
            RolloutState::Unknown => false,
        };
        if done {
            return RolloutOutcome {
                state,
                timed_out: false,
                elapsed_seconds: at_seconds,
                transitions,
            };
        }
    }
}

/// Join `path` onto `base`, treating `base` as a directory
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("cannot join '{path}' onto '{base}'"))
}

pub(crate) fn secs(duration: Duration) -> f64 {
    crate::stats::round_to(duration.as_secs_f64(), 3)
}
