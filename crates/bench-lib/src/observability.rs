//! Observability infrastructure for the benchmark harness
//!
//! Provides:
//! - Prometheus metrics (scenario outcomes, traffic, CLI invocations)
//! - Structured logging of suite and scenario events with tracing

use crate::models::{ScenarioStatus, StatusCounts};
use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, HistogramVec, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0,
];

/// Histogram buckets for whole-scenario duration (in seconds)
const SCENARIO_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<BenchMetricsInner> = OnceLock::new();

struct BenchMetricsInner {
    scenario_duration_seconds: HistogramVec,
    scenario_results: IntCounterVec,
    scenarios_running: IntGauge,
    traffic_requests: IntCounterVec,
    traffic_latency_seconds: Histogram,
    cli_invocations: IntCounterVec,
    cli_failures: IntCounterVec,
    recovery_time_seconds: Gauge,
}

impl BenchMetricsInner {
    fn new() -> Self {
        Self {
            scenario_duration_seconds: register_histogram_vec!(
                "orchbench_scenario_duration_seconds",
                "Wall-clock duration of each benchmark scenario",
                &["scenario"],
                SCENARIO_BUCKETS.to_vec()
            )
            .expect("Failed to register scenario_duration_seconds"),

            scenario_results: register_int_counter_vec!(
                "orchbench_scenario_results_total",
                "Scenario completions by final status",
                &["scenario", "status"]
            )
            .expect("Failed to register scenario_results_total"),

            scenarios_running: register_int_gauge!(
                "orchbench_scenarios_running",
                "Number of scenarios currently executing"
            )
            .expect("Failed to register scenarios_running"),

            traffic_requests: register_int_counter_vec!(
                "orchbench_traffic_requests_total",
                "HTTP requests issued by the traffic generator",
                &["outcome"]
            )
            .expect("Failed to register traffic_requests_total"),

            traffic_latency_seconds: register_histogram!(
                "orchbench_traffic_latency_seconds",
                "Latency of requests issued by the traffic generator",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register traffic_latency_seconds"),

            cli_invocations: register_int_counter_vec!(
                "orchbench_cli_invocations_total",
                "Platform CLI commands executed",
                &["program"]
            )
            .expect("Failed to register cli_invocations_total"),

            cli_failures: register_int_counter_vec!(
                "orchbench_cli_failures_total",
                "Platform CLI commands that failed",
                &["program", "kind"]
            )
            .expect("Failed to register cli_failures_total"),

            recovery_time_seconds: register_gauge!(
                "orchbench_recovery_time_seconds",
                "Recovery time measured by the last fault-tolerance run"
            )
            .expect("Failed to register recovery_time_seconds"),
        }
    }
}

/// Lightweight handle to the global benchmark metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct BenchMetrics {
    _private: (),
}

impl Default for BenchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BenchMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BenchMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BenchMetricsInner {
        GLOBAL_METRICS.get_or_init(BenchMetricsInner::new)
    }

    pub fn scenario_started(&self) {
        self.inner().scenarios_running.inc();
    }

    /// Record a finished scenario
    pub fn scenario_finished(&self, scenario: &str, status: ScenarioStatus, duration_secs: f64) {
        let inner = self.inner();
        inner.scenarios_running.dec();
        inner
            .scenario_duration_seconds
            .with_label_values(&[scenario])
            .observe(duration_secs);
        inner
            .scenario_results
            .with_label_values(&[scenario, status.as_str()])
            .inc();
    }

    pub fn observe_request(&self, success: bool, latency_secs: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .traffic_requests
            .with_label_values(&[outcome])
            .inc();
        self.inner().traffic_latency_seconds.observe(latency_secs);
    }

    pub fn set_recovery_time(&self, secs: f64) {
        self.inner().recovery_time_seconds.set(secs);
    }

    pub fn inc_cli_invocations(&self, program: &str) {
        self.inner()
            .cli_invocations
            .with_label_values(&[program])
            .inc();
    }

    pub fn inc_cli_failures(&self, program: &str, kind: &str) {
        self.inner()
            .cli_failures
            .with_label_values(&[program, kind])
            .inc();
    }
}

/// Structured logger for suite and scenario events
#[derive(Clone)]
pub struct StructuredLogger {
    platform: String,
}

impl StructuredLogger {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn log_suite_started(&self, target: &str, scenarios: &[&str]) {
        info!(
            event = "suite_started",
            platform = %self.platform,
            target = %target,
            scenarios = ?scenarios,
            "Benchmark suite started"
        );
    }

    pub fn log_scenario_started(&self, scenario: &str, category: &str) {
        info!(
            event = "scenario_started",
            platform = %self.platform,
            scenario = %scenario,
            category = %category,
            "Scenario started"
        );
    }

    pub fn log_scenario_finished(
        &self,
        scenario: &str,
        status: ScenarioStatus,
        duration_secs: f64,
        message: Option<&str>,
    ) {
        if status.is_failure() || status == ScenarioStatus::Timeout {
            warn!(
                event = "scenario_finished",
                platform = %self.platform,
                scenario = %scenario,
                status = %status,
                duration_secs = duration_secs,
                message = ?message,
                "Scenario did not pass"
            );
        } else {
            info!(
                event = "scenario_finished",
                platform = %self.platform,
                scenario = %scenario,
                status = %status,
                duration_secs = duration_secs,
                "Scenario finished"
            );
        }
    }

    /// Log the drain of a worker node
    pub fn log_fault_injected(&self, node: &str, affected_instances: usize, accepted: bool) {
        warn!(
            event = "fault_injected",
            platform = %self.platform,
            node = %node,
            affected_instances = affected_instances,
            accepted = accepted,
            "Worker node drained"
        );
    }

    pub fn log_recovery(&self, node: &str, recovery_secs: Option<f64>) {
        match recovery_secs {
            Some(secs) => info!(
                event = "fault_recovered",
                platform = %self.platform,
                node = %node,
                recovery_secs = secs,
                "Service recovered from node failure"
            ),
            None => warn!(
                event = "fault_recovery_timeout",
                platform = %self.platform,
                node = %node,
                "Service did not recover before the deadline"
            ),
        }
    }

    pub fn log_node_restored(&self, node: &str, accepted: bool) {
        info!(
            event = "node_restored",
            platform = %self.platform,
            node = %node,
            accepted = accepted,
            "Worker node returned to service"
        );
    }

    pub fn log_rollout(&self, service: &str, state: &str, elapsed_secs: f64) {
        info!(
            event = "rollout_state",
            platform = %self.platform,
            service = %service,
            state = %state,
            elapsed_secs = elapsed_secs,
            "Rolling update state changed"
        );
    }

    pub fn log_suite_finished(&self, counts: &StatusCounts, duration_secs: f64) {
        info!(
            event = "suite_finished",
            platform = %self.platform,
            passed = counts.passed,
            partial = counts.partial,
            failed = counts.failed,
            timeout = counts.timeout,
            skipped = counts.skipped,
            error = counts.error,
            duration_secs = duration_secs,
            "Benchmark suite finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_metrics_handles_share_registry() {
        let metrics = BenchMetrics::new();
        metrics.scenario_started();
        metrics.scenario_finished("fault-tolerance", ScenarioStatus::Passed, 12.5);
        metrics.observe_request(true, 0.012);
        metrics.inc_cli_invocations("docker");
        metrics.inc_cli_failures("docker", "timeout");
        metrics.set_recovery_time(4.2);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "orchbench_scenario_results_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("swarm");
        assert_eq!(logger.platform(), "swarm");
    }
}
