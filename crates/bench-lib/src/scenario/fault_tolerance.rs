//! Node failure recovery
//!
//! Each iteration drains the worker node hosting the most instances while
//! traffic flows and measures how long the platform takes to schedule and
//! run replacements for the instances that were there.

use super::{secs, wait_for_convergence, Convergence, Scenario, ScenarioContext, ScenarioKind};
use crate::driver::TaskInstance;
use crate::models::{ScenarioResult, ScenarioStatus, TrafficSample};
use crate::stats::{round_to, SummaryStats};
use crate::traffic::{TrafficGenerator, TrafficStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Share of iterations that must recover for the scenario to pass
const REQUIRED_RECOVERY_RATE: f64 = 0.8;

/// Remembers the drained node so an aborted run can still restore it
#[derive(Default)]
pub struct FaultTolerance {
    drained: Mutex<Option<String>>,
}

#[derive(Debug, Serialize)]
struct Recovery {
    recovered: bool,
    recovery_time_seconds: Option<f64>,
    /// Until the first instance absent before the fault was seen
    scheduling_time_seconds: Option<f64>,
    polls: u32,
    final_running: u32,
    remaining_victims: usize,
}

#[derive(Debug, Serialize)]
struct IterationReport {
    iteration: u32,
    baseline_converged: bool,
    victim_node: Option<String>,
    drain_accepted: bool,
    node_restored: bool,
    affected_instances: usize,
    instances_before: usize,
    instances_after: usize,
    recovery: Option<Recovery>,
    fault_window: TrafficStats,
    traffic: TrafficStats,
}

impl IterationReport {
    fn recovered(&self) -> bool {
        self.recovery.as_ref().is_some_and(|r| r.recovered)
    }
}

/// The worker hosting the most instances, ties going to the earlier worker
fn pick_victim(workers: &[String], instances: &[TaskInstance]) -> Option<(String, usize)> {
    let mut best: Option<(&String, usize)> = None;
    for node in workers {
        let hosted = instances.iter().filter(|i| &i.node == node).count();
        if hosted > 0 && best.map_or(true, |(_, most)| hosted > most) {
            best = Some((node, hosted));
        }
    }
    best.map(|(node, hosted)| (node.clone(), hosted))
}

fn meets_recovery_rate(recovered: usize, iterations: usize) -> bool {
    iterations > 0 && recovered as f64 >= REQUIRED_RECOVERY_RATE * iterations as f64
}

impl FaultTolerance {
    fn remember(&self, node: Option<String>) {
        *self.drained.lock().unwrap_or_else(|p| p.into_inner()) = node;
    }

    /// Scale to the baseline and wait for every replica to run
    async fn converge(ctx: &ScenarioContext) -> Convergence {
        let settings = &ctx.settings.fault_tolerance;
        let service = ctx.settings.service.as_str();
        ctx.driver.scale(service, settings.baseline_replicas).await;
        wait_for_convergence(
            ctx.driver.as_ref(),
            service,
            settings.baseline_replicas,
            Duration::from_secs(settings.convergence_timeout_secs),
            settings.poll_interval(),
        )
        .await
    }

    /// Poll until the running count is back to `baseline` and none of
    /// `victims` is still among the running instances
    async fn monitor(
        ctx: &ScenarioContext,
        initial: &HashSet<String>,
        victims: &HashSet<String>,
        baseline: u32,
        fault_at: Instant,
    ) -> Recovery {
        let settings = &ctx.settings.fault_tolerance;
        let timeout = Duration::from_secs(settings.recovery_timeout_secs);
        let service = ctx.settings.service.as_str();
        let mut polls = 0;
        let mut scheduling_time = None;

        loop {
            tokio::time::sleep(settings.poll_interval()).await;
            polls += 1;

            let count = ctx.driver.replica_count(service).await;
            let instances = ctx.driver.running_instances(service).await;
            let remaining_victims = instances.iter().filter(|i| victims.contains(&i.id)).count();
            if scheduling_time.is_none() && instances.iter().any(|i| !initial.contains(&i.id)) {
                scheduling_time = Some(secs(fault_at.elapsed()));
            }
            debug!(
                polls = polls,
                running = count.running,
                remaining_victims = remaining_victims,
                "Recovery poll"
            );

            let recovered = count.running >= baseline && remaining_victims == 0;
            if recovered || fault_at.elapsed() >= timeout {
                return Recovery {
                    recovered,
                    recovery_time_seconds: recovered.then(|| secs(fault_at.elapsed())),
                    scheduling_time_seconds: scheduling_time,
                    polls,
                    final_running: count.running,
                    remaining_victims,
                };
            }
        }
    }

    async fn iteration(
        &self,
        ctx: &ScenarioContext,
        iteration: u32,
        workers: &[String],
        baseline_converged: bool,
        fault_samples: &mut Vec<TrafficSample>,
        samples: &mut Vec<TrafficSample>,
    ) -> Result<IterationReport> {
        let settings = &ctx.settings.fault_tolerance;
        let service = ctx.settings.service.as_str();
        let baseline = settings.baseline_replicas;

        let before: Vec<TaskInstance> = ctx.driver.running_instances(service).await;
        let Some((victim, hosted)) = pick_victim(workers, &before) else {
            warn!(
                service = %service,
                iteration = iteration,
                instances = before.len(),
                "No worker node hosts an instance, skipping fault injection"
            );
            return Ok(IterationReport {
                iteration,
                baseline_converged,
                victim_node: None,
                drain_accepted: false,
                node_restored: false,
                affected_instances: 0,
                instances_before: before.len(),
                instances_after: before.len(),
                recovery: None,
                fault_window: TrafficStats::default(),
                traffic: TrafficStats::default(),
            });
        };
        let initial: HashSet<String> = before.iter().map(|i| i.id.clone()).collect();
        let victims: HashSet<String> = before
            .iter()
            .filter(|i| i.node == victim)
            .map(|i| i.id.clone())
            .collect();

        // BASELINE
        let traffic = TrafficGenerator::new(ctx.traffic_config()?)?;
        let max_traffic = Duration::from_millis(settings.baseline_window_ms)
            + Duration::from_secs(settings.recovery_timeout_secs)
            + Duration::from_secs(30);
        traffic.start(settings.rps, settings.workers, max_traffic);
        tokio::time::sleep(Duration::from_millis(settings.baseline_window_ms)).await;

        // INJECT
        let fault_offset_ms = traffic.elapsed().as_millis() as u64;
        let fault_at = Instant::now();
        self.remember(Some(victim.clone()));
        let accepted = ctx.driver.drain_node(&victim).await;
        ctx.logger.log_fault_injected(&victim, hosted, accepted);

        // MONITOR
        let recovery = Self::monitor(ctx, &initial, &victims, baseline, fault_at).await;
        ctx.logger
            .log_recovery(&victim, recovery.recovery_time_seconds);
        if let Some(rto) = recovery.recovery_time_seconds {
            ctx.metrics.set_recovery_time(rto);
        }

        // RESTORE
        let restored = ctx.driver.restore_node(&victim).await;
        self.remember(None);
        ctx.logger.log_node_restored(&victim, restored);

        let overall = traffic.stop().await;
        let window = traffic.log().since(fault_offset_ms);
        let fault_window = TrafficStats::from_samples(&window);
        fault_samples.extend(window);
        samples.extend(traffic.log().snapshot());
        let after = ctx.driver.running_instances(service).await;

        Ok(IterationReport {
            iteration,
            baseline_converged,
            victim_node: Some(victim),
            drain_accepted: accepted,
            node_restored: restored,
            affected_instances: victims.len(),
            instances_before: before.len(),
            instances_after: after.len(),
            recovery: Some(recovery),
            fault_window,
            traffic: overall,
        })
    }
}

#[async_trait]
impl Scenario for FaultTolerance {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::FaultTolerance
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.fault_tolerance;
        let service = ctx.settings.service.as_str();
        let baseline = settings.baseline_replicas;
        let iterations = settings.iterations.max(1);
        let mut result = ctx.begin(self.kind());
        result.set_metric("baseline_replicas", baseline);

        // INIT
        let convergence = Self::converge(ctx).await;
        result.set_metric("baseline_convergence", convergence);
        if !convergence.converged {
            return Ok(result.finish(
                ScenarioStatus::Failed,
                Some(format!("service never reached {baseline} replicas")),
            ));
        }

        let workers = ctx.driver.worker_nodes().await;
        if workers.is_empty() {
            return Ok(result.finish(
                ScenarioStatus::Skipped,
                Some("no schedulable worker nodes".to_string()),
            ));
        }

        let mut reports = Vec::new();
        let mut fault_samples = Vec::new();
        let mut samples = Vec::new();
        let mut converged = true;
        for iteration in 1..=iterations {
            reports.push(
                self.iteration(ctx, iteration, &workers, converged, &mut fault_samples, &mut samples)
                    .await?,
            );
            if iteration < iterations {
                // Let the restored node take work again before the next fault
                tokio::time::sleep(Duration::from_secs(settings.iteration_cooldown_secs)).await;
                converged = Self::converge(ctx).await.converged;
            }
        }

        // ANALYZE
        let injected = reports.iter().filter(|r| r.victim_node.is_some()).count();
        let recovered = reports.iter().filter(|r| r.recovered()).count();
        let recovery_times: Vec<f64> = reports
            .iter()
            .filter_map(|r| r.recovery.as_ref()?.recovery_time_seconds)
            .collect();
        let scheduling_times: Vec<f64> = reports
            .iter()
            .filter_map(|r| r.recovery.as_ref()?.scheduling_time_seconds)
            .collect();
        let recovery_stats = SummaryStats::from_values(&recovery_times);
        let fault_window = TrafficStats::from_samples(&fault_samples);
        let overall = TrafficStats::from_samples(&samples);

        result.set_metric("iterations", reports.len());
        result.set_metric("successful_recoveries", recovered);
        result.set_metric(
            "recovery_success_rate",
            round_to(recovered as f64 / reports.len() as f64 * 100.0, 2),
        );
        result.set_metric("recovered", meets_recovery_rate(recovered, reports.len()));
        result.set_metric("recovery_time_seconds", recovery_stats.map(|s| s.mean));
        result.set_metric("recovery_time", recovery_stats);
        result.set_metric("scheduling_time", SummaryStats::from_values(&scheduling_times));
        result.set_metric("fault_window_failure_rate", fault_window.error_rate);
        result.set_metric("fault_window_traffic", &fault_window);
        result.set_metric("traffic", &overall);
        result.set_metric("iteration_results", &reports);
        if ctx.settings.include_raw_samples {
            result.raw_samples = Some(samples);
        }

        let threshold = ctx.settings.failure_threshold_percent;
        let (status, message) = if injected == 0 {
            (
                ScenarioStatus::Failed,
                Some(format!("no worker node hosts an instance of {service}")),
            )
        } else if !meets_recovery_rate(recovered, reports.len()) {
            (
                ScenarioStatus::Failed,
                Some(format!(
                    "{recovered} of {} iterations recovered within {}s",
                    reports.len(),
                    settings.recovery_timeout_secs
                )),
            )
        } else if fault_window.error_rate > threshold {
            (
                ScenarioStatus::Failed,
                Some(format!(
                    "fault window failure rate {:.2}% above {threshold}%",
                    fault_window.error_rate
                )),
            )
        } else {
            (ScenarioStatus::Passed, None)
        };
        Ok(result.finish(status, message))
    }

    async fn cleanup(&self, ctx: &ScenarioContext) {
        let node = self.drained.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(node) = node {
            let restored = ctx.driver.restore_node(&node).await;
            ctx.logger.log_node_restored(&node, restored);
        }
    }
}
