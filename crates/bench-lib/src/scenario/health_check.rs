//! Health check responsiveness
//!
//! Kills the application process inside one instance and measures how long
//! the platform's health monitoring takes to notice, schedule a replacement
//! and get the service back to full strength.

use super::{secs, wait_for_convergence, Scenario, ScenarioContext, ScenarioKind};
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::{round_to, SummaryStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct HealthCheck;

#[derive(Debug, Serialize)]
struct IterationReport {
    iteration: u32,
    converged: bool,
    instances_before: usize,
    /// The exec session may die with the process it killed, so this is informational
    kill_acknowledged: bool,
    time_to_new_task_seconds: Option<f64>,
    time_to_healthy_seconds: Option<f64>,
    polls: u32,
    success: bool,
}

impl HealthCheck {
    async fn iteration(ctx: &ScenarioContext, iteration: u32) -> IterationReport {
        let settings = &ctx.settings.health_check;
        let service = ctx.settings.service.as_str();
        let poll = Duration::from_millis(settings.poll_interval_ms);
        let timeout = Duration::from_secs(settings.timeout_secs);

        ctx.driver.scale(service, settings.replicas).await;
        let converged = wait_for_convergence(
            ctx.driver.as_ref(),
            service,
            settings.replicas,
            Duration::from_secs(settings.convergence_timeout_secs),
            poll,
        )
        .await
        .converged;

        let before: HashSet<String> = ctx
            .driver
            .running_instances(service)
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        let mut report = IterationReport {
            iteration,
            converged,
            instances_before: before.len(),
            kill_acknowledged: false,
            time_to_new_task_seconds: None,
            time_to_healthy_seconds: None,
            polls: 0,
            success: false,
        };
        if before.is_empty() {
            warn!(service = %service, iteration = iteration, "No running instance to make unhealthy");
            return report;
        }

        let argv: Vec<&str> = settings.kill_command.iter().map(String::as_str).collect();
        let killed_at = Instant::now();
        report.kill_acknowledged = ctx.driver.exec_in_service(service, &argv).await.is_some();

        while killed_at.elapsed() < timeout {
            tokio::time::sleep(poll).await;
            report.polls += 1;

            let instances = ctx.driver.running_instances(service).await;
            let count = ctx.driver.replica_count(service).await;
            if report.time_to_new_task_seconds.is_none()
                && instances.iter().any(|i| !before.contains(&i.id))
            {
                report.time_to_new_task_seconds = Some(secs(killed_at.elapsed()));
            }
            debug!(
                iteration = iteration,
                running = count.running,
                replaced = report.time_to_new_task_seconds.is_some(),
                "Health check poll"
            );
            if report.time_to_new_task_seconds.is_some() && count.running >= settings.replicas {
                report.time_to_healthy_seconds = Some(secs(killed_at.elapsed()));
                report.success = true;
                break;
            }
        }

        info!(
            iteration = iteration,
            new_task_secs = ?report.time_to_new_task_seconds,
            healthy_secs = ?report.time_to_healthy_seconds,
            "Health check response measured"
        );
        report
    }
}

#[async_trait]
impl Scenario for HealthCheck {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::HealthCheck
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.health_check;
        let iterations = settings.iterations.max(1);
        let mut result = ctx.begin(self.kind());

        let mut reports = Vec::new();
        for iteration in 1..=iterations {
            reports.push(Self::iteration(ctx, iteration).await);
            if iteration < iterations {
                tokio::time::sleep(Duration::from_secs(settings.iteration_cooldown_secs)).await;
            }
        }
        self.cleanup(ctx).await;

        let successful = reports.iter().filter(|r| r.success).count();
        let success_rate = round_to(successful as f64 / reports.len() as f64 * 100.0, 2);
        let detection: Vec<f64> = reports
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.time_to_new_task_seconds)
            .collect();
        let healthy: Vec<f64> = reports
            .iter()
            .filter_map(|r| r.time_to_healthy_seconds)
            .collect();
        let healthy_stats = SummaryStats::from_values(&healthy);

        result.set_metric("iterations", reports.len());
        result.set_metric("success_rate", success_rate);
        result.set_metric("avg_time_to_healthy_seconds", healthy_stats.map(|s| s.mean));
        result.set_metric("time_to_new_task", SummaryStats::from_values(&detection));
        result.set_metric("time_to_healthy", healthy_stats);
        result.set_metric("iteration_results", &reports);

        let (status, message) = if success_rate > 50.0 {
            (ScenarioStatus::Passed, None)
        } else if reports.iter().all(|r| r.instances_before == 0) {
            (
                ScenarioStatus::Failed,
                Some(format!("no running instance of {}", ctx.settings.service)),
            )
        } else {
            (
                ScenarioStatus::Failed,
                Some(format!(
                    "{successful} of {} unhealthy instances were replaced within {}s",
                    reports.len(),
                    settings.timeout_secs
                )),
            )
        };
        Ok(result.finish(status, message))
    }

    async fn cleanup(&self, ctx: &ScenarioContext) {
        ctx.driver
            .scale(&ctx.settings.service, ctx.settings.restore_replicas)
            .await;
    }
}
