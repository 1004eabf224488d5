//! Rolling update availability
//!
//! Forces a redeploy of every instance while traffic flows and reports
//! whether any request failed during the update.

use super::{
    secs, wait_for_convergence, wait_for_rollout, RolloutOutcome, Scenario, ScenarioContext,
    ScenarioKind,
};
use crate::driver::RolloutState;
use crate::models::{ScenarioResult, ScenarioStatus, TrafficSample};
use crate::traffic::{ErrorWindow, TrafficGenerator, TrafficStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

pub struct RollingUpdate;

#[derive(Debug, Serialize)]
struct IterationReport {
    iteration: u32,
    triggered: bool,
    completed: bool,
    timed_out: bool,
    final_state: String,
    update_time_seconds: Option<f64>,
    zero_downtime: bool,
    meets_sla: bool,
    containers_replaced: usize,
    rollout: Option<RolloutOutcome>,
    traffic: TrafficStats,
    error_windows: Vec<ErrorWindow>,
}

impl RollingUpdate {
    async fn iteration(
        ctx: &ScenarioContext,
        iteration: u32,
        samples: &mut Vec<TrafficSample>,
    ) -> Result<IterationReport> {
        let settings = &ctx.settings.rolling_update;
        let service = ctx.settings.service.as_str();

        let before: HashSet<String> = ctx
            .driver
            .running_instances(service)
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();

        let traffic = TrafficGenerator::new(ctx.traffic_config()?)?;
        let max_traffic = Duration::from_secs(
            settings.warmup_secs + settings.timeout_secs + settings.tail_secs + 30,
        );
        traffic.start(settings.rps, settings.workers, max_traffic);
        tokio::time::sleep(Duration::from_secs(settings.warmup_secs)).await;

        let triggered_at = Instant::now();
        let triggered = ctx.driver.trigger_rolling_update(service).await;
        let rollout = if triggered {
            Some(
                wait_for_rollout(
                    ctx,
                    service,
                    Duration::from_secs(settings.timeout_secs),
                    Duration::from_millis(settings.poll_interval_ms),
                    Duration::from_secs(settings.min_update_window_secs),
                )
                .await,
            )
        } else {
            None
        };
        let update_time = secs(triggered_at.elapsed());

        tokio::time::sleep(Duration::from_secs(settings.tail_secs)).await;
        let stats = traffic.stop().await;
        let windows = traffic.error_windows();
        samples.extend(traffic.log().snapshot());

        let after: HashSet<String> = ctx
            .driver
            .running_instances(service)
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();

        let completed = rollout.as_ref().is_some_and(|r| r.completed());
        let timed_out = rollout.as_ref().is_some_and(|r| r.timed_out);
        let final_state = rollout
            .as_ref()
            .map(|r| r.state.as_str())
            .unwrap_or("not_triggered")
            .to_string();

        Ok(IterationReport {
            iteration,
            triggered,
            completed,
            timed_out,
            final_state,
            update_time_seconds: completed.then_some(update_time),
            zero_downtime: stats.failed == 0,
            meets_sla: stats.error_rate < settings.sla_error_rate_percent,
            containers_replaced: before.difference(&after).count(),
            rollout,
            traffic: stats,
            error_windows: windows,
        })
    }
}

#[async_trait]
impl Scenario for RollingUpdate {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::RollingUpdate
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.rolling_update;
        let service = ctx.settings.service.as_str();
        let mut result = ctx.begin(self.kind());

        ctx.driver.scale(service, settings.replicas).await;
        let convergence = wait_for_convergence(
            ctx.driver.as_ref(),
            service,
            settings.replicas,
            Duration::from_secs(settings.convergence_timeout_secs),
            Duration::from_millis(settings.poll_interval_ms),
        )
        .await;
        result.set_metric("initial_convergence", convergence);
        if !convergence.converged {
            return Ok(result.finish(
                ScenarioStatus::Failed,
                Some(format!("service never reached {} replicas", settings.replicas)),
            ));
        }

        let iterations = settings.iterations.max(1);
        let mut reports = Vec::new();
        let mut samples = Vec::new();
        for iteration in 1..=iterations {
            reports.push(Self::iteration(ctx, iteration, &mut samples).await?);
            if iteration < iterations {
                tokio::time::sleep(Duration::from_secs(settings.iteration_cooldown_secs)).await;
            }
        }

        let all = TrafficStats::from_samples(&samples);
        let completed = reports.iter().filter(|r| r.completed).count();
        let meeting_sla = reports.iter().filter(|r| r.completed && r.meets_sla).count();
        let update_times: Vec<f64> = reports.iter().filter_map(|r| r.update_time_seconds).collect();

        result.set_metric("iterations", reports.len());
        result.set_metric("completed_iterations", completed);
        result.set_metric("zero_downtime", reports.iter().all(|r| r.zero_downtime));
        result.set_metric("meets_sla", meeting_sla == reports.len());
        result.set_metric(
            "avg_update_time_seconds",
            (!update_times.is_empty()).then(|| crate::stats::mean(&update_times)),
        );
        result.set_metric("error_rate", all.error_rate);
        result.set_metric("traffic", &all);
        result.set_metric("iteration_results", &reports);
        if ctx.settings.include_raw_samples {
            result.raw_samples = Some(samples);
        }

        let (status, message) = if reports.iter().any(|r| !r.triggered) {
            (
                ScenarioStatus::Failed,
                Some("rolling update command was rejected".to_string()),
            )
        } else if reports
            .iter()
            .any(|r| r.rollout.as_ref().is_some_and(|o| o.state == RolloutState::Failed))
        {
            (
                ScenarioStatus::Failed,
                Some("platform reported the update as failed".to_string()),
            )
        } else if completed < reports.len() {
            (
                ScenarioStatus::Timeout,
                Some(format!(
                    "{} of {} updates did not complete within {}s",
                    reports.len() - completed,
                    reports.len(),
                    settings.timeout_secs
                )),
            )
        } else if meeting_sla == reports.len() {
            (ScenarioStatus::Passed, None)
        } else {
            (
                ScenarioStatus::Partial,
                Some(format!(
                    "error rate exceeded {}% in {} of {} updates",
                    settings.sla_error_rate_percent,
                    reports.len() - meeting_sla,
                    reports.len()
                )),
            )
        };
        Ok(result.finish(status, message))
    }
}
