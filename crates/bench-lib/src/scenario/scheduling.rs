//! Scheduling overhead
//!
//! Creates probe services of increasing size and times how long the
//! scheduler takes to get every replica running.

use super::{secs, Scenario, ScenarioContext, ScenarioKind};
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::round_to;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

pub struct SchedulingOverhead;

#[derive(Debug, Serialize)]
struct LevelReport {
    containers: u32,
    created: bool,
    converged: bool,
    observed_running: u32,
    command_seconds: f64,
    total_time_seconds: f64,
    time_per_container_seconds: Option<f64>,
    containers_per_second: Option<f64>,
}

impl SchedulingOverhead {
    /// Poll until `target` probe tasks run; returns the last observed count
    async fn wait_for_tasks(
        ctx: &ScenarioContext,
        name: &str,
        target: u32,
        started: Instant,
    ) -> (bool, u32) {
        let settings = &ctx.settings.scheduling;
        let timeout = Duration::from_secs(settings.timeout_secs);
        loop {
            let running = ctx.driver.probe_running_tasks(name).await;
            if running >= target {
                return (true, running);
            }
            if started.elapsed() >= timeout {
                return (false, running);
            }
            tokio::time::sleep(Duration::from_millis(settings.poll_interval_ms)).await;
        }
    }

    async fn measure_level(ctx: &ScenarioContext, containers: u32) -> LevelReport {
        let name = ctx.settings.scheduling.probe_name.as_str();
        let started = Instant::now();
        let created = ctx.driver.create_probe_service(name, containers).await;
        let command_seconds = secs(started.elapsed());

        let (converged, observed_running) = if created {
            Self::wait_for_tasks(ctx, name, containers, started).await
        } else {
            (false, 0)
        };
        let total = started.elapsed().as_secs_f64();
        ctx.driver.remove_probe_service(name).await;

        info!(
            containers = containers,
            converged = converged,
            total_secs = total,
            "Scheduling level measured"
        );

        LevelReport {
            containers,
            created,
            converged,
            observed_running,
            command_seconds,
            total_time_seconds: round_to(total, 3),
            time_per_container_seconds: (converged && containers > 0)
                .then(|| round_to(total / containers as f64, 4)),
            containers_per_second: (converged && total > 0.0)
                .then(|| round_to(containers as f64 / total, 2)),
        }
    }
}

#[async_trait]
impl Scenario for SchedulingOverhead {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::SchedulingOverhead
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.scheduling;
        let name = settings.probe_name.as_str();
        let cooldown = Duration::from_secs(settings.cooldown_secs);
        let mut result = ctx.begin(self.kind());

        // Leftovers from an aborted run would skew the first level
        ctx.driver.remove_probe_service(name).await;
        tokio::time::sleep(cooldown).await;

        if settings.warmup_replicas > 0 {
            let warmup = Self::measure_level(ctx, settings.warmup_replicas).await;
            result.set_metric("warmup", &warmup);
            tokio::time::sleep(cooldown).await;
        }

        let mut levels = Vec::new();
        for &containers in &settings.levels {
            levels.push(Self::measure_level(ctx, containers).await);
            tokio::time::sleep(cooldown).await;
        }

        let converged = levels.iter().filter(|l| l.converged).count();
        let best = levels
            .iter()
            .filter_map(|l| l.containers_per_second)
            .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))));

        result.set_metric("levels", &levels);
        result.set_metric("converged_levels", converged);
        result.set_metric("best_containers_per_second", best);

        let status = if levels.is_empty() {
            ScenarioStatus::Skipped
        } else if converged == levels.len() {
            ScenarioStatus::Passed
        } else if converged > 0 {
            ScenarioStatus::Partial
        } else {
            ScenarioStatus::Failed
        };
        let message = (status != ScenarioStatus::Passed)
            .then(|| format!("{converged} of {} levels converged", levels.len()));
        Ok(result.finish(status, message))
    }

    async fn cleanup(&self, ctx: &ScenarioContext) {
        ctx.driver
            .remove_probe_service(&ctx.settings.scheduling.probe_name)
            .await;
    }
}
