//! Per-container resource overhead
//!
//! Samples host-level container usage with the service scaled to zero and
//! again with N idle replicas; the difference divided by N is the cost of
//! one container on this platform.

use super::{wait_for_convergence, Convergence, Scenario, ScenarioContext, ScenarioKind};
use crate::driver::ResourceUsage;
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::{round_to, SummaryStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub struct ResourceOverhead;

#[derive(Debug, Serialize)]
struct Phase {
    replicas: u32,
    convergence: Convergence,
    samples: Vec<ResourceUsage>,
    memory_mb: Option<SummaryStats>,
    cpu_percent: Option<SummaryStats>,
    containers: Option<SummaryStats>,
}

impl Phase {
    fn memory_mean(&self) -> Option<f64> {
        self.memory_mb.map(|s| s.mean)
    }

    fn cpu_mean(&self) -> Option<f64> {
        self.cpu_percent.map(|s| s.mean)
    }
}

impl ResourceOverhead {
    async fn sample_phase(ctx: &ScenarioContext, replicas: u32) -> Phase {
        let settings = &ctx.settings.resource_overhead;
        let service = ctx.settings.service.as_str();

        ctx.driver.scale(service, replicas).await;
        let convergence = wait_for_convergence(
            ctx.driver.as_ref(),
            service,
            replicas,
            Duration::from_secs(settings.convergence_timeout_secs),
            Duration::from_secs(1),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(settings.settle_secs)).await;

        let mut samples = Vec::new();
        for i in 0..settings.samples {
            let usage = ctx.driver.resource_usage().await;
            // A zero-container reading means the stats command failed
            if usage.container_count > 0 {
                samples.push(usage);
            }
            if i + 1 < settings.samples {
                tokio::time::sleep(Duration::from_millis(settings.sample_interval_ms)).await;
            }
        }

        let memory: Vec<f64> = samples.iter().map(|s| s.memory_mb).collect();
        let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
        let containers: Vec<f64> = samples.iter().map(|s| s.container_count as f64).collect();
        Phase {
            replicas,
            convergence,
            memory_mb: SummaryStats::from_values(&memory),
            cpu_percent: SummaryStats::from_values(&cpu),
            containers: SummaryStats::from_values(&containers),
            samples,
        }
    }
}

#[async_trait]
impl Scenario for ResourceOverhead {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::ResourceOverhead
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let containers = ctx.settings.resource_overhead.containers.max(1);
        let mut result = ctx.begin(self.kind());

        let idle = Self::sample_phase(ctx, 0).await;
        let loaded = Self::sample_phase(ctx, containers).await;
        self.cleanup(ctx).await;

        let per_container = |base: Option<f64>, load: Option<f64>| match (base, load) {
            (Some(base), Some(load)) => Some(round_to((load - base) / containers as f64, 3)),
            _ => None,
        };
        let memory_per_container = per_container(idle.memory_mean(), loaded.memory_mean());
        let cpu_per_container = per_container(idle.cpu_mean(), loaded.cpu_mean());

        result.set_metric("containers", containers);
        result.set_metric("memory_per_container_mb", memory_per_container);
        result.set_metric("cpu_per_container_percent", cpu_per_container);
        result.set_metric(
            "memory_delta_mb",
            loaded
                .memory_mean()
                .zip(idle.memory_mean())
                .map(|(l, b)| round_to(l - b, 3)),
        );
        result.set_metric(
            "avg_memory_per_sampled_container_mb",
            loaded.containers.and_then(|c| {
                let memory = loaded.memory_mean()?;
                (c.mean > 0.0).then(|| round_to(memory / c.mean, 3))
            }),
        );
        result.set_metric("idle", &idle);
        result.set_metric("loaded", &loaded);

        let (status, message) = if memory_per_container.is_none() {
            (
                ScenarioStatus::Failed,
                Some("resource usage could not be sampled".to_string()),
            )
        } else if !loaded.convergence.converged {
            (
                ScenarioStatus::Partial,
                Some(format!(
                    "only {} of {containers} replicas were running while sampling",
                    loaded.convergence.last.running
                )),
            )
        } else {
            (ScenarioStatus::Passed, None)
        };
        Ok(result.finish(status, message))
    }

    /// Both phases rescale the service, so an aborted run leaves it at 0 or N
    async fn cleanup(&self, ctx: &ScenarioContext) {
        ctx.driver
            .scale(&ctx.settings.service, ctx.settings.restore_replicas)
            .await;
    }
}
