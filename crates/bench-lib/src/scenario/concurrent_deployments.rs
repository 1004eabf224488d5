//! Concurrent deployments
//!
//! Creates N single-replica services at the same instant and measures how
//! the scheduler copes as N grows: per-deployment time to running, batch
//! throughput and how much slower each deployment gets under contention.

use super::{secs, Scenario, ScenarioContext, ScenarioKind};
use crate::driver::ClusterDriver;
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::{round_to, SummaryStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::Instant;
use tracing::{info, warn};

/// Degradation above this means deployments slow down faster than load grows
const BOTTLENECK_FACTOR: f64 = 1.5;

/// Remembers the services it created so an aborted run can remove them
#[derive(Default)]
pub struct ConcurrentDeployments {
    created: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
struct Deployment {
    name: String,
    created: bool,
    running: bool,
    command_seconds: f64,
    total_seconds: Option<f64>,
}

#[derive(Debug, Serialize)]
struct LevelReport {
    concurrency: u32,
    attempts: usize,
    successful: usize,
    success_rate: f64,
    scheduling_time: Option<SummaryStats>,
    command_time: Option<SummaryStats>,
    /// Mean spread between the fastest and slowest deployment of a batch
    spread_seconds: Option<f64>,
    throughput_per_second: Option<f64>,
    deployments: Vec<Deployment>,
}

/// Create one service once every peer is ready, then wait for it to run
async fn deploy(
    driver: Arc<dyn ClusterDriver>,
    barrier: Arc<Barrier>,
    name: String,
    timeout: Duration,
    poll: Duration,
) -> Deployment {
    barrier.wait().await;
    let started = Instant::now();
    let created = driver.create_probe_service(&name, 1).await;
    let command_seconds = secs(started.elapsed());

    let mut running = false;
    if created {
        loop {
            if driver.probe_running_tasks(&name).await >= 1 {
                running = true;
                break;
            }
            if started.elapsed() >= timeout {
                break;
            }
            tokio::time::sleep(poll).await;
        }
    }
    Deployment {
        name,
        created,
        running,
        command_seconds,
        total_seconds: running.then(|| secs(started.elapsed())),
    }
}

/// How much slower a deployment gets per unit of added concurrency,
/// comparing the largest level with the smallest
fn degradation_factor(levels: &[LevelReport]) -> Option<f64> {
    let first = levels.first()?;
    let last = levels.last()?;
    let first_avg = first.scheduling_time?.mean;
    let last_avg = last.scheduling_time?.mean;
    if first_avg <= 0.0 || last.concurrency <= first.concurrency {
        return None;
    }
    let load_ratio = last.concurrency as f64 / first.concurrency.max(1) as f64;
    Some(round_to((last_avg / first_avg) / load_ratio, 3))
}

fn status_for(success_rate: f64) -> ScenarioStatus {
    if success_rate >= 90.0 {
        ScenarioStatus::Passed
    } else if success_rate >= 70.0 {
        ScenarioStatus::Partial
    } else {
        ScenarioStatus::Failed
    }
}

impl ConcurrentDeployments {
    fn remember(&self, names: &[String]) {
        *self.created.lock().unwrap_or_else(|p| p.into_inner()) = names.to_vec();
    }

    async fn batch(&self, ctx: &ScenarioContext, concurrency: u32) -> (Vec<Deployment>, f64) {
        let settings = &ctx.settings.concurrent_deployments;
        let names: Vec<String> = (0..concurrency)
            .map(|i| format!("{}-{i}", settings.name_prefix))
            .collect();
        self.remember(&names);

        let barrier = Arc::new(Barrier::new(names.len()));
        let started = Instant::now();
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                tokio::spawn(deploy(
                    ctx.driver.clone(),
                    barrier.clone(),
                    name.clone(),
                    Duration::from_secs(settings.timeout_secs),
                    Duration::from_millis(settings.poll_interval_ms),
                ))
            })
            .collect();

        let mut deployments = Vec::with_capacity(handles.len());
        for (handle, name) in handles.into_iter().zip(&names) {
            match handle.await {
                Ok(deployment) => deployments.push(deployment),
                Err(e) => {
                    warn!(service = %name, error = %e, "Deployment task ended abnormally");
                    deployments.push(Deployment {
                        name: name.clone(),
                        created: false,
                        running: false,
                        command_seconds: 0.0,
                        total_seconds: None,
                    });
                }
            }
        }
        let batch_seconds = started.elapsed().as_secs_f64();

        for name in &names {
            ctx.driver.remove_probe_service(name).await;
        }
        self.remember(&[]);
        (deployments, batch_seconds)
    }

    async fn measure_level(&self, ctx: &ScenarioContext, concurrency: u32) -> LevelReport {
        let settings = &ctx.settings.concurrent_deployments;
        let mut deployments = Vec::new();
        let mut throughputs = Vec::new();
        let mut spreads = Vec::new();

        for iteration in 1..=settings.iterations.max(1) {
            let (batch, batch_seconds) = self.batch(ctx, concurrency).await;
            let times: Vec<f64> = batch.iter().filter_map(|d| d.total_seconds).collect();
            if let Some(stats) = SummaryStats::from_values(&times) {
                spreads.push(stats.max - stats.min);
            }
            if batch_seconds > 0.0 {
                throughputs.push(times.len() as f64 / batch_seconds);
            }
            info!(
                concurrency = concurrency,
                iteration = iteration,
                running = times.len(),
                batch_secs = batch_seconds,
                "Concurrent batch measured"
            );
            deployments.extend(batch);
            tokio::time::sleep(Duration::from_secs(settings.cooldown_secs)).await;
        }

        let times: Vec<f64> = deployments.iter().filter_map(|d| d.total_seconds).collect();
        let commands: Vec<f64> = deployments
            .iter()
            .filter(|d| d.created)
            .map(|d| d.command_seconds)
            .collect();
        let successful = times.len();
        LevelReport {
            concurrency,
            attempts: deployments.len(),
            successful,
            success_rate: round_to(successful as f64 / deployments.len().max(1) as f64 * 100.0, 2),
            scheduling_time: SummaryStats::from_values(&times),
            command_time: SummaryStats::from_values(&commands),
            spread_seconds: SummaryStats::from_values(&spreads).map(|s| round_to(s.mean, 3)),
            throughput_per_second: SummaryStats::from_values(&throughputs)
                .map(|s| round_to(s.mean, 3)),
            deployments,
        }
    }
}

#[async_trait]
impl Scenario for ConcurrentDeployments {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::ConcurrentDeployments
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.concurrent_deployments;
        let mut result = ctx.begin(self.kind());

        let mut levels = Vec::new();
        for &concurrency in settings.levels.iter().filter(|&&n| n > 0) {
            levels.push(self.measure_level(ctx, concurrency).await);
        }
        if levels.is_empty() {
            return Ok(result.finish(
                ScenarioStatus::Skipped,
                Some("no concurrency levels configured".to_string()),
            ));
        }

        let attempts: usize = levels.iter().map(|l| l.attempts).sum();
        let successful: usize = levels.iter().map(|l| l.successful).sum();
        let success_rate = round_to(successful as f64 / attempts.max(1) as f64 * 100.0, 2);
        let degradation = degradation_factor(&levels);
        let max_throughput = levels
            .iter()
            .filter_map(|l| l.throughput_per_second)
            .fold(None, |best: Option<f64>, t| Some(best.map_or(t, |b| b.max(t))));

        result.set_metric("success_rate", success_rate);
        result.set_metric("degradation_factor", degradation);
        result.set_metric(
            "scheduler_bottleneck",
            degradation.is_some_and(|d| d > BOTTLENECK_FACTOR),
        );
        result.set_metric("max_throughput_per_second", max_throughput);
        result.set_metric("levels", &levels);

        let status = status_for(success_rate);
        let message = (status != ScenarioStatus::Passed).then(|| {
            format!("{successful} of {attempts} concurrent deployments reached running")
        });
        Ok(result.finish(status, message))
    }

    async fn cleanup(&self, ctx: &ScenarioContext) {
        let names = std::mem::take(&mut *self.created.lock().unwrap_or_else(|p| p.into_inner()));
        for name in names {
            ctx.driver.remove_probe_service(&name).await;
        }
    }
}
