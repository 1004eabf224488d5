//! Horizontal scalability and load balancing
//!
//! Scales the service through several replica counts and, at each level,
//! fires a fixed burst of requests over fresh connections to measure
//! throughput and how evenly the platform spreads them.

use super::{secs, wait_for_convergence, Convergence, Scenario, ScenarioContext, ScenarioKind};
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::{fairness, round_to, FairnessMetrics};
use crate::traffic::{TrafficGenerator, TrafficStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

pub struct Scalability;

#[derive(Debug, Serialize)]
struct LevelReport {
    replicas: u32,
    convergence: Convergence,
    responders_seen: usize,
    all_replicas_responding: bool,
    responder_wait_seconds: f64,
    duration_seconds: f64,
    throughput_rps: f64,
    traffic: TrafficStats,
    distribution: Option<FairnessMetrics>,
}

impl Scalability {
    /// Probe with small bursts until `replicas` distinct responders answer
    async fn wait_for_responders(ctx: &ScenarioContext, replicas: u32) -> Result<(usize, f64)> {
        let settings = &ctx.settings.scalability;
        let timeout = Duration::from_secs(settings.responder_timeout_secs);
        let start = Instant::now();
        loop {
            let mut config = ctx.traffic_config()?;
            config.disable_keep_alive = true;
            let probe = TrafficGenerator::new(config)?;
            let stats = probe
                .burst(replicas as usize * 3 + 5, settings.workers)
                .await;
            let seen = stats.responders.len();
            if seen >= replicas as usize || start.elapsed() >= timeout {
                return Ok((seen, secs(start.elapsed())));
            }
            tokio::time::sleep(Duration::from_millis(settings.poll_interval_ms)).await;
        }
    }

    async fn measure_level(ctx: &ScenarioContext, replicas: u32) -> Result<LevelReport> {
        let settings = &ctx.settings.scalability;
        let service = ctx.settings.service.as_str();

        ctx.driver.scale(service, replicas).await;
        let convergence = wait_for_convergence(
            ctx.driver.as_ref(),
            service,
            replicas,
            Duration::from_secs(settings.convergence_timeout_secs),
            Duration::from_millis(settings.poll_interval_ms),
        )
        .await;
        let (responders_seen, responder_wait_seconds) =
            Self::wait_for_responders(ctx, replicas).await?;

        let mut config = ctx.traffic_config()?;
        config.disable_keep_alive = true;
        let traffic = TrafficGenerator::new(config)?;
        let started = Instant::now();
        let stats = traffic.burst(settings.requests, settings.workers).await;
        let duration = started.elapsed().as_secs_f64();

        let counts: Vec<u64> = stats.responders.values().copied().collect();
        let throughput = if duration > 0.0 {
            round_to(stats.successful as f64 / duration, 2)
        } else {
            0.0
        };

        info!(
            replicas = replicas,
            throughput_rps = throughput,
            responders = stats.responders.len(),
            "Scalability level measured"
        );

        Ok(LevelReport {
            replicas,
            convergence,
            all_replicas_responding: stats.responders.len() >= replicas as usize,
            responders_seen: responders_seen.max(stats.responders.len()),
            responder_wait_seconds,
            duration_seconds: round_to(duration, 3),
            throughput_rps: throughput,
            distribution: fairness(&counts),
            traffic: stats,
        })
    }

    async fn measure_levels(ctx: &ScenarioContext, levels: &[u32]) -> Result<Vec<LevelReport>> {
        let mut reports = Vec::with_capacity(levels.len());
        for &replicas in levels {
            reports.push(Self::measure_level(ctx, replicas).await?);
        }
        Ok(reports)
    }
}

#[async_trait]
impl Scenario for Scalability {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::Scalability
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.scalability;
        let mut result = ctx.begin(self.kind());

        let measured = Self::measure_levels(ctx, &settings.levels).await;
        self.cleanup(ctx).await;
        let levels = measured?;

        if levels.is_empty() {
            return Ok(result.finish(
                ScenarioStatus::Skipped,
                Some("no replica levels configured".to_string()),
            ));
        }

        let threshold = ctx.settings.failure_threshold_percent;
        let max_throughput = levels
            .iter()
            .map(|l| l.throughput_rps)
            .fold(0.0_f64, f64::max);
        let all_responding = levels.iter().all(|l| l.all_replicas_responding);
        let all_balanced = levels
            .iter()
            .all(|l| l.distribution.is_some_and(|d| d.is_balanced));
        let worst_error_rate = levels
            .iter()
            .map(|l| l.traffic.error_rate)
            .fold(0.0_f64, f64::max);

        // Throughput at the largest level relative to the smallest, per replica
        let scaling_efficiency = match (levels.first(), levels.last()) {
            (Some(first), Some(last)) if first.throughput_rps > 0.0 && last.replicas > first.replicas => {
                let ideal = first.throughput_rps * last.replicas as f64 / first.replicas.max(1) as f64;
                Some(round_to(last.throughput_rps / ideal, 4))
            }
            _ => None,
        };

        result.set_metric("levels", &levels);
        result.set_metric("max_throughput_rps", max_throughput);
        result.set_metric("scaling_efficiency", scaling_efficiency);
        result.set_metric("all_replicas_responding", all_responding);
        result.set_metric("balanced", all_balanced);
        result.set_metric("worst_error_rate", worst_error_rate);

        let (status, message) = if worst_error_rate > threshold {
            (
                ScenarioStatus::Failed,
                Some(format!("error rate {worst_error_rate:.2}% above {threshold}%")),
            )
        } else if !all_responding {
            (
                ScenarioStatus::Partial,
                Some("not every replica served traffic".to_string()),
            )
        } else if !all_balanced {
            (
                ScenarioStatus::Partial,
                Some("load was unevenly distributed".to_string()),
            )
        } else {
            (ScenarioStatus::Passed, None)
        };
        Ok(result.finish(status, message))
    }

    /// Return the service to its resting replica count
    async fn cleanup(&self, ctx: &ScenarioContext) {
        ctx.driver
            .scale(&ctx.settings.service, ctx.settings.restore_replicas)
            .await;
    }
}
