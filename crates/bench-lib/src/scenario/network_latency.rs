//! Service-to-service network latency
//!
//! Pings other services and requests the service's own HTTP endpoint from
//! inside a running instance, then compares the in-cluster HTTP latency with
//! requests arriving through the published ingress.

use super::{Scenario, ScenarioContext, ScenarioKind};
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::{mean, round_to, SummaryStats};
use crate::traffic::{TrafficGenerator, TrafficStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

pub struct NetworkLatency;

#[derive(Debug, Serialize)]
struct PingReport {
    target: String,
    dns_name: String,
    sent: u32,
    received: usize,
    rtt_ms: Option<SummaryStats>,
}

#[derive(Debug, Serialize)]
struct HttpReport {
    url: String,
    attempts: u32,
    successful: usize,
    latency_ms: Option<SummaryStats>,
}

/// Round-trip times from `ping` output lines such as
/// `64 bytes from 10.0.1.5: icmp_seq=1 ttl=64 time=0.123 ms`
fn parse_ping_times(output: &str) -> Vec<f64> {
    output
        .lines()
        .filter_map(|line| {
            line.split_once("time=")
                .or_else(|| line.split_once("time<"))
                .map(|(_, rest)| rest)
        })
        .filter_map(|rest| {
            rest.split_whitespace()
                .next()
                .and_then(|value| value.trim_end_matches("ms").parse::<f64>().ok())
        })
        .collect()
}

/// `curl -w %{time_total}` prints seconds; returns milliseconds
fn parse_curl_seconds(output: &str) -> Option<f64> {
    let seconds = output.trim().parse::<f64>().ok()?;
    (seconds.is_finite() && seconds > 0.0).then(|| round_to(seconds * 1000.0, 3))
}

impl NetworkLatency {
    async fn ping(ctx: &ScenarioContext, target: &str) -> PingReport {
        let settings = &ctx.settings.network_latency;
        let dns_name = ctx.driver.discovery_name(target);
        let count = settings.pings.to_string();
        let output = ctx
            .driver
            .exec_in_service(
                &ctx.settings.service,
                &["ping", "-c", count.as_str(), "-W", "2", dns_name.as_str()],
            )
            .await;
        let times = output.as_deref().map(parse_ping_times).unwrap_or_default();
        if times.is_empty() {
            warn!(target = %dns_name, "No ping replies");
        }
        PingReport {
            target: target.to_string(),
            dns_name,
            sent: settings.pings,
            received: times.len(),
            rtt_ms: SummaryStats::from_values(&times),
        }
    }

    async fn internal_http(ctx: &ScenarioContext) -> HttpReport {
        let settings = &ctx.settings.network_latency;
        let dns_name = ctx.driver.discovery_name(&ctx.settings.service);
        let url = format!("http://{dns_name}:{}/", settings.http_port);
        let mut latencies = Vec::new();
        for _ in 0..settings.http_requests {
            let output = ctx
                .driver
                .exec_in_service(
                    &ctx.settings.service,
                    &[
                        "curl",
                        "-s",
                        "-o",
                        "/dev/null",
                        "-w",
                        "%{time_total}",
                        "--max-time",
                        "5",
                        url.as_str(),
                    ],
                )
                .await;
            if let Some(ms) = output.as_deref().and_then(parse_curl_seconds) {
                latencies.push(ms);
            }
        }
        HttpReport {
            url,
            attempts: settings.http_requests,
            successful: latencies.len(),
            latency_ms: SummaryStats::from_values(&latencies),
        }
    }

    async fn external_http(ctx: &ScenarioContext) -> Result<TrafficStats> {
        let traffic = TrafficGenerator::new(ctx.traffic_config()?)?;
        Ok(traffic
            .burst(ctx.settings.network_latency.external_requests, 1)
            .await)
    }
}

#[async_trait]
impl Scenario for NetworkLatency {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::NetworkLatency
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let mut result = ctx.begin(self.kind());

        let mut pings = Vec::new();
        for target in &ctx.settings.network_latency.ping_targets {
            pings.push(Self::ping(ctx, target).await);
        }
        let internal = Self::internal_http(ctx).await;
        let external = Self::external_http(ctx).await?;

        let ping_means: Vec<f64> = pings.iter().filter_map(|p| p.rtt_ms.map(|s| s.mean)).collect();
        let avg_ping = (!ping_means.is_empty()).then(|| round_to(mean(&ping_means), 3));
        let internal_avg = internal.latency_ms.map(|s| s.mean);
        let external_avg = (external.successful > 0).then_some(external.mean_latency_ms);
        let ingress_overhead = internal_avg
            .zip(external_avg)
            .map(|(inside, outside)| round_to(outside - inside, 3));

        info!(
            avg_ping_ms = ?avg_ping,
            internal_http_ms = ?internal_avg,
            external_http_ms = ?external_avg,
            "Network latency measured"
        );

        result.set_metric("avg_ping_ms", avg_ping);
        result.set_metric("internal_http_avg_ms", internal_avg);
        result.set_metric("external_http_avg_ms", external_avg);
        result.set_metric("ingress_overhead_ms", ingress_overhead);
        result.set_metric("pings", &pings);
        result.set_metric("internal_http", &internal);
        result.set_metric("external_http", &external);

        let inside = avg_ping.is_some() || internal_avg.is_some();
        let (status, message) = match (inside, external_avg.is_some()) {
            (true, true) => (ScenarioStatus::Passed, None),
            (true, false) => (
                ScenarioStatus::Partial,
                Some("published endpoint never answered".to_string()),
            ),
            (false, true) => (
                ScenarioStatus::Partial,
                Some(format!(
                    "no in-cluster measurement from a '{}' instance",
                    ctx.settings.service
                )),
            ),
            (false, false) => (
                ScenarioStatus::Failed,
                Some("no latency could be measured".to_string()),
            ),
        };
        Ok(result.finish(status, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING: &str = "PING db (10.0.1.7): 56 data bytes
64 bytes from 10.0.1.7: seq=0 ttl=64 time=0.412 ms
64 bytes from 10.0.1.7: seq=1 ttl=64 time=0.188 ms
64 bytes from 10.0.1.7: seq=2 ttl=64 time<1 ms

--- db ping statistics ---
3 packets transmitted, 3 packets received, 0% packet loss
round-trip min/avg/max = 0.188/0.300/0.412 ms
";

    #[test]
    fn test_parse_ping_times() {
        assert_eq!(parse_ping_times(PING), vec![0.412, 0.188, 1.0]);
        assert!(parse_ping_times("ping: bad address 'nowhere'").is_empty());
    }

    #[test]
    fn test_parse_curl_seconds() {
        assert_eq!(parse_curl_seconds("0.004213\n"), Some(4.213));
        assert_eq!(parse_curl_seconds("0.000000"), None);
        assert_eq!(parse_curl_seconds(""), None);
    }
}
