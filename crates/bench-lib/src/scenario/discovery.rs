//! Service discovery
//!
//! Resolves names with `getent hosts` from inside a running instance of the
//! service under test, then measures how quickly a new probe service
//! becomes resolvable and how quickly its name disappears after removal.

use super::{secs, LookupTarget, Scenario, ScenarioContext, ScenarioKind};
use crate::driver::Platform;
use crate::models::{ScenarioResult, ScenarioStatus};
use crate::stats::SummaryStats;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub struct ServiceDiscovery;

#[derive(Debug, Clone)]
struct Lookup {
    address: Option<String>,
    latency_ms: f64,
}

#[derive(Debug, Serialize)]
struct NameReport {
    name: String,
    dns_name: String,
    expected: bool,
    resolved: u32,
    attempts: u32,
    correct: bool,
    addresses: BTreeSet<String>,
    latency: Option<SummaryStats>,
}

#[derive(Debug, Serialize)]
struct ConsistencyReport {
    lookups: u32,
    unique_addresses: BTreeSet<String>,
    /// A single stable address means a virtual IP; several mean DNS round-robin
    mode: &'static str,
    latency: Option<SummaryStats>,
}

#[derive(Debug, Serialize)]
struct PropagationReport {
    iteration: u32,
    created: bool,
    discovered: bool,
    discovery_seconds: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RemovalReport {
    was_resolvable: bool,
    removed: bool,
    propagation_seconds: Option<f64>,
}

impl ServiceDiscovery {
    async fn lookup(ctx: &ScenarioContext, dns_name: &str) -> Lookup {
        let started = Instant::now();
        let output = ctx
            .driver
            .exec_in_service(&ctx.settings.service, &["getent", "hosts", dns_name])
            .await;
        Lookup {
            address: output.as_deref().and_then(first_address),
            latency_ms: secs(started.elapsed()) * 1000.0,
        }
    }

    fn targets(ctx: &ScenarioContext) -> Vec<LookupTarget> {
        let mut targets = ctx.settings.discovery.lookups.clone();
        // Swarm also registers stack-qualified names
        if ctx.driver.platform() == Platform::Swarm {
            let stack = ctx.driver.target();
            for name in [&ctx.settings.service, &ctx.settings.database_service] {
                targets.push(LookupTarget::new(format!("{stack}_{name}"), true));
            }
        }
        targets
    }

    async fn resolve_names(ctx: &ScenarioContext) -> Vec<NameReport> {
        let settings = &ctx.settings.discovery;
        let mut reports = Vec::new();
        for target in Self::targets(ctx) {
            let dns_name = ctx.driver.discovery_name(&target.name);
            let mut resolved = 0;
            let mut addresses = BTreeSet::new();
            let mut latencies = Vec::new();
            for _ in 0..settings.lookups_per_name {
                let lookup = Self::lookup(ctx, &dns_name).await;
                if let Some(address) = lookup.address {
                    resolved += 1;
                    addresses.insert(address);
                    latencies.push(lookup.latency_ms);
                }
                tokio::time::sleep(Duration::from_millis(settings.lookup_interval_ms)).await;
            }
            let correct = if target.expected {
                resolved == settings.lookups_per_name
            } else {
                resolved == 0
            };
            reports.push(NameReport {
                name: target.name,
                dns_name,
                expected: target.expected,
                resolved,
                attempts: settings.lookups_per_name,
                correct,
                addresses,
                latency: SummaryStats::from_values(&latencies),
            });
        }
        reports
    }

    async fn consistency(ctx: &ScenarioContext) -> ConsistencyReport {
        let settings = &ctx.settings.discovery;
        let dns_name = ctx.driver.discovery_name(&ctx.settings.service);
        let mut unique_addresses = BTreeSet::new();
        let mut latencies = Vec::new();
        for _ in 0..settings.consistency_lookups {
            let lookup = Self::lookup(ctx, &dns_name).await;
            if let Some(address) = lookup.address {
                unique_addresses.insert(address);
                latencies.push(lookup.latency_ms);
            }
        }
        let mode = match unique_addresses.len() {
            0 => "unresolved",
            1 => "vip",
            _ => "dnsrr",
        };
        ConsistencyReport {
            lookups: settings.consistency_lookups,
            unique_addresses,
            mode,
            latency: SummaryStats::from_values(&latencies),
        }
    }

    /// Poll until `dns_name` resolves (or stops resolving) or `timeout` passes
    async fn wait_resolvable(
        ctx: &ScenarioContext,
        dns_name: &str,
        resolvable: bool,
        poll: Duration,
        timeout: Duration,
    ) -> Option<f64> {
        let started = Instant::now();
        loop {
            let lookup = Self::lookup(ctx, dns_name).await;
            if lookup.address.is_some() == resolvable {
                return Some(secs(started.elapsed()));
            }
            if started.elapsed() >= timeout {
                return None;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn propagation(ctx: &ScenarioContext) -> Vec<PropagationReport> {
        let settings = &ctx.settings.discovery;
        let probe = settings.probe_name.as_str();
        let dns_name = ctx.driver.discovery_name(probe);
        let timeout = Duration::from_secs(settings.propagation_timeout_secs);
        let poll = Duration::from_millis(settings.propagation_poll_ms);

        let mut reports = Vec::new();
        for iteration in 1..=settings.propagation_iterations {
            ctx.driver.remove_probe_service(probe).await;
            let created = ctx.driver.create_probe_service(probe, 1).await;
            let discovery_seconds = if created {
                Self::wait_resolvable(ctx, &dns_name, true, poll, timeout).await
            } else {
                None
            };
            ctx.driver.remove_probe_service(probe).await;
            info!(
                iteration = iteration,
                discovery_secs = ?discovery_seconds,
                "New service discovery measured"
            );
            reports.push(PropagationReport {
                iteration,
                created,
                discovered: discovery_seconds.is_some(),
                discovery_seconds,
            });
        }
        reports
    }

    async fn removal(ctx: &ScenarioContext) -> RemovalReport {
        let settings = &ctx.settings.discovery;
        let probe = settings.probe_name.as_str();
        let dns_name = ctx.driver.discovery_name(probe);
        let timeout = Duration::from_secs(settings.propagation_timeout_secs);

        if !ctx.driver.create_probe_service(probe, 1).await {
            return RemovalReport {
                was_resolvable: false,
                removed: false,
                propagation_seconds: None,
            };
        }
        let was_resolvable = Self::wait_resolvable(
            ctx,
            &dns_name,
            true,
            Duration::from_millis(settings.propagation_poll_ms),
            timeout,
        )
        .await
        .is_some();

        let removed = ctx.driver.remove_probe_service(probe).await;
        let propagation_seconds = if was_resolvable && removed {
            Self::wait_resolvable(
                ctx,
                &dns_name,
                false,
                Duration::from_millis(settings.removal_poll_ms),
                timeout,
            )
            .await
        } else {
            None
        };
        RemovalReport {
            was_resolvable,
            removed,
            propagation_seconds,
        }
    }
}

/// First address of a `getent hosts` line such as `10.0.1.5   backend`
fn first_address(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.split_whitespace().next())
        .map(str::to_string)
}

#[async_trait]
impl Scenario for ServiceDiscovery {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::ServiceDiscovery
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let mut result = ctx.begin(self.kind());

        // Every measurement runs inside the service, so it must be reachable
        if ctx
            .driver
            .exec_in_service(&ctx.settings.service, &["hostname"])
            .await
            .is_none()
        {
            warn!(service = %ctx.settings.service, "No instance available for lookups");
            return Ok(result.finish(
                ScenarioStatus::Failed,
                Some(format!(
                    "cannot execute inside a '{}' instance",
                    ctx.settings.service
                )),
            ));
        }

        let names = Self::resolve_names(ctx).await;
        let consistency = Self::consistency(ctx).await;
        let propagation = Self::propagation(ctx).await;
        let removal = Self::removal(ctx).await;

        let all_correct = names.iter().all(|n| n.correct);
        let discovery_times: Vec<f64> = propagation
            .iter()
            .filter_map(|p| p.discovery_seconds)
            .collect();
        let lookup_latencies: Vec<f64> = names
            .iter()
            .filter_map(|n| n.latency.map(|l| l.mean))
            .collect();

        result.set_metric("all_resolutions_correct", all_correct);
        result.set_metric(
            "avg_lookup_ms",
            (!lookup_latencies.is_empty()).then(|| {
                crate::stats::round_to(crate::stats::mean(&lookup_latencies), 3)
            }),
        );
        result.set_metric("names", &names);
        result.set_metric("consistency", &consistency);
        result.set_metric("new_service_discovery", &propagation);
        result.set_metric(
            "avg_discovery_seconds",
            (!discovery_times.is_empty()).then(|| crate::stats::mean(&discovery_times)),
        );
        result.set_metric("removal", &removal);

        let discovery_works = !discovery_times.is_empty();
        let (status, message) = if all_correct && discovery_works {
            (ScenarioStatus::Passed, None)
        } else {
            let wrong: Vec<&str> = names
                .iter()
                .filter(|n| !n.correct)
                .map(|n| n.name.as_str())
                .collect();
            let mut problems = Vec::new();
            if !wrong.is_empty() {
                problems.push(format!("unexpected resolution for {}", wrong.join(", ")));
            }
            if !discovery_works {
                problems.push("new services never became resolvable".to_string());
            }
            (ScenarioStatus::Partial, Some(problems.join("; ")))
        };
        Ok(result.finish(status, message))
    }

    async fn cleanup(&self, ctx: &ScenarioContext) {
        ctx.driver
            .remove_probe_service(&ctx.settings.discovery.probe_name)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::first_address;

    #[test]
    fn test_first_address() {
        assert_eq!(
            first_address("10.0.1.5        backend\n10.0.1.6  backend\n").as_deref(),
            Some("10.0.1.5")
        );
        assert_eq!(first_address(""), None);
    }
}
