//! Sequential suite execution
//!
//! Scenarios run one at a time, each on its own task with a fresh driver.
//! An error, a panic or a deadline overrun becomes a result instead of
//! ending the suite.

use crate::driver::{ClusterDriver, Platform};
use crate::models::{ScenarioResult, ScenarioStatus, SuiteReport};
use crate::observability::{BenchMetrics, StructuredLogger};
use crate::progress::ProgressRegistry;
use crate::report::ResultAggregator;
use crate::scenario::{build_scenario, Scenario, ScenarioContext, ScenarioKind, ScenarioSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, warn};

/// Builds a new driver for each scenario
pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn ClusterDriver> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SuiteConfig {
    pub per_test_timeout: Duration,
    /// Pause between consecutive scenarios
    pub cooldown: Duration,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            per_test_timeout: Duration::from_secs(600),
            cooldown: Duration::from_secs(5),
        }
    }
}

pub struct SuiteRunner {
    platform: Platform,
    drivers: DriverFactory,
    settings: ScenarioSettings,
    config: SuiteConfig,
    progress: ProgressRegistry,
    logger: StructuredLogger,
    metrics: BenchMetrics,
}

impl SuiteRunner {
    pub fn new(
        platform: Platform,
        drivers: DriverFactory,
        settings: ScenarioSettings,
        config: SuiteConfig,
    ) -> Self {
        Self {
            platform,
            drivers,
            settings,
            config,
            progress: ProgressRegistry::new(platform.as_str()),
            logger: StructuredLogger::new(platform.as_str()),
            metrics: BenchMetrics::new(),
        }
    }

    /// Registry the progress endpoint reads from
    pub fn progress(&self) -> ProgressRegistry {
        self.progress.clone()
    }

    pub async fn run(&self, kinds: &[ScenarioKind]) -> SuiteReport {
        let scenarios = kinds.iter().map(|&kind| build_scenario(kind)).collect();
        self.run_scenarios(scenarios).await
    }

    pub async fn run_scenarios(&self, scenarios: Vec<Arc<dyn Scenario>>) -> SuiteReport {
        let names: Vec<&str> = scenarios.iter().map(|s| s.kind().name()).collect();
        for name in &names {
            self.progress.register(name).await;
        }
        let target = (self.drivers)().target().to_string();
        self.logger.log_suite_started(&target, &names);

        let mut aggregator = ResultAggregator::new(self.platform.as_str());
        for (i, scenario) in scenarios.into_iter().enumerate() {
            if i > 0 && !self.config.cooldown.is_zero() {
                tokio::time::sleep(self.config.cooldown).await;
            }
            aggregator.add_result(self.run_one(scenario).await);
        }

        let report = aggregator.build_report();
        self.logger
            .log_suite_finished(&report.counts, report.duration_seconds);
        report
    }

    async fn run_one(&self, scenario: Arc<dyn Scenario>) -> ScenarioResult {
        let kind = scenario.kind();
        let ctx = ScenarioContext::new((self.drivers)(), self.settings.clone());
        let placeholder = ctx.begin(kind);

        self.progress.set_running(kind.name()).await;
        self.logger.log_scenario_started(kind.name(), kind.category());
        self.metrics.scenario_started();

        let mut handle = tokio::spawn({
            let scenario = scenario.clone();
            let ctx = ctx.clone();
            async move { scenario.run(&ctx).await }
        });

        let result = match timeout(self.config.per_test_timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                error!(
                    scenario = %kind,
                    error = %format!("{e:#}"),
                    "Scenario returned an error"
                );
                scenario.cleanup(&ctx).await;
                placeholder.finish(ScenarioStatus::Error, Some(format!("{e:#}")))
            }
            Ok(Err(join_error)) => {
                error!(scenario = %kind, error = %join_error, "Scenario task panicked");
                scenario.cleanup(&ctx).await;
                placeholder.finish(
                    ScenarioStatus::Error,
                    Some(format!("scenario panicked: {join_error}")),
                )
            }
            Err(_) => {
                handle.abort();
                warn!(
                    scenario = %kind,
                    timeout_secs = self.config.per_test_timeout.as_secs(),
                    "Scenario exceeded its deadline, cleaning up"
                );
                scenario.cleanup(&ctx).await;
                placeholder.finish(
                    ScenarioStatus::Timeout,
                    Some(format!(
                        "exceeded {}s suite timeout",
                        self.config.per_test_timeout.as_secs()
                    )),
                )
            }
        };

        self.metrics
            .scenario_finished(kind.name(), result.status, result.duration_seconds);
        self.logger.log_scenario_finished(
            kind.name(),
            result.status,
            result.duration_seconds,
            result.message.as_deref(),
        );
        self.progress
            .set_finished(kind.name(), result.status, result.message.clone())
            .await;
        result
    }
}
