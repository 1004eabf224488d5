//! orchbench - container orchestration benchmark suite
//!
//! Runs the selected scenarios one after another against a live Docker
//! Swarm, Kubernetes or Nomad deployment and writes a JSON report plus a
//! CSV summary.

use anyhow::{bail, Context, Result};
use bench_lib::{
    driver::{create_driver, Platform},
    exec::{CommandRunner, SystemRunner},
    report::{write_csv, write_report},
    scenario::ScenarioKind,
    suite::{DriverFactory, SuiteRunner},
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod summary;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Benchmark suite for container orchestration platforms
#[derive(Parser, Debug)]
#[command(name = "orchbench")]
#[command(author, version, about = "Benchmark suite for container orchestration platforms", long_about = None)]
struct Args {
    /// Platform under test (swarm, k8s, nomad)
    #[arg(long, short)]
    platform: Option<Platform>,

    /// Stack, namespace or job name
    #[arg(long)]
    target: Option<String>,

    /// Logical name of the service under test
    #[arg(long)]
    service: Option<String>,

    /// Base URL of the service under test
    #[arg(long)]
    api_url: Option<String>,

    /// Only run scenarios in this category (repeatable)
    #[arg(long = "category", value_name = "CATEGORY")]
    categories: Vec<String>,

    /// Only run the quick subset
    #[arg(long)]
    quick: bool,

    /// Run only the named scenario (repeatable, overrides filters)
    #[arg(long = "scenario", value_name = "NAME")]
    scenarios: Vec<String>,

    /// Per-scenario timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// JSON report path
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// CSV summary path (defaults to the report path with a .csv extension)
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Configuration file
    #[arg(long, env = "ORCHBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Serve /metrics, /progress and /healthz on this port while running
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Embed every traffic sample in the report
    #[arg(long)]
    raw_samples: bool,

    /// List available scenarios and exit
    #[arg(long)]
    list: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    if args.list {
        summary::print_scenarios();
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(args.log_format);

    // Load configuration, then apply explicit flags on top
    let mut config = config::RunnerConfig::load(args.config.as_deref())?;
    if let Some(platform) = args.platform {
        config.platform = platform;
    }
    if let Some(target) = args.target.clone() {
        config.target = Some(target);
    }
    if let Some(service) = args.service.clone() {
        config.scenarios.service = service;
    }
    if let Some(api_url) = args.api_url.clone() {
        config.scenarios.api_url = api_url;
    }
    if let Some(timeout) = args.timeout {
        config.per_test_timeout_secs = timeout;
    }
    if args.raw_samples {
        config.scenarios.include_raw_samples = true;
    }

    let kinds = ScenarioKind::select(&args.categories, args.quick, &args.scenarios)?;
    if kinds.is_empty() {
        bail!("no scenarios selected");
    }
    info!(
        platform = %config.platform,
        target = %config.target(),
        scenarios = kinds.len(),
        "orchbench configured"
    );

    let driver_config = config.driver_config();
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let drivers: DriverFactory = Arc::new(move || create_driver(&driver_config, runner.clone()));
    let suite = SuiteRunner::new(
        config.platform,
        drivers,
        config.scenarios.clone(),
        config.suite_config(),
    );

    if let Some(port) = args.metrics_port {
        let state = Arc::new(api::AppState::new(suite.progress()));
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, state).await {
                warn!(error = %e, "API server stopped");
            }
        });
    }

    let report = suite.run(&kinds).await;

    let json_path = args.output.unwrap_or_else(|| {
        config.results_dir.join(format!(
            "{}_{}.json",
            config.platform,
            report.started_at.format("%Y%m%d_%H%M%S")
        ))
    });
    let csv_path = args.csv.unwrap_or_else(|| json_path.with_extension("csv"));
    write_report(&report, &json_path)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;
    write_csv(&report.results, &csv_path)
        .with_context(|| format!("Failed to write {}", csv_path.display()))?;
    info!(report = %json_path.display(), csv = %csv_path.display(), "Reports written");

    summary::print_summary(&report, &json_path, &csv_path);

    Ok(ExitCode::from(report.exit_code() as u8))
}
