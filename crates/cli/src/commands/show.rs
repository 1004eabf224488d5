//! Render a single suite report

use anyhow::{Context, Result};
use bench_lib::{load_report, report::headline, SuiteReport};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    color_status, format_duration, print_info, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

/// Row for the results table
#[derive(Tabled, Serialize)]
struct ResultRow {
    #[tabled(rename = "Scenario")]
    scenario: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Headline")]
    headline: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn rows(report: &SuiteReport) -> Vec<ResultRow> {
    report
        .results
        .iter()
        .map(|result| ResultRow {
            scenario: result.scenario.clone(),
            category: result.category.clone(),
            status: color_status(result.status.as_str()),
            duration: format_duration(result.duration_seconds),
            headline: headline(result)
                .map(|(key, value)| format!("{key} = {value}"))
                .unwrap_or_default(),
            message: result.message.clone().unwrap_or_default(),
        })
        .collect()
}

/// Show one report
pub fn show_report(path: &Path, format: OutputFormat) -> Result<()> {
    let report = load_report(path).with_context(|| format!("Failed to load {}", path.display()))?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            println!("{}", "Benchmark Report".bold());
            println!("{}", "=".repeat(60));
            println!("Platform:   {}", report.platform.cyan());
            println!(
                "Started:    {}",
                report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("Duration:   {}", format_duration(report.duration_seconds));
            println!();

            print_table(&rows(&report), format);
            println!();

            let counts = &report.counts;
            let tally = format!(
                "{} passed, {} partial, {} failed, {} timeout, {} skipped, {} error",
                counts.passed,
                counts.partial,
                counts.failed,
                counts.timeout,
                counts.skipped,
                counts.error
            );
            if report.has_failures() {
                print_warning(&tally);
            } else if counts.total() == 0 {
                print_info("Report contains no results");
            } else {
                print_success(&tally);
            }
        }
    }

    Ok(())
}
