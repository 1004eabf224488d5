//! Terminal summary of a finished suite

use bench_lib::models::{ScenarioStatus, SuiteReport};
use bench_lib::report::headline;
use bench_lib::scenario::ScenarioKind;
use colored::Colorize;
use std::path::Path;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Scenario")]
    scenario: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Headline")]
    headline: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Tabled)]
struct ScenarioRow {
    #[tabled(rename = "Scenario")]
    name: &'static str,
    #[tabled(rename = "Category")]
    category: &'static str,
    #[tabled(rename = "Quick")]
    quick: &'static str,
    #[tabled(rename = "Description")]
    description: &'static str,
}

pub fn color_status(status: ScenarioStatus) -> String {
    let text = status.as_str();
    match status {
        ScenarioStatus::Passed => text.green().to_string(),
        ScenarioStatus::Partial | ScenarioStatus::Timeout => text.yellow().to_string(),
        ScenarioStatus::Failed | ScenarioStatus::Error => text.red().to_string(),
        ScenarioStatus::Skipped => text.dimmed().to_string(),
    }
}

/// Table printed by `--list`
pub fn print_scenarios() {
    let rows: Vec<ScenarioRow> = ScenarioKind::ALL
        .iter()
        .map(|kind| ScenarioRow {
            name: kind.name(),
            category: kind.category(),
            quick: if kind.is_quick() { "yes" } else { "" },
            description: kind.description(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_summary(report: &SuiteReport, json_path: &Path, csv_path: &Path) {
    let rows: Vec<ResultRow> = report
        .results
        .iter()
        .map(|result| ResultRow {
            scenario: result.scenario.clone(),
            status: color_status(result.status),
            duration: format!("{:.1}s", result.duration_seconds),
            headline: headline(result)
                .map(|(key, value)| format!("{key}: {value}"))
                .unwrap_or_default(),
            message: result.message.clone().unwrap_or_default(),
        })
        .collect();

    println!();
    println!(
        "{} {}",
        "Benchmark results:".bold(),
        report.platform.cyan()
    );
    println!("{}", Table::new(rows).with(Style::rounded()));

    let counts = &report.counts;
    println!(
        "{} passed, {} partial, {} failed, {} timeout, {} skipped, {} error in {:.1}s",
        counts.passed.to_string().green(),
        counts.partial.to_string().yellow(),
        counts.failed.to_string().red(),
        counts.timeout.to_string().yellow(),
        counts.skipped,
        counts.error.to_string().red(),
        report.duration_seconds
    );
    println!("Report: {}", json_path.display());
    println!("CSV:    {}", csv_path.display());
}
