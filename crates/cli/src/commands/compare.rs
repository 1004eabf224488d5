//! Side-by-side comparison of several suite reports
//!
//! One row per scenario, one column per report, each cell showing the
//! status and headline metric.

use anyhow::{bail, Context, Result};
use bench_lib::{load_report, report::headline, ScenarioKind, SuiteReport};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tabled::{builder::Builder, settings::Style};

use crate::output::{color_status, print_json, OutputFormat};

#[derive(Debug, Serialize)]
struct Cell {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

/// Column label for a report: its platform, disambiguated when repeated
fn labels(reports: &[SuiteReport]) -> Vec<String> {
    reports
        .iter()
        .enumerate()
        .map(|(i, report)| {
            let repeated = reports.iter().filter(|r| r.platform == report.platform).count() > 1;
            if repeated {
                format!("{} #{}", report.platform, i + 1)
            } else {
                report.platform.clone()
            }
        })
        .collect()
}

/// Scenario names in suite order, then anything unrecognised
fn scenario_order(reports: &[SuiteReport]) -> Vec<String> {
    let mut names: Vec<String> = ScenarioKind::ALL
        .iter()
        .map(|k| k.name().to_string())
        .filter(|name| {
            reports
                .iter()
                .any(|r| r.results.iter().any(|res| &res.scenario == name))
        })
        .collect();
    for report in reports {
        for result in &report.results {
            if !names.contains(&result.scenario) {
                names.push(result.scenario.clone());
            }
        }
    }
    names
}

/// scenario -> label -> cell
fn matrix(reports: &[SuiteReport], labels: &[String]) -> BTreeMap<String, BTreeMap<String, Cell>> {
    let mut matrix: BTreeMap<String, BTreeMap<String, Cell>> = BTreeMap::new();
    for (report, label) in reports.iter().zip(labels) {
        for result in &report.results {
            let headline = headline(result);
            matrix.entry(result.scenario.clone()).or_default().insert(
                label.clone(),
                Cell {
                    status: result.status.as_str().to_string(),
                    metric: headline.as_ref().map(|(key, _)| *key),
                    value: headline.map(|(_, value)| value),
                },
            );
        }
    }
    matrix
}

pub fn compare_reports(paths: &[PathBuf], format: OutputFormat) -> Result<()> {
    if paths.is_empty() {
        bail!("at least one report is required");
    }
    let reports = paths
        .iter()
        .map(|path| load_report(path).with_context(|| format!("Failed to load {}", path.display())))
        .collect::<Result<Vec<_>>>()?;

    let labels = labels(&reports);
    let matrix = matrix(&reports, &labels);

    match format {
        OutputFormat::Json => print_json(&matrix),
        OutputFormat::Table => {
            let mut builder = Builder::default();
            let mut header = vec!["Scenario".to_string()];
            header.extend(labels.iter().cloned());
            builder.push_record(header);

            for scenario in scenario_order(&reports) {
                let mut row = vec![scenario.clone()];
                for label in &labels {
                    let cell = matrix.get(&scenario).and_then(|cells| cells.get(label));
                    row.push(match cell {
                        Some(cell) => match &cell.value {
                            Some(value) => format!("{} ({value})", color_status(&cell.status)),
                            None => color_status(&cell.status),
                        },
                        None => "-".dimmed().to_string(),
                    });
                }
                builder.push_record(row);
            }

            println!("{}", "Platform Comparison".bold());
            println!("{}", builder.build().with(Style::rounded()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_lib::{ResultAggregator, ScenarioResult, ScenarioStatus};

    fn report(platform: &str, scenarios: &[&str]) -> SuiteReport {
        let mut aggregator = ResultAggregator::new(platform);
        for name in scenarios {
            let result = ScenarioResult::begin(*name, "test", platform);
            aggregator.add_result(result.finish(ScenarioStatus::Passed, None));
        }
        aggregator.build_report()
    }

    #[test]
    fn test_labels_disambiguate_repeated_platforms() {
        let reports = vec![
            report("swarm", &[]),
            report("k8s", &[]),
            report("swarm", &[]),
        ];
        assert_eq!(labels(&reports), vec!["swarm #1", "k8s", "swarm #3"]);
    }

    #[test]
    fn test_scenario_order_follows_suite_then_extras() {
        let reports = vec![
            report("swarm", &["scalability", "custom"]),
            report("k8s", &["fault-tolerance"]),
        ];
        assert_eq!(
            scenario_order(&reports),
            vec!["fault-tolerance", "scalability", "custom"]
        );
    }

    #[test]
    fn test_matrix_cells_per_platform() {
        let reports = vec![
            report("swarm", &["fault-tolerance"]),
            report("nomad", &["fault-tolerance", "scalability"]),
        ];
        let labels = labels(&reports);
        let matrix = matrix(&reports, &labels);

        assert_eq!(matrix["fault-tolerance"].len(), 2);
        assert_eq!(matrix["scalability"].len(), 1);
        assert_eq!(matrix["scalability"]["nomad"].status, "passed");
    }
}
