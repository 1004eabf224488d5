//! Suite report aggregation and output
//!
//! Collects scenario results in run order and writes them as a pretty JSON
//! report plus a one-row-per-scenario CSV summary.

use crate::models::{ScenarioResult, StatusCounts, SuiteReport};
use crate::scenario::ScenarioKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid report JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn ensure_parent(path: &Path) -> Result<(), ReportError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(io_error(parent))
        }
        _ => Ok(()),
    }
}

/// One CSV row
#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    scenario: &'a str,
    category: &'a str,
    platform: &'a str,
    status: &'a str,
    duration_seconds: f64,
    started_at: String,
    message: &'a str,
    metrics: String,
}

/// Accumulates results for one suite run
#[derive(Debug)]
pub struct ResultAggregator {
    platform: String,
    started_at: DateTime<Utc>,
    results: Vec<ScenarioResult>,
}

impl ResultAggregator {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            started_at: Utc::now(),
            results: Vec::new(),
        }
    }

    pub fn add_result(&mut self, result: ScenarioResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[ScenarioResult] {
        &self.results
    }

    /// Snapshot of everything recorded so far, ending now
    pub fn build_report(&self) -> SuiteReport {
        let ended_at = Utc::now();
        let mut counts = StatusCounts::default();
        for result in &self.results {
            counts.record(result.status);
        }
        SuiteReport {
            platform: self.platform.clone(),
            started_at: self.started_at,
            ended_at,
            duration_seconds: (ended_at - self.started_at).num_milliseconds().max(0) as f64
                / 1000.0,
            counts,
            results: self.results.clone(),
        }
    }

    pub fn write_report(&self, path: &Path) -> Result<SuiteReport, ReportError> {
        let report = self.build_report();
        write_report(&report, path)?;
        Ok(report)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), ReportError> {
        write_csv(&self.results, path)
    }
}

/// Write `report` as pretty JSON, creating parent directories
pub fn write_report(report: &SuiteReport, path: &Path) -> Result<(), ReportError> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).map_err(io_error(path))
}

/// Write one summary row per result; metrics are flattened to compact JSON
pub fn write_csv(results: &[ScenarioResult], path: &Path) -> Result<(), ReportError> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for result in results {
        writer.serialize(SummaryRow {
            scenario: &result.scenario,
            category: &result.category,
            platform: &result.platform,
            status: result.status.as_str(),
            duration_seconds: result.duration_seconds,
            started_at: result.started_at.to_rfc3339(),
            message: result.message.as_deref().unwrap_or(""),
            metrics: serde_json::to_string(&result.metrics)?,
        })?;
    }
    writer.flush().map_err(io_error(path))
}

/// Key and rendered value of a result's headline metric
pub fn headline(result: &ScenarioResult) -> Option<(&'static str, String)> {
    let kind: ScenarioKind = result.scenario.parse().ok()?;
    let key = kind.headline_metric();
    let value = match result.metric(key)? {
        serde_json::Value::Null => "n/a".to_string(),
        serde_json::Value::Bool(b) => if *b { "yes" } else { "no" }.to_string(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() != 0.0 => format!("{f:.3}"),
            _ => n.to_string(),
        },
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some((key, value))
}

pub fn load_report(path: &Path) -> Result<SuiteReport, ReportError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScenarioStatus;
    use tempfile::TempDir;

    fn result(name: &str, status: ScenarioStatus) -> ScenarioResult {
        let mut result = ScenarioResult::begin(name, "storage", "swarm");
        result.set_metric("data_survived", status == ScenarioStatus::Passed);
        result.finish(status, None)
    }

    #[test]
    fn test_build_report_counts_statuses() {
        let mut aggregator = ResultAggregator::new("swarm");
        aggregator.add_result(result("a", ScenarioStatus::Passed));
        aggregator.add_result(result("b", ScenarioStatus::Partial));
        aggregator.add_result(result("c", ScenarioStatus::Timeout));

        let report = aggregator.build_report();
        assert_eq!(report.counts.passed, 1);
        assert_eq!(report.counts.partial, 1);
        assert_eq!(report.counts.timeout, 1);
        assert_eq!(report.counts.total(), 3);
        assert_eq!(report.exit_code(), 0);
        assert!(report.ended_at >= report.started_at);
    }

    #[test]
    fn test_failed_scenario_sets_exit_code() {
        let mut aggregator = ResultAggregator::new("k8s");
        aggregator.add_result(result("a", ScenarioStatus::Passed));
        aggregator.add_result(result("b", ScenarioStatus::Error));

        assert_eq!(aggregator.build_report().exit_code(), 1);
    }

    #[test]
    fn test_write_and_load_report() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("report.json");

        let mut aggregator = ResultAggregator::new("nomad");
        aggregator.add_result(result("storage-persistence", ScenarioStatus::Passed));
        aggregator.write_report(&path).unwrap();

        let loaded = load_report(&path).unwrap();
        assert_eq!(loaded.platform, "nomad");
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].status, ScenarioStatus::Passed);
        assert_eq!(
            loaded.results[0].metric("data_survived"),
            Some(&serde_json::json!(true))
        );
    }

    #[test]
    fn test_write_csv_one_row_per_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("summary.csv");

        let mut aggregator = ResultAggregator::new("swarm");
        aggregator.add_result(result("a", ScenarioStatus::Passed));
        aggregator.add_result(result("b", ScenarioStatus::Failed));
        aggregator.write_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "scenario");
        assert_eq!(&headers[3], "status");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "b");
        assert_eq!(&rows[1][3], "failed");
    }

    #[test]
    fn test_headline_formats_metric() {
        let mut rto = ScenarioResult::begin("fault-tolerance", "resource_management", "k8s");
        rto.set_metric("recovery_time_seconds", 12.34567);
        assert_eq!(
            headline(&rto),
            Some(("recovery_time_seconds", "12.346".to_string()))
        );

        let survived = result("storage-persistence", ScenarioStatus::Passed);
        assert_eq!(headline(&survived), Some(("data_survived", "yes".to_string())));

        let unknown = ScenarioResult::begin("custom", "storage", "k8s");
        assert_eq!(headline(&unknown), None);
    }

    #[test]
    fn test_load_missing_report() {
        let temp_dir = TempDir::new().unwrap();
        let err = load_report(&temp_dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ReportError::Io { .. }));
    }
}
