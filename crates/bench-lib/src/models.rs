//! Core data models for the benchmark harness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Classification of a failed request against the service under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// TCP connect refused or reset
    Connect,
    /// Request exceeded the client timeout
    Timeout,
    /// Response arrived with a non-200 status
    HttpStatus,
    /// Anything else reported by the HTTP client
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connect => "connect",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::Other => "other",
        }
    }
}

/// A single HTTP attempt recorded by the traffic generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSample {
    /// Sequence number assigned when the sample entered the log
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds between generator start and request start
    pub offset_ms: u64,
    pub success: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Instance identifier reported in the response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
}

impl TrafficSample {
    pub fn succeeded(
        offset_ms: u64,
        latency_ms: f64,
        http_status: u16,
        responder: Option<String>,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            offset_ms,
            success: true,
            latency_ms,
            http_status: Some(http_status),
            error_kind: None,
            responder,
        }
    }

    pub fn failed(
        offset_ms: u64,
        latency_ms: f64,
        http_status: Option<u16>,
        error_kind: ErrorKind,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            offset_ms,
            success: false,
            latency_ms,
            http_status,
            error_kind: Some(error_kind),
            responder: None,
        }
    }
}

/// Final status of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Partial,
    Failed,
    Timeout,
    Skipped,
    Error,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Passed => "passed",
            ScenarioStatus::Partial => "partial",
            ScenarioStatus::Failed => "failed",
            ScenarioStatus::Timeout => "timeout",
            ScenarioStatus::Skipped => "skipped",
            ScenarioStatus::Error => "error",
        }
    }

    /// Statuses that make the suite exit non-zero
    pub fn is_failure(&self) -> bool {
        matches!(self, ScenarioStatus::Failed | ScenarioStatus::Error)
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub category: String,
    pub platform: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: ScenarioStatus,
    /// Named aggregates produced by the scenario
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_samples: Option<Vec<TrafficSample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ScenarioResult {
    /// Start a result record; status stays `Skipped` until `finish` is called
    pub fn begin(
        scenario: impl Into<String>,
        category: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            scenario: scenario.into(),
            category: category.into(),
            platform: platform.into(),
            started_at: now,
            ended_at: now,
            duration_seconds: 0.0,
            status: ScenarioStatus::Skipped,
            metrics: BTreeMap::new(),
            raw_samples: None,
            message: None,
        }
    }

    /// Store a named metric, replacing any previous value
    pub fn set_metric<T: Serialize>(&mut self, key: &str, value: T) {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.metrics.insert(key.to_string(), value);
    }

    pub fn metric(&self, key: &str) -> Option<&serde_json::Value> {
        self.metrics.get(key)
    }

    /// Stamp the end time and final status
    pub fn finish(mut self, status: ScenarioStatus, message: Option<String>) -> Self {
        self.ended_at = Utc::now();
        self.duration_seconds =
            (self.ended_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        self
    }
}

/// Per-status tally for a suite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub passed: usize,
    pub partial: usize,
    pub failed: usize,
    pub timeout: usize,
    pub skipped: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: ScenarioStatus) {
        match status {
            ScenarioStatus::Passed => self.passed += 1,
            ScenarioStatus::Partial => self.partial += 1,
            ScenarioStatus::Failed => self.failed += 1,
            ScenarioStatus::Timeout => self.timeout += 1,
            ScenarioStatus::Skipped => self.skipped += 1,
            ScenarioStatus::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.partial + self.failed + self.timeout + self.skipped + self.error
    }
}

/// Report covering every scenario of one suite run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub platform: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub counts: StatusCounts,
    pub results: Vec<ScenarioResult>,
}

impl SuiteReport {
    /// True when at least one scenario failed or errored
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status.is_failure())
    }

    /// Process exit code for the suite runner
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }
}
