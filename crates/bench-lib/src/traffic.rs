//! HTTP traffic generation
//!
//! A generator drives a pool of worker tasks against one URL and records
//! one [`TrafficSample`] per request into a shared [`SampleLog`]. Workers
//! check a shared stop flag at the top of every iteration, so a stop takes
//! effect within one request timeout.

use crate::models::{ErrorKind, TrafficSample};
use crate::observability::BenchMetrics;
use crate::stats::{round_to, SummaryStats};
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Generator configuration
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    pub url: Url,
    pub request_timeout: Duration,
    /// Open a fresh connection per request
    pub disable_keep_alive: bool,
    /// JSON field of the response body identifying the responding instance
    pub responder_field: String,
}

impl TrafficConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            request_timeout: Duration::from_secs(2),
            disable_keep_alive: false,
            responder_field: "container_id".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    samples: Vec<TrafficSample>,
    closed: bool,
}

/// Append-only sample list shared between workers and readers
#[derive(Debug, Clone, Default)]
pub struct SampleLog {
    state: Arc<Mutex<LogState>>,
    next_seq: Arc<AtomicU64>,
}

impl SampleLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a sample; returns false once the log is closed
    pub fn record(&self, mut sample: TrafficSample) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        sample.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        state.samples.push(sample);
        true
    }

    /// Reject any further samples
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TrafficSample> {
        self.lock().samples.clone()
    }

    /// Samples that started at or after `offset_ms`
    pub fn since(&self, offset_ms: u64) -> Vec<TrafficSample> {
        self.lock()
            .samples
            .iter()
            .filter(|s| s.offset_ms >= offset_ms)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TrafficStats {
        TrafficStats::from_samples(&self.lock().samples)
    }
}

/// Aggregates over a set of samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage in [0, 100]
    pub success_rate: f64,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<SummaryStats>,
    /// Successful responses per responding instance
    pub responders: BTreeMap<String, u64>,
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl TrafficStats {
    pub fn from_samples(samples: &[TrafficSample]) -> Self {
        let total = samples.len();
        if total == 0 {
            return Self::default();
        }

        let successful = samples.iter().filter(|s| s.success).count();
        let failed = total - successful;

        let latencies: Vec<f64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency_ms)
            .collect();
        let latency = SummaryStats::from_values(&latencies);

        let mut responders = BTreeMap::new();
        let mut errors_by_kind = BTreeMap::new();
        for sample in samples {
            if let Some(responder) = &sample.responder {
                *responders.entry(responder.clone()).or_insert(0) += 1;
            }
            if let Some(kind) = sample.error_kind {
                *errors_by_kind.entry(kind.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let success_rate = round_to(successful as f64 * 100.0 / total as f64, 2);
        let error_rate = round_to(failed as f64 * 100.0 / total as f64, 2);

        Self {
            total,
            successful,
            failed,
            success_rate,
            error_rate,
            mean_latency_ms: latency.map(|l| l.mean).unwrap_or(0.0),
            latency,
            responders,
            errors_by_kind,
        }
    }
}

/// A run of consecutive failed samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorWindow {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub duration_seconds: f64,
    pub failed_requests: usize,
}

/// Group consecutive failures (ordered by start offset) into windows
pub fn error_windows(samples: &[TrafficSample]) -> Vec<ErrorWindow> {
    let mut ordered: Vec<&TrafficSample> = samples.iter().collect();
    ordered.sort_by_key(|s| (s.offset_ms, s.seq));

    let mut windows = Vec::new();
    let mut current: Option<(u64, u64, usize)> = None;

    for sample in ordered {
        match (sample.success, current.as_mut()) {
            (false, Some((_, end, count))) => {
                *end = sample.offset_ms;
                *count += 1;
            }
            (false, None) => current = Some((sample.offset_ms, sample.offset_ms, 1)),
            (true, _) => {
                if let Some(window) = current.take() {
                    windows.push(window);
                }
            }
        }
    }
    if let Some(window) = current {
        windows.push(window);
    }

    windows
        .into_iter()
        .map(|(start, end, count)| ErrorWindow {
            start_seconds: start as f64 / 1000.0,
            end_seconds: end as f64 / 1000.0,
            duration_seconds: (end - start) as f64 / 1000.0,
            failed_requests: count,
        })
        .collect()
}

/// Load generator bound to one target URL
pub struct TrafficGenerator {
    client: Client,
    config: TrafficConfig,
    log: SampleLog,
    stop: Arc<AtomicBool>,
    started: Instant,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: BenchMetrics,
}

impl TrafficGenerator {
    pub fn new(config: TrafficConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.request_timeout);
        if config.disable_keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            config,
            log: SampleLog::new(),
            stop: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            workers: Mutex::new(Vec::new()),
            metrics: BenchMetrics::new(),
        })
    }

    pub fn log(&self) -> &SampleLog {
        &self.log
    }

    /// Time since the generator was created, the origin of sample offsets
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn worker(&self) -> Worker {
        Worker {
            client: self.client.clone(),
            url: self.config.url.clone(),
            responder_field: self.config.responder_field.clone(),
            disable_keep_alive: self.config.disable_keep_alive,
            log: self.log.clone(),
            stop: self.stop.clone(),
            started: self.started,
            metrics: self.metrics.clone(),
        }
    }

    /// Spawn paced workers in the background for at most `max_duration`
    ///
    /// Each worker sleeps for `workers / rps` seconds per request. A rate
    /// that is not a positive finite number disables pacing.
    pub fn start(&self, rps: f64, workers: usize, max_duration: Duration) {
        let workers = workers.max(1);
        if !(rps.is_finite() && rps > 0.0) {
            warn!(rps = rps, "Invalid request rate, sending unpaced");
        }
        let interval = pacing_interval(rps, workers, max_duration);
        let deadline = Instant::now() + max_duration;

        info!(
            url = %self.config.url,
            rps = rps,
            workers = workers,
            interval_ms = interval.as_millis() as u64,
            "Starting traffic generation"
        );

        let mut handles = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for _ in 0..workers {
            let worker = self.worker();
            handles.push(tokio::spawn(worker.paced(interval, deadline)));
        }
    }

    /// Raise the stop flag, join every worker and close the log
    pub async fn stop(&self) -> TrafficStats {
        self.stop.store(true, Ordering::Release);
        self.join().await;
        self.log.close();
        self.stats()
    }

    /// Generate traffic for `duration` and return the aggregate stats
    pub async fn run(&self, duration: Duration, rps: f64, workers: usize) -> TrafficStats {
        self.start(rps, workers, duration);
        self.join().await;
        self.log.close();
        self.stats()
    }

    /// Issue exactly `total` requests as fast as `workers` tasks allow
    pub async fn burst(&self, total: usize, workers: usize) -> TrafficStats {
        let remaining = Arc::new(AtomicU64::new(total as u64));
        {
            let mut handles = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            for _ in 0..workers.max(1) {
                let worker = self.worker();
                handles.push(tokio::spawn(worker.counted(remaining.clone())));
            }
        }
        self.join().await;
        self.log.close();
        self.stats()
    }

    pub fn stats(&self) -> TrafficStats {
        self.log.stats()
    }

    pub fn error_windows(&self) -> Vec<ErrorWindow> {
        error_windows(&self.log.snapshot())
    }

    async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "Traffic worker ended abnormally");
            }
        }
    }
}

impl Drop for TrafficGenerator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct Worker {
    client: Client,
    url: Url,
    responder_field: String,
    disable_keep_alive: bool,
    log: SampleLog,
    stop: Arc<AtomicBool>,
    started: Instant,
    metrics: BenchMetrics,
}

impl Worker {
    async fn paced(self, interval: Duration, deadline: Instant) {
        loop {
            if self.stop.load(Ordering::Acquire) || Instant::now() >= deadline {
                break;
            }
            let tick = Instant::now();
            let sample = self.send().await;
            if !self.log.record(sample) {
                break;
            }
            if let Some(rest) = interval.checked_sub(tick.elapsed()) {
                tokio::time::sleep(rest).await;
            }
        }
    }

    async fn counted(self, remaining: Arc<AtomicU64>) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let claimed = remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if !claimed {
                break;
            }
            let sample = self.send().await;
            if !self.log.record(sample) {
                break;
            }
        }
    }

    async fn send(&self) -> TrafficSample {
        let offset_ms = self.started.elapsed().as_millis() as u64;
        let begin = Instant::now();

        let mut request = self.client.get(self.url.clone());
        if self.disable_keep_alive {
            request = request.header(reqwest::header::CONNECTION, "close");
        }

        let sample = match request.send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                // The responder is optional; an undecodable body is still a success
                let responder = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| {
                        body.get(&self.responder_field)
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    });
                TrafficSample::succeeded(offset_ms, elapsed_ms(begin), 200, responder)
            }
            Ok(response) => TrafficSample::failed(
                offset_ms,
                elapsed_ms(begin),
                Some(response.status().as_u16()),
                ErrorKind::HttpStatus,
            ),
            Err(e) => {
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else if e.is_connect() {
                    ErrorKind::Connect
                } else {
                    ErrorKind::Other
                };
                TrafficSample::failed(offset_ms, elapsed_ms(begin), None, kind)
            }
        };

        self.metrics
            .observe_request(sample.success, sample.latency_ms / 1000.0);
        sample
    }
}

/// Per-worker delay between requests, never longer than `cap`
fn pacing_interval(rps: f64, workers: usize, cap: Duration) -> Duration {
    if !(rps.is_finite() && rps > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(workers as f64 / rps).map_or(cap, |interval| interval.min(cap))
}

fn elapsed_ms(begin: Instant) -> f64 {
    round_to(begin.elapsed().as_secs_f64() * 1000.0, 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample(offset_ms: u64, success: bool) -> TrafficSample {
        if success {
            TrafficSample::succeeded(offset_ms, 10.0, 200, None)
        } else {
            TrafficSample::failed(offset_ms, 10.0, Some(503), ErrorKind::HttpStatus)
        }
    }

    #[test]
    fn test_success_rate_with_five_failures() {
        let samples: Vec<TrafficSample> =
            (0..100).map(|i| sample(i * 10, i % 20 != 0)).collect();
        let stats = TrafficStats::from_samples(&samples);

        assert_eq!(stats.total, 100);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.success_rate, 95.0);
        assert_eq!(stats.error_rate, 5.0);
        assert_eq!(stats.errors_by_kind["http_status"], 5);
    }

    #[test]
    fn test_empty_stats() {
        let stats = TrafficStats::from_samples(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.latency.is_none());
    }

    #[test]
    fn test_error_windows_group_consecutive_failures() {
        let samples = vec![
            sample(0, true),
            sample(100, false),
            sample(150, false),
            sample(400, false),
            sample(500, true),
            sample(900, false),
        ];
        let windows = error_windows(&samples);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].failed_requests, 3);
        assert_eq!(windows[0].start_seconds, 0.1);
        assert!((windows[0].duration_seconds - 0.3).abs() < 1e-9);
        assert_eq!(windows[1].failed_requests, 1);
        assert_eq!(windows[1].duration_seconds, 0.0);
    }

    #[test]
    fn test_closed_log_rejects_samples() {
        let log = SampleLog::new();
        assert!(log.record(sample(0, true)));
        log.close();
        assert!(!log.record(sample(1, true)));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_run_records_each_sample_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"ok","container_id":"abc123"}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let url = Url::parse(&server.url()).unwrap();
        let generator = TrafficGenerator::new(TrafficConfig::new(url)).unwrap();

        generator.start(200.0, 4, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = generator.stop().await;

        let samples = generator.log().snapshot();
        let seqs: HashSet<u64> = samples.iter().map(|s| s.seq).collect();
        assert!(stats.total > 0);
        assert_eq!(stats.total, samples.len());
        assert_eq!(seqs.len(), samples.len());
        assert_eq!(stats.responders.get("abc123").copied(), Some(stats.successful as u64));

        // Nothing is recorded once generation has stopped
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(generator.log().len(), samples.len());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_burst_issues_exact_count_and_classifies_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(503)
            .expect(25)
            .create_async()
            .await;

        let url = Url::parse(&server.url()).unwrap();
        let mut config = TrafficConfig::new(url);
        config.disable_keep_alive = true;
        let generator = TrafficGenerator::new(config).unwrap();

        let stats = generator.burst(25, 5).await;
        assert_eq!(stats.total, 25);
        assert_eq!(stats.failed, 25);
        assert_eq!(stats.errors_by_kind["http_status"], 25);
        assert_eq!(generator.error_windows().len(), 1);
    }

    #[test]
    fn test_pacing_interval_rejects_degenerate_rates() {
        let cap = Duration::from_secs(10);
        assert_eq!(pacing_interval(20.0, 5, cap), Duration::from_millis(250));
        assert_eq!(pacing_interval(0.0, 5, cap), Duration::ZERO);
        assert_eq!(pacing_interval(-3.0, 5, cap), Duration::ZERO);
        assert_eq!(pacing_interval(f64::NAN, 5, cap), Duration::ZERO);
        assert_eq!(pacing_interval(f64::INFINITY, 5, cap), Duration::ZERO);
        assert_eq!(pacing_interval(1e-300, 5, cap), cap);
        assert_eq!(pacing_interval(0.001, 5, cap), cap);
    }

    #[tokio::test]
    async fn test_start_with_nan_rate_does_not_panic() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        let url = Url::parse(&server.url()).unwrap();
        let generator = TrafficGenerator::new(TrafficConfig::new(url)).unwrap();

        generator.start(f64::NAN, 2, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = generator.stop().await;
        assert!(stats.total > 0);
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let generator = TrafficGenerator::new(TrafficConfig::new(url)).unwrap();

        let stats = generator.burst(3, 1).await;
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.errors_by_kind.get("connect").copied(), Some(3));
    }
}
