//! Runner configuration
//!
//! Layered from built-in defaults, an optional TOML file and `ORCHBENCH_*`
//! environment variables (nested keys use `__`, e.g.
//! `ORCHBENCH_SCENARIOS__API_URL`). Command-line flags are applied on top
//! by `main`.

use anyhow::{Context, Result};
use bench_lib::driver::{DriverConfig, Platform};
use bench_lib::exec::ExecConfig;
use bench_lib::scenario::ScenarioSettings;
use bench_lib::suite::SuiteConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI invocation policy
#[derive(Debug, Clone, Deserialize)]
pub struct ExecSettings {
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Node drains get their own, longer timeout
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_platform")]
    pub platform: Platform,

    /// Stack, namespace or job name; defaults per platform
    #[serde(default)]
    pub target: Option<String>,

    /// Directory reports are written to when no explicit path is given
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    #[serde(default = "default_per_test_timeout")]
    pub per_test_timeout_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default)]
    pub exec: ExecSettings,

    #[serde(default = "default_probe_image")]
    pub probe_image: String,

    /// Overlay network Swarm probes attach to
    #[serde(default)]
    pub probe_network: Option<String>,

    #[serde(default)]
    pub scenarios: ScenarioSettings,
}

fn default_platform() -> Platform {
    Platform::Swarm
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_per_test_timeout() -> u64 {
    600
}

fn default_cooldown() -> u64 {
    5
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_drain_timeout() -> u64 {
    90
}

fn default_probe_image() -> String {
    "alpine:latest".to_string()
}

impl RunnerConfig {
    /// Load configuration from an optional file and the environment
    ///
    /// An explicit `path` must exist; otherwise `orchbench.toml` in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("orchbench").required(false),
        };
        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ORCHBENCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn target(&self) -> String {
        self.target
            .clone()
            .unwrap_or_else(|| self.platform.default_target().to_string())
    }

    pub fn driver_config(&self) -> DriverConfig {
        let mut driver = DriverConfig::new(self.platform, self.target());
        driver.probe_image = self.probe_image.clone();
        driver.probe_network = self.probe_network.clone();
        driver.drain_timeout = Duration::from_secs(self.exec.drain_timeout_secs);
        driver.exec = ExecConfig {
            timeout: Duration::from_secs(self.exec.timeout_secs),
            max_attempts: self.exec.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.exec.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.exec.max_backoff_ms),
        };
        driver
    }

    pub fn suite_config(&self) -> SuiteConfig {
        SuiteConfig {
            per_test_timeout: Duration::from_secs(self.per_test_timeout_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file() -> NamedTempFile {
        tempfile::Builder::new().suffix(".toml").tempfile().unwrap()
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = toml_file();
        writeln!(
            file,
            r#"
platform = "kubernetes"
target = "bench"
per_test_timeout_secs = 120

[exec]
max_attempts = 3

[scenarios]
api_url = "http://10.0.0.5:5001/"

[scenarios.scheduling]
levels = [5, 10]
"#
        )
        .unwrap();

        let config = RunnerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.platform, Platform::K8s);
        assert_eq!(config.target(), "bench");
        assert_eq!(config.per_test_timeout_secs, 120);
        assert_eq!(config.cooldown_secs, 5);
        assert_eq!(config.exec.max_attempts, 3);
        assert_eq!(config.exec.timeout_secs, 30);
        assert_eq!(config.scenarios.api_url, "http://10.0.0.5:5001/");
        assert_eq!(config.scenarios.scheduling.levels, vec![5, 10]);
        assert_eq!(config.scenarios.service, "backend");

        let driver = config.driver_config();
        assert_eq!(driver.exec.max_attempts, 3);
        assert_eq!(driver.target, "bench");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunnerConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_default_target_per_platform() {
        let mut file = toml_file();
        writeln!(file, "platform = \"nomad\"").unwrap();

        let config = RunnerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.platform, Platform::Nomad);
        assert_eq!(config.target(), "cob-service");
        assert_eq!(config.suite_config().cooldown, Duration::from_secs(5));
    }
}
