//! Benchmark library for container orchestration platforms
//!
//! This crate provides:
//! - Platform drivers for Docker Swarm, Kubernetes and Nomad
//! - An HTTP traffic generator that samples service availability
//! - Benchmark scenarios and the suite runner that sequences them
//! - Result aggregation, reporting and observability

pub mod driver;
pub mod exec;
pub mod models;
pub mod observability;
pub mod progress;
pub mod report;
pub mod scenario;
pub mod stats;
pub mod suite;
pub mod traffic;

pub use driver::{create_driver, ClusterDriver, DriverConfig, Platform};
pub use models::*;
pub use observability::{BenchMetrics, StructuredLogger};
pub use progress::{ProgressRegistry, ProgressResponse};
pub use report::{headline, load_report, ResultAggregator};
pub use scenario::{ScenarioKind, ScenarioSettings};
pub use suite::{DriverFactory, SuiteConfig, SuiteRunner};
