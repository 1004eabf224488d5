//! Suite progress tracking
//!
//! Records which scenarios are pending, running or finished so the runner
//! can report progress over HTTP while a long suite executes.

use crate::models::ScenarioStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle phase of a scheduled scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioPhase {
    Pending,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioProgress {
    pub phase: ScenarioPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ScenarioStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_timestamp: i64,
}

impl ScenarioProgress {
    fn pending() -> Self {
        Self {
            phase: ScenarioPhase::Pending,
            status: None,
            message: None,
            updated_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Snapshot served by the progress endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub platform: String,
    pub complete: bool,
    pub finished: usize,
    pub total: usize,
    pub scenarios: BTreeMap<String, ScenarioProgress>,
}

#[derive(Debug, Clone)]
pub struct ProgressRegistry {
    platform: String,
    scenarios: Arc<RwLock<BTreeMap<String, ScenarioProgress>>>,
}

impl ProgressRegistry {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            scenarios: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Register a scenario as pending
    pub async fn register(&self, name: &str) {
        let mut scenarios = self.scenarios.write().await;
        scenarios.insert(name.to_string(), ScenarioProgress::pending());
    }

    pub async fn set_running(&self, name: &str) {
        let mut scenarios = self.scenarios.write().await;
        let entry = scenarios
            .entry(name.to_string())
            .or_insert_with(ScenarioProgress::pending);
        entry.phase = ScenarioPhase::Running;
        entry.updated_timestamp = chrono::Utc::now().timestamp();
    }

    pub async fn set_finished(&self, name: &str, status: ScenarioStatus, message: Option<String>) {
        let mut scenarios = self.scenarios.write().await;
        scenarios.insert(
            name.to_string(),
            ScenarioProgress {
                phase: ScenarioPhase::Finished,
                status: Some(status),
                message,
                updated_timestamp: chrono::Utc::now().timestamp(),
            },
        );
    }

    pub async fn snapshot(&self) -> ProgressResponse {
        let scenarios = self.scenarios.read().await.clone();
        let finished = scenarios
            .values()
            .filter(|p| p.phase == ScenarioPhase::Finished)
            .count();
        ProgressResponse {
            platform: self.platform.clone(),
            complete: !scenarios.is_empty() && finished == scenarios.len(),
            finished,
            total: scenarios.len(),
            scenarios,
        }
    }
}
