//! Storage persistence
//!
//! Writes a record through the application API, restarts the database
//! service and checks the record can still be read back.

use super::{endpoint, secs, wait_for_rollout, Scenario, ScenarioContext, ScenarioKind};
use crate::models::{ScenarioResult, ScenarioStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct StoragePersistence;

/// Identifier of a created record; the API returns `_id` or `id`
fn record_id(body: &Value) -> Option<String> {
    ["_id", "id"].iter().find_map(|key| match body.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(o) => o.get("$oid").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

impl StoragePersistence {
    async fn create_record(client: &Client, url: &url::Url) -> Result<(String, Value)> {
        let payload = json!({
            "title": "orchbench persistence probe",
            "description": format!("written at {}", chrono::Utc::now().to_rfc3339()),
            "due_date": chrono::Utc::now().date_naive().to_string(),
        });
        let response = client
            .post(url.clone())
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        let status = response.status();
        if status != StatusCode::CREATED && status != StatusCode::OK {
            return Err(anyhow!("POST {url} returned {status}"));
        }
        let body: Value = response
            .json()
            .await
            .context("record creation returned invalid JSON")?;
        let id = record_id(&body).ok_or_else(|| anyhow!("created record has no id"))?;
        Ok((id, payload))
    }

    /// Poll the record until it is served again or the budget runs out
    async fn read_back(
        ctx: &ScenarioContext,
        client: &Client,
        url: &url::Url,
    ) -> (Option<Value>, Option<u16>, f64) {
        let settings = &ctx.settings.persistence;
        let timeout = Duration::from_secs(settings.read_timeout_secs);
        let started = Instant::now();
        let mut last_status = None;
        loop {
            match client.get(url.clone()).send().await {
                Ok(response) => {
                    last_status = Some(response.status().as_u16());
                    if response.status() == StatusCode::OK {
                        let body = response.json::<Value>().await.ok();
                        let elapsed = secs(started.elapsed());
                        return (body.or(Some(Value::Null)), last_status, elapsed);
                    }
                }
                Err(e) => debug!(error = %e, "Record read failed, retrying"),
            }
            if started.elapsed() >= timeout {
                return (None, last_status, secs(started.elapsed()));
            }
            tokio::time::sleep(Duration::from_millis(settings.poll_interval_ms)).await;
        }
    }
}

#[async_trait]
impl Scenario for StoragePersistence {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::StoragePersistence
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<ScenarioResult> {
        let settings = &ctx.settings.persistence;
        let database = ctx.settings.database_service.as_str();
        let mut result = ctx.begin(self.kind());

        let client = Client::builder()
            .timeout(Duration::from_millis(ctx.settings.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;
        let collection = endpoint(&ctx.api_url()?, &settings.collection)?;

        let (id, payload) = match Self::create_record(&client, &collection).await {
            Ok(created) => created,
            Err(e) => {
                return Ok(result.finish(
                    ScenarioStatus::Failed,
                    Some(format!("could not write test record: {e:#}")),
                ))
            }
        };
        info!(record_id = %id, "Test record written");
        result.set_metric("record_id", &id);

        let restart_started = Instant::now();
        let triggered = ctx.driver.trigger_rolling_update(database).await;
        if !triggered {
            return Ok(result.finish(
                ScenarioStatus::Failed,
                Some(format!("could not restart '{database}'")),
            ));
        }
        let rollout = wait_for_rollout(
            ctx,
            database,
            Duration::from_secs(settings.restart_timeout_secs),
            Duration::from_millis(settings.poll_interval_ms),
            Duration::from_secs(settings.min_restart_window_secs),
        )
        .await;
        result.set_metric("restart_completed", rollout.completed());
        result.set_metric("restart_seconds", secs(restart_started.elapsed()));

        let record_url = endpoint(&collection, &id)?;
        let (body, last_status, read_seconds) =
            Self::read_back(ctx, &client, &record_url).await;
        let survived = body.is_some();
        let intact = body
            .as_ref()
            .and_then(|b| b.get("title"))
            .map(|title| title == &payload["title"]);

        result.set_metric("data_survived", survived);
        result.set_metric("data_intact", intact);
        result.set_metric("read_back_seconds", read_seconds);
        result.set_metric("last_http_status", last_status);

        let (status, message) = if !survived {
            (
                ScenarioStatus::Failed,
                Some(format!("record {id} not readable after database restart")),
            )
        } else if !rollout.completed() {
            (
                ScenarioStatus::Partial,
                Some("record survived but the database restart was not confirmed".to_string()),
            )
        } else {
            (ScenarioStatus::Passed, None)
        };
        Ok(result.finish(status, message))
    }
}

#[cfg(test)]
mod tests {
    use super::record_id;
    use serde_json::json;

    #[test]
    fn test_record_id_variants() {
        assert_eq!(record_id(&json!({"_id": "abc"})).as_deref(), Some("abc"));
        assert_eq!(record_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(
            record_id(&json!({"_id": {"$oid": "65f0"}})).as_deref(),
            Some("65f0")
        );
        assert_eq!(record_id(&json!({"title": "x"})), None);
    }
}
