use crate::error::{PipelineError, Result};
use crate::scraper::ScraperRuntime;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Runtime that interprets a version's code blob as a literal
/// `{"events": [...]}` payload. Backs manual-entry sources and tests, where
/// "scraping" means replaying a prepared batch. A `{"error": "..."}` payload
/// simulates a failing target.
pub struct FixtureRuntime;

#[derive(Deserialize)]
struct FixturePayload {
    #[serde(default)]
    events: Vec<serde_json::Value>,
    error: Option<String>,
    #[serde(default)]
    transient: bool,
}

#[async_trait]
impl ScraperRuntime for FixtureRuntime {
    async fn run(
        &self,
        code: &str,
        _config: &serde_json::Value,
        _timeout: Duration,
    ) -> Result<Vec<serde_json::Value>> {
        let payload: FixturePayload = serde_json::from_str(code).map_err(|e| {
            PipelineError::external(
                "fixture-runtime",
                format!("fixture payload was not valid JSON: {}", e),
                false,
            )
        })?;
        if let Some(message) = payload.error {
            return Err(PipelineError::external("fixture-runtime", message, payload.transient));
        }
        Ok(payload.events)
    }
}
