use crate::error::Result;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::json;
use std::time::Duration;

pub mod fixture;
pub mod subprocess;

pub use fixture::FixtureRuntime;
pub use subprocess::SubprocessRuntime;

/// Execution boundary for stored scraper code. The code blob is opaque to the
/// core: the runtime hands it the source configuration and gets raw event
/// JSON back, bounded in time. A faulty scraper can fail its run but cannot
/// corrupt the host process.
#[async_trait]
pub trait ScraperRuntime: Send + Sync {
    /// Executes a version's code against its target. Returns one raw JSON
    /// value per scraped event. Partial output from a timed-out run is
    /// discarded by the caller.
    async fn run(
        &self,
        code: &str,
        config: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>>;
}

static RAW_EVENT_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::compile(&json!({
        "type": "object",
        "required": ["title", "source_url"],
        "properties": {
            "title": { "type": "string", "minLength": 1 },
            "source_url": { "type": "string", "minLength": 1 },
            "starts_at": { "type": ["string", "null"] },
            "description": { "type": ["string", "null"] },
            "cover_charge": { "type": ["string", "null"] },
            "image_url": { "type": ["string", "null"] },
            "doors_at": { "type": ["string", "null"] },
            "ends_at": { "type": ["string", "null"] },
            "ticket_url": { "type": ["string", "null"] },
            "age_restriction": { "type": ["string", "null"] },
            "genres": { "type": "array", "items": { "type": "string" } },
            "artists": { "type": "array", "items": { "type": "string" } }
        }
    }))
    .expect("raw event schema is valid")
});

/// Validates one raw scraper output record against the execution contract.
pub fn validate_raw_event(raw: &serde_json::Value) -> std::result::Result<(), String> {
    RAW_EVENT_SCHEMA.validate(raw).map_err(|errors| {
        errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    })
}
