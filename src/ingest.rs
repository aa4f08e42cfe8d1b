use crate::config::ScrapingConfig;
use crate::domain::{RunStatus, ScrapedEvent, Source, Venue};
use crate::error::{PipelineError, Result};
use crate::locks::SourceLocks;
use crate::merge::{MergeEngine, MergeOutcome};
use crate::normalize::normalize_raw_event;
use crate::scraper::ScraperRuntime;
use crate::storage::Storage;
use chrono::Utc;
use metrics::{counter, histogram};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of one production ingestion run for one source.
#[derive(Debug)]
pub struct IngestionOutcome {
    pub source_id: Uuid,
    pub run_status: RunStatus,
    pub events_scraped: usize,
    pub merge: Option<MergeOutcome>,
    pub error: Option<String>,
}

/// Runs a source's active scraper version, normalizes the output, and hands
/// the batch to the merge engine. Holds the source's lease for the whole
/// run so ingestion never overlaps a test run or activation for the same
/// source.
pub struct IngestionCoordinator {
    storage: Arc<dyn Storage>,
    runtime: Arc<dyn ScraperRuntime>,
    merge_engine: MergeEngine,
    locks: SourceLocks,
    config: ScrapingConfig,
}

impl IngestionCoordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        runtime: Arc<dyn ScraperRuntime>,
        merge_engine: MergeEngine,
        locks: SourceLocks,
        config: ScrapingConfig,
    ) -> Self {
        Self {
            storage,
            runtime,
            merge_engine,
            locks,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_ingestion(&self, source_id: Uuid) -> Result<IngestionOutcome> {
        let source = self
            .storage
            .get_source(source_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("source {}", source_id)))?;
        if !source.is_active {
            return Err(PipelineError::Validation(format!(
                "source {} is disabled",
                source.slug
            )));
        }
        let _lease = self.locks.try_acquire(source_id, "ingestion")?;

        counter!("gigdex_ingest_runs_total", "source" => source.slug.clone()).increment(1);
        let started = std::time::Instant::now();
        info!("Starting ingestion for {}", source.slug);

        let Some(version) = self.storage.get_active_version(source_id).await? else {
            // Run bookkeeping happens on failure too, so staleness is visible.
            self.storage
                .record_source_run(source_id, RunStatus::Failed, Utc::now())
                .await?;
            return Err(PipelineError::NoActiveVersion {
                slug: source.slug.clone(),
            });
        };

        let raw_events = match self.scrape_with_retries(&source, &version.code).await {
            Ok(raw_events) => raw_events,
            Err(e) => {
                // A failed or timed-out scrape never touches the catalog.
                warn!("Ingestion failed for {}: {}", source.slug, e);
                counter!("gigdex_ingest_failures_total", "source" => source.slug.clone())
                    .increment(1);
                self.storage
                    .record_source_run(source_id, RunStatus::Failed, Utc::now())
                    .await?;
                return Ok(IngestionOutcome {
                    source_id,
                    run_status: RunStatus::Failed,
                    events_scraped: 0,
                    merge: None,
                    error: Some(e.to_string()),
                });
            }
        };
        info!("Fetched {} raw events from {}", raw_events.len(), source.slug);

        let mut batch: Vec<ScrapedEvent> = Vec::with_capacity(raw_events.len());
        for (i, raw) in raw_events.iter().enumerate() {
            match normalize_raw_event(raw) {
                Ok(event) => batch.push(event),
                Err(reason) => {
                    warn!("Dropping record {} from {}: {}", i, source.slug, reason);
                }
            }
        }

        let venue = self.resolve_venue(&source).await?;
        let merge = self
            .merge_engine
            .merge_batch(self.storage.clone(), batch, &source.snapshot(), &venue)
            .await?;

        self.storage
            .record_source_run(source_id, RunStatus::Success, Utc::now())
            .await?;
        histogram!("gigdex_ingest_duration_seconds", "source" => source.slug.clone())
            .record(started.elapsed().as_secs_f64());
        info!(
            "Ingestion for {} finished: {} scraped, {} created, {} updated",
            source.slug,
            raw_events.len(),
            merge.created,
            merge.updated
        );

        Ok(IngestionOutcome {
            source_id,
            run_status: RunStatus::Success,
            events_scraped: raw_events.len(),
            merge: Some(merge),
            error: None,
        })
    }

    /// Invokes the scraper runtime, retrying transient failures a bounded
    /// number of times with jittered backoff. Validation failures and other
    /// non-transient errors surface immediately.
    async fn scrape_with_retries(
        &self,
        source: &Source,
        code: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let timeout = Duration::from_secs(self.config.run_timeout_secs);
        let mut attempt = 0u32;
        loop {
            match self.runtime.run(code, &source.config, timeout).await {
                Ok(raw_events) => return Ok(raw_events),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                    warn!(
                        "Transient scrape failure for {} (attempt {}): {}; retrying in {}ms",
                        source.slug,
                        attempt,
                        e,
                        backoff + jitter
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolves the venue a source reports for, creating it on first sight.
    /// The binding lives in the source's stored configuration.
    async fn resolve_venue(&self, source: &Source) -> Result<Venue> {
        let venue_name = source
            .config
            .get("venue_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "source {} config is missing venue_name",
                    source.slug
                ))
            })?;

        if let Some(venue) = self.storage.get_venue_by_name(venue_name).await? {
            return Ok(venue);
        }

        let region_id = source
            .config
            .get("region_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "source {} config is missing region_id for new venue '{}'",
                    source.slug, venue_name
                ))
            })?;
        let timezone = source
            .config
            .get("timezone")
            .and_then(|v| v.as_str())
            .unwrap_or("UTC");

        let mut venue = Venue::new(venue_name, region_id, timezone);
        self.storage.create_venue(&mut venue).await?;
        info!("Created venue '{}' for source {}", venue_name, source.slug);
        Ok(venue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeConfig;
    use crate::domain::{SourceArgs, SourceCategory, SourceType, VersionOrigin};
    use crate::scraper::FixtureRuntime;
    use crate::storage::InMemoryStorage;
    use crate::versions::VersionManager;
    use serde_json::json;

    struct Fixture {
        coordinator: IngestionCoordinator,
        versions: VersionManager,
        storage: Arc<InMemoryStorage>,
        locks: SourceLocks,
        source_id: Uuid,
    }

    async fn setup() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let locks = SourceLocks::new();
        let runtime = Arc::new(FixtureRuntime);
        let mut source = Source::new(SourceArgs {
            name: "Blue Moon Tavern".into(),
            source_type: SourceType::Scraper,
            category: SourceCategory::Venue,
            priority: 10,
            trust_score: 0.9,
            config: json!({
                "venue_name": "Blue Moon Tavern",
                "region_id": Uuid::new_v4().to_string(),
                "timezone": "America/Los_Angeles"
            }),
        });
        storage.create_source(&mut source).await.unwrap();

        let scraping = ScrapingConfig {
            run_timeout_secs: 5,
            max_retries: 1,
            retry_backoff_ms: 10,
        };
        Fixture {
            coordinator: IngestionCoordinator::new(
                storage.clone(),
                runtime.clone(),
                MergeEngine::new(MergeConfig::default()),
                locks.clone(),
                scraping.clone(),
            ),
            versions: VersionManager::new(storage.clone(), runtime, locks.clone(), scraping),
            storage,
            locks,
            source_id: source.id.unwrap(),
        }
    }

    async fn activate_code(fixture: &Fixture, code: serde_json::Value) {
        let version = fixture
            .versions
            .create_version(
                fixture.source_id,
                code.to_string(),
                VersionOrigin::AiGenerated,
                None,
            )
            .await
            .unwrap();
        fixture
            .versions
            .activate_version(fixture.source_id, version.id.unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_active_version_fails_and_leaves_catalog_untouched() {
        let fixture = setup().await;
        let err = fixture.coordinator.run_ingestion(fixture.source_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoActiveVersion { .. }));

        let source = fixture.storage.get_source(fixture.source_id).await.unwrap().unwrap();
        assert_eq!(source.last_run_status, Some(RunStatus::Failed));
        assert!(fixture.storage.list_artists().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_run_merges_and_records_success() {
        let fixture = setup().await;
        activate_code(
            &fixture,
            json!({"events": [{
                "title": "Jazz Night",
                "starts_at": "2025-11-01T20:00",
                "source_url": "https://venue.example/jazz",
                "genres": ["Jazz"],
                "artists": ["Nina Simone"]
            }]}),
        )
        .await;

        let outcome = fixture.coordinator.run_ingestion(fixture.source_id).await.unwrap();
        assert_eq!(outcome.run_status, RunStatus::Success);
        assert_eq!(outcome.events_scraped, 1);
        let merge = outcome.merge.unwrap();
        assert_eq!(merge.created, 1);
        assert_eq!(merge.new_artists, 1);

        let source = fixture.storage.get_source(fixture.source_id).await.unwrap().unwrap();
        assert_eq!(source.last_run_status, Some(RunStatus::Success));
        assert!(source.last_run_at.is_some());

        let venue = fixture
            .storage
            .get_venue_by_name("Blue Moon Tavern")
            .await
            .unwrap()
            .unwrap();
        let events = fixture
            .storage
            .find_events_by_venue_dates(
                venue.id.unwrap(),
                chrono::NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
                chrono::NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].genres[0].value, "jazz");
    }

    #[tokio::test]
    async fn scrape_failure_records_failed_run_without_catalog_writes() {
        let fixture = setup().await;
        activate_code(&fixture, json!({"error": "site returned 500", "transient": true})).await;

        let outcome = fixture.coordinator.run_ingestion(fixture.source_id).await.unwrap();
        assert_eq!(outcome.run_status, RunStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("site returned 500"));
        assert!(outcome.merge.is_none());

        let source = fixture.storage.get_source(fixture.source_id).await.unwrap().unwrap();
        assert_eq!(source.last_run_status, Some(RunStatus::Failed));
        assert!(fixture
            .storage
            .get_venue_by_name("Blue Moon Tavern")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_not_fatal() {
        let fixture = setup().await;
        activate_code(
            &fixture,
            json!({"events": [
                {"title": "Good Show", "starts_at": "2025-11-01T20:00", "source_url": "https://venue.example/good"},
                {"title": "Missing URL"}
            ]}),
        )
        .await;

        let outcome = fixture.coordinator.run_ingestion(fixture.source_id).await.unwrap();
        assert_eq!(outcome.run_status, RunStatus::Success);
        assert_eq!(outcome.events_scraped, 2);
        assert_eq!(outcome.merge.unwrap().created, 1);
    }

    #[tokio::test]
    async fn overlapping_run_for_same_source_conflicts() {
        let fixture = setup().await;
        activate_code(&fixture, json!({"events": []})).await;

        let _lease = fixture.locks.try_acquire(fixture.source_id, "scraper test").unwrap();
        let err = fixture.coordinator.run_ingestion(fixture.source_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }
}
