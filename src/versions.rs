use crate::config::ScrapingConfig;
use crate::domain::{
    FieldCoverage, FieldsAnalysis, ScrapedEvent, ScraperVersion, Source, TestResults,
    VersionOrigin,
};
use crate::error::{PipelineError, Result};
use crate::locks::SourceLocks;
use crate::normalize::normalize_raw_event;
use crate::scraper::ScraperRuntime;
use crate::storage::Storage;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SAMPLE_EVENT_LIMIT: usize = 5;
const REQUIRED_FIELDS: [&str; 3] = ["title", "starts_at", "source_url"];
const OPTIONAL_FIELDS: [&str; 9] = [
    "description",
    "cover_charge",
    "image_url",
    "doors_at",
    "ends_at",
    "ticket_url",
    "genres",
    "artists",
    "age_restriction",
];

/// Manages the scraper-version lifecycle for every source: creation,
/// test runs, activation, rollback. Activation and test runs take the same
/// per-source lease production ingestion uses, so a source never talks to
/// its target from two operations at once.
pub struct VersionManager {
    storage: Arc<dyn Storage>,
    runtime: Arc<dyn ScraperRuntime>,
    locks: SourceLocks,
    config: ScrapingConfig,
}

impl VersionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        runtime: Arc<dyn ScraperRuntime>,
        locks: SourceLocks,
        config: ScrapingConfig,
    ) -> Self {
        Self {
            storage,
            runtime,
            locks,
            config,
        }
    }

    /// Creates a new immutable version for a source. Rejects a no-op edit:
    /// code whose hash matches the currently active version's.
    #[instrument(skip(self, code))]
    pub async fn create_version(
        &self,
        source_id: Uuid,
        code: String,
        origin: VersionOrigin,
        description: Option<String>,
    ) -> Result<ScraperVersion> {
        if code.trim().is_empty() {
            return Err(PipelineError::Validation("version code is empty".into()));
        }
        let source = self.require_source(source_id).await?;
        let code_hash = hash_code(&code);

        if let Some(active) = self.storage.get_active_version(source_id).await? {
            if active.code_hash == code_hash {
                return Err(PipelineError::DuplicateVersion {
                    slug: source.slug,
                    active_version: active.version_number,
                });
            }
        }

        let mut version = ScraperVersion {
            id: None,
            source_id,
            // Assigned by storage when the version is persisted.
            version_number: 0,
            code,
            code_hash,
            origin,
            description,
            is_active: false,
            created_at: Utc::now(),
            last_tested_at: None,
            test_results: None,
        };
        self.storage.create_version(&mut version).await?;
        info!(
            "Created version {} ({:?}) for source {}",
            version.version_number, origin, source.slug
        );
        Ok(version)
    }

    /// Runs a version's code against the source's target and records the
    /// outcome on the version. Never activates, and records results whether
    /// the run passed or failed.
    #[instrument(skip(self))]
    pub async fn test_version(&self, source_id: Uuid, version_id: Uuid) -> Result<TestResults> {
        let source = self.require_source(source_id).await?;
        let version = self.require_version(source_id, version_id).await?;
        let _lease = self.locks.try_acquire(source_id, "scraper test")?;

        let timeout = Duration::from_secs(self.config.run_timeout_secs);
        let started = std::time::Instant::now();
        let run = self
            .runtime
            .run(&version.code, &source.config, timeout)
            .await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let results = match run {
            Ok(raw_events) => build_test_results(&raw_events, execution_time_ms),
            Err(e) => {
                warn!("Test run failed for {} v{}: {}", source.slug, version.version_number, e);
                TestResults {
                    success: false,
                    error: Some(e.to_string()),
                    execution_time_ms,
                    event_count: 0,
                    sample_events: Vec::new(),
                    fields_analysis: FieldsAnalysis::default(),
                    warnings: Vec::new(),
                }
            }
        };

        self.storage
            .record_test_results(version_id, results.clone(), Utc::now())
            .await?;
        info!(
            "Tested {} v{}: success={} events={}",
            source.slug, version.version_number, results.success, results.event_count
        );
        Ok(results)
    }

    /// Makes a version the source's single active version. Serialized per
    /// source; a concurrent attempt surfaces as Conflict.
    #[instrument(skip(self))]
    pub async fn activate_version(&self, source_id: Uuid, version_id: Uuid) -> Result<()> {
        let source = self.require_source(source_id).await?;
        let version = self.require_version(source_id, version_id).await?;
        let _lease = self.locks.try_acquire(source_id, "activation")?;

        self.storage.set_active_version(source_id, version_id).await?;
        info!("Activated {} v{}", source.slug, version.version_number);
        Ok(())
    }

    /// Rolls a source back to a prior version's code by creating a fresh
    /// version (origin Rollback) and activating it. History stays intact
    /// and version numbers keep increasing.
    #[instrument(skip(self))]
    pub async fn rollback(&self, source_id: Uuid, to_version_number: u32) -> Result<ScraperVersion> {
        let versions = self.storage.list_versions(source_id).await?;
        let target = versions
            .iter()
            .find(|v| v.version_number == to_version_number)
            .ok_or_else(|| {
                PipelineError::NotFound(format!(
                    "version {} for source {}",
                    to_version_number, source_id
                ))
            })?;

        let rollback = self
            .create_version(
                source_id,
                target.code.clone(),
                VersionOrigin::Rollback,
                Some(format!("Rollback to version {}", to_version_number)),
            )
            .await?;
        let rollback_id = rollback
            .id
            .ok_or_else(|| PipelineError::Validation("created version missing id".into()))?;
        self.activate_version(source_id, rollback_id).await?;
        self.storage
            .get_version(rollback_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound("rollback version vanished".into()))
    }

    pub async fn list_versions(&self, source_id: Uuid) -> Result<Vec<ScraperVersion>> {
        self.require_source(source_id).await?;
        self.storage.list_versions(source_id).await
    }

    pub async fn get_version(&self, version_id: Uuid) -> Result<ScraperVersion> {
        self.storage
            .get_version(version_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("version {}", version_id)))
    }

    async fn require_source(&self, source_id: Uuid) -> Result<Source> {
        self.storage
            .get_source(source_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("source {}", source_id)))
    }

    async fn require_version(&self, source_id: Uuid, version_id: Uuid) -> Result<ScraperVersion> {
        let version = self
            .storage
            .get_version(version_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("version {}", version_id)))?;
        if version.source_id != source_id {
            return Err(PipelineError::Validation(format!(
                "version {} does not belong to source {}",
                version_id, source_id
            )));
        }
        Ok(version)
    }
}

pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

fn build_test_results(raw_events: &[serde_json::Value], execution_time_ms: u64) -> TestResults {
    let mut warnings = Vec::new();
    let mut normalized: Vec<ScrapedEvent> = Vec::new();
    let mut invalid = 0usize;

    for (i, raw) in raw_events.iter().enumerate() {
        match normalize_raw_event(raw) {
            Ok(event) => normalized.push(event),
            Err(reason) => {
                invalid += 1;
                if invalid <= 3 {
                    warnings.push(format!("record {}: {}", i, reason));
                }
            }
        }
    }
    if invalid > 3 {
        warnings.push(format!("{} further records failed validation", invalid - 3));
    }

    let fields_analysis = analyze_fields(raw_events);
    for field in REQUIRED_FIELDS {
        if let Some(coverage) = fields_analysis.required.get(field) {
            if coverage.percent < 100.0 {
                warnings.push(format!(
                    "required field {} covered in {:.0}% of records",
                    field, coverage.percent
                ));
            }
        }
    }

    let sample_events = normalized.iter().take(SAMPLE_EVENT_LIMIT).cloned().collect();
    TestResults {
        success: !normalized.is_empty(),
        error: if raw_events.is_empty() {
            Some("scraper produced no events".to_string())
        } else {
            None
        },
        execution_time_ms,
        event_count: normalized.len(),
        sample_events,
        fields_analysis,
        warnings,
    }
}

/// Per-field coverage over raw output, required and optional split.
fn analyze_fields(raw_events: &[serde_json::Value]) -> FieldsAnalysis {
    let total = raw_events.len();
    let mut analysis = FieldsAnalysis::default();

    let coverage = |field: &str| -> FieldCoverage {
        let count = raw_events.iter().filter(|raw| field_present(raw, field)).count();
        let percent = if total == 0 {
            0.0
        } else {
            count as f64 / total as f64 * 100.0
        };
        FieldCoverage { count, percent }
    };

    for field in REQUIRED_FIELDS {
        analysis.required.insert(field.to_string(), coverage(field));
    }
    for field in OPTIONAL_FIELDS {
        analysis.optional.insert(field.to_string(), coverage(field));
    }
    analysis
}

fn field_present(raw: &serde_json::Value, field: &str) -> bool {
    match raw.get(field) {
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::Null) | None => false,
        Some(_) => true,
    }
}
