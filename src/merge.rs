use crate::config::MergeConfig;
use crate::domain::{
    Artist, Event, FieldProvenance, ProvenancedId, ProvenancedTag, ScrapedEvent, SourceSnapshot,
    SourceType, Venue,
};
use crate::error::Result;
use crate::similarity;
use crate::storage::Storage;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Atomic unit of catalog changes produced by one merge run. Either the
/// whole plan commits or none of it does.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub source_id: Uuid,
    pub new_artists: Vec<Artist>,
    pub new_events: Vec<Event>,
    pub updated_events: Vec<Event>,
}

/// What happened to a batch, for run reporting.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub dropped: usize,
    pub new_artists: usize,
    pub warnings: Vec<String>,
}

/// Collapses scraped observations into canonical events with field-level
/// conflict resolution. Decisions depend only on the batch, the source
/// snapshot, and the catalog state read at the start, so re-running an
/// identical batch is a no-op.
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Merges one batch from one source against the canonical catalog and
    /// commits the resulting plan atomically.
    #[instrument(skip(self, storage, batch, venue), fields(source = %source.slug, batch_size = batch.len()))]
    pub async fn merge_batch(
        &self,
        storage: Arc<dyn Storage>,
        batch: Vec<ScrapedEvent>,
        source: &SourceSnapshot,
        venue: &Venue,
    ) -> Result<MergeOutcome> {
        let venue_id = venue.id.ok_or_else(|| {
            crate::error::PipelineError::Validation("venue must be persisted before merge".into())
        })?;
        let now = Utc::now();
        let mut outcome = MergeOutcome::default();
        let mut plan = MergePlan {
            source_id: source.source_id,
            ..Default::default()
        };
        // Events touched this run, keyed by id, so two observations of the
        // same show inside one batch collapse too.
        let mut touched: HashMap<Uuid, (Event, bool)> = HashMap::new();
        let mut new_artist_slugs: HashMap<String, Uuid> = HashMap::new();

        for scraped in batch {
            let Some(event_day) = scraped.event_day else {
                outcome.dropped += 1;
                let w = format!("dropped '{}': no event date", scraped.title);
                warn!("{}", w);
                outcome.warnings.push(w);
                continue;
            };
            if scraped.title.trim().is_empty() || scraped.source_url.trim().is_empty() {
                outcome.dropped += 1;
                let w = format!("dropped record at {}: missing title or source url", event_day);
                warn!("{}", w);
                outcome.warnings.push(w);
                continue;
            }

            // Candidates: catalog events in the date window plus events
            // already created or touched in this batch.
            let from = event_day - Duration::days(self.config.date_tolerance_days);
            let to = event_day + Duration::days(self.config.date_tolerance_days);
            let mut candidates = storage
                .find_events_by_venue_dates(venue_id, from, to)
                .await?;
            candidates.retain(|c| !touched.contains_key(&c.id.unwrap()));
            for (event, _) in touched.values() {
                if event.event_day >= from && event.event_day <= to {
                    candidates.push(event.clone());
                }
            }
            candidates.extend(
                plan.new_events
                    .iter()
                    .filter(|e| e.event_day >= from && e.event_day <= to)
                    .cloned(),
            );

            match self.best_match(&scraped, source, &candidates) {
                Some(matched_id) => {
                    // Pull the working copy out of whichever buffer holds it.
                    let (mut event, mut dirty, was_new) =
                        if let Some((event, dirty)) = touched.remove(&matched_id) {
                            (event, dirty, false)
                        } else if let Some(pos) =
                            plan.new_events.iter().position(|e| e.id == Some(matched_id))
                        {
                            (plan.new_events.remove(pos), false, true)
                        } else {
                            let event = candidates
                                .into_iter()
                                .find(|c| c.id == Some(matched_id))
                                .expect("matched candidate present");
                            (event, false, false)
                        };

                    let changed = self
                        .apply_observation(
                            &mut event,
                            &scraped,
                            source,
                            &mut plan.new_artists,
                            &mut new_artist_slugs,
                            storage.clone(),
                            now,
                        )
                        .await?;
                    dirty |= changed;

                    if was_new {
                        // Collapsed into an event created earlier in this batch.
                        plan.new_events.push(event);
                        if !changed {
                            outcome.unchanged += 1;
                        }
                    } else {
                        if changed {
                            debug!("Merged observation into event {}", matched_id);
                        } else {
                            outcome.unchanged += 1;
                        }
                        touched.insert(matched_id, (event, dirty));
                    }
                }
                None => {
                    let event = self
                        .build_new_event(
                            &scraped,
                            event_day,
                            source,
                            venue,
                            &mut plan.new_artists,
                            &mut new_artist_slugs,
                            storage.clone(),
                            now,
                        )
                        .await?;
                    info!("Creating event '{}' on {} at {}", event.title, event.event_day, venue.name);
                    plan.new_events.push(event);
                    outcome.created += 1;
                }
            }
        }

        for (event, dirty) in touched.into_values() {
            if dirty {
                outcome.updated += 1;
                plan.updated_events.push(event);
            }
        }
        outcome.new_artists = plan.new_artists.len();

        counter!("gigdex_events_created_total", "source" => source.slug.clone())
            .increment(outcome.created as u64);
        counter!("gigdex_events_updated_total", "source" => source.slug.clone())
            .increment(outcome.updated as u64);
        counter!("gigdex_records_dropped_total", "source" => source.slug.clone())
            .increment(outcome.dropped as u64);

        storage.apply_merge_plan(plan).await?;
        info!(
            "Merge complete: {} created, {} updated, {} unchanged, {} dropped",
            outcome.created, outcome.updated, outcome.unchanged, outcome.dropped
        );
        Ok(outcome)
    }

    /// Picks the candidate describing the same real-world show. An exact
    /// source-url hit is the natural key within a feed and wins outright.
    /// Otherwise the closest title above the threshold wins, except that a
    /// candidate whose source_url this same source owns under a different
    /// url is a distinct record in the feed and never merges, however
    /// similar the titles.
    fn best_match(
        &self,
        scraped: &ScrapedEvent,
        source: &SourceSnapshot,
        candidates: &[Event],
    ) -> Option<Uuid> {
        if let Some(exact) = candidates
            .iter()
            .find(|c| c.source_url.as_deref() == Some(scraped.source_url.as_str()))
        {
            return exact.id;
        }
        let mut scored: Vec<(f64, Uuid)> = candidates
            .iter()
            .filter(|c| {
                !c.field_sources
                    .get("source_url")
                    .map_or(false, |p| p.source_id == source.source_id)
            })
            .filter_map(|c| {
                let score = similarity::score(&scraped.title, &c.title);
                (score >= self.config.title_similarity_threshold).then(|| (score, c.id.unwrap()))
            })
            .collect();
        if scored.len() > 1 {
            // Deterministic under equal scores: fall back to id ordering.
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then(a.1.cmp(&b.1)));
            info!(
                "Ambiguous dedup for '{}': {} plausible matches, picked {} (score {:.3})",
                scraped.title,
                scored.len(),
                scored[0].1,
                scored[0].0
            );
        } else {
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        }
        scored.first().map(|(_, id)| *id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_new_event(
        &self,
        scraped: &ScrapedEvent,
        event_day: chrono::NaiveDate,
        source: &SourceSnapshot,
        venue: &Venue,
        new_artists: &mut Vec<Artist>,
        new_artist_slugs: &mut HashMap<String, Uuid>,
        storage: Arc<dyn Storage>,
        now: DateTime<Utc>,
    ) -> Result<Event> {
        let mut event = Event {
            id: Some(Uuid::new_v4()),
            title: scraped.title.clone(),
            venue_id: venue.id.unwrap(),
            region_id: venue.region_id,
            event_day,
            start_time: scraped.start_time,
            source_url: Some(scraped.source_url.clone()),
            description: scraped.description.clone(),
            cover_charge: scraped.cover_charge.clone(),
            image_url: scraped.image_url.clone(),
            doors_time: scraped.doors_time,
            end_time: scraped.end_time,
            ticket_url: scraped.ticket_url.clone(),
            age_restriction: scraped.age_restriction.clone(),
            genres: Vec::new(),
            artist_ids: Vec::new(),
            field_sources: HashMap::new(),
            attendance_count: 0,
            created_at: now,
            updated_at: now,
        };

        let provenance = field_provenance(source, now);
        for field in scalar_field_names().iter().copied() {
            if scalar_value(&event, field).is_some() {
                event.field_sources.insert(field.to_string(), provenance.clone());
            }
        }
        // Title always has an owner.
        event.field_sources.insert("title".into(), provenance);

        for genre in &scraped.genres {
            event.genres.push(ProvenancedTag {
                value: genre.clone(),
                source_id: source.source_id,
            });
        }
        for name in &scraped.artists {
            let artist_id = self
                .resolve_artist(name, new_artists, new_artist_slugs, storage.clone())
                .await?;
            event.artist_ids.push(ProvenancedId {
                id: artist_id,
                source_id: source.source_id,
            });
        }
        Ok(event)
    }

    /// Applies one observation to an existing event. Returns whether any
    /// field actually changed.
    #[allow(clippy::too_many_arguments)]
    async fn apply_observation(
        &self,
        event: &mut Event,
        scraped: &ScrapedEvent,
        source: &SourceSnapshot,
        new_artists: &mut Vec<Artist>,
        new_artist_slugs: &mut HashMap<String, Uuid>,
        storage: Arc<dyn Storage>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut changed = false;

        for field in scalar_field_names().iter().copied() {
            let incoming = scraped_scalar(scraped, field);
            let existing = scalar_value(event, field);

            if incoming == existing {
                continue;
            }
            if !self.incoming_wins(
                event.field_sources.get(field),
                source,
                incoming.is_none(),
                existing.is_some(),
                now,
            ) {
                continue;
            }
            set_scalar(event, field, incoming);
            event
                .field_sources
                .insert(field.to_string(), field_provenance(source, now));
            changed = true;
        }

        // Title is scalar too but lives outside the Option-valued helpers.
        if scraped.title != event.title
            && self.incoming_wins(event.field_sources.get("title"), source, false, true, now)
        {
            debug!("Title '{}' replaced by '{}'", event.title, scraped.title);
            event.title = scraped.title.clone();
            event.field_sources.insert("title".into(), field_provenance(source, now));
            changed = true;
        }

        // List fields union across sources; existing items are never removed.
        for genre in &scraped.genres {
            if !event.genres.iter().any(|g| g.value == *genre) {
                event.genres.push(ProvenancedTag {
                    value: genre.clone(),
                    source_id: source.source_id,
                });
                changed = true;
            }
        }
        for name in &scraped.artists {
            let artist_id = self
                .resolve_artist(name, new_artists, new_artist_slugs, storage.clone())
                .await?;
            if !event.artist_ids.iter().any(|a| a.id == artist_id) {
                event.artist_ids.push(ProvenancedId {
                    id: artist_id,
                    source_id: source.source_id,
                });
                changed = true;
            }
        }

        if changed {
            event.updated_at = now;
        }
        Ok(changed)
    }

    /// Field-level conflict arbitration.
    fn incoming_wins(
        &self,
        existing: Option<&FieldProvenance>,
        incoming: &SourceSnapshot,
        incoming_is_empty: bool,
        existing_is_populated: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(owner) = existing else {
            // Unowned (empty) field: anything non-empty may fill it.
            return !incoming_is_empty || !existing_is_populated;
        };

        // Never-regress: an empty value erases data only when the incoming
        // source strictly outranks the owner.
        if incoming_is_empty && existing_is_populated {
            return incoming.priority < owner.priority;
        }

        // A human correction holds against a scrape that would outrank it
        // only until the correction goes stale.
        if owner.source_type == SourceType::Manual
            && incoming.source_type != SourceType::Manual
            && owner.priority < incoming.priority
        {
            let stale_after = owner.recorded_at + Duration::days(self.config.manual_staleness_days);
            return now > stale_after;
        }

        if incoming.priority != owner.priority {
            return incoming.priority < owner.priority;
        }
        if incoming.trust_score != owner.trust_score {
            return incoming.trust_score > owner.trust_score;
        }
        // Full tie keeps the existing value so re-ingestion never churns.
        false
    }

    /// Finds an existing artist by slug, or creates one in Pending. New
    /// artists within a batch are cached so two events share one record.
    async fn resolve_artist(
        &self,
        name: &str,
        new_artists: &mut Vec<Artist>,
        new_artist_slugs: &mut HashMap<String, Uuid>,
        storage: Arc<dyn Storage>,
    ) -> Result<Uuid> {
        let slug = crate::domain::slugify(name);
        if let Some(&id) = new_artist_slugs.get(&slug) {
            return Ok(id);
        }
        if let Some(existing) = storage.get_artist_by_slug(&slug).await? {
            return Ok(existing.id.unwrap());
        }
        let mut artist = Artist::new(name);
        let id = Uuid::new_v4();
        artist.id = Some(id);
        debug!("New artist '{}' enters the catalog as pending", name);
        new_artist_slugs.insert(slug, id);
        new_artists.push(artist);
        Ok(id)
    }
}

fn field_provenance(source: &SourceSnapshot, now: DateTime<Utc>) -> FieldProvenance {
    FieldProvenance {
        source_id: source.source_id,
        source_type: source.source_type,
        priority: source.priority,
        trust_score: source.trust_score,
        recorded_at: now,
    }
}

/// Scalar fields subject to per-field conflict resolution. Title is handled
/// separately; event_day is identity, not a merged field.
fn scalar_field_names() -> &'static [&'static str] {
    &[
        "start_time",
        "source_url",
        "description",
        "cover_charge",
        "image_url",
        "doors_time",
        "end_time",
        "ticket_url",
        "age_restriction",
    ]
}

#[derive(Debug, Clone, PartialEq)]
enum ScalarValue {
    Text(String),
    Time(NaiveTime),
}

fn scraped_scalar(scraped: &ScrapedEvent, field: &str) -> Option<ScalarValue> {
    match field {
        "start_time" => scraped.start_time.map(ScalarValue::Time),
        "source_url" => Some(ScalarValue::Text(scraped.source_url.clone())),
        "description" => scraped.description.clone().map(ScalarValue::Text),
        "cover_charge" => scraped.cover_charge.clone().map(ScalarValue::Text),
        "image_url" => scraped.image_url.clone().map(ScalarValue::Text),
        "doors_time" => scraped.doors_time.map(ScalarValue::Time),
        "end_time" => scraped.end_time.map(ScalarValue::Time),
        "ticket_url" => scraped.ticket_url.clone().map(ScalarValue::Text),
        "age_restriction" => scraped.age_restriction.clone().map(ScalarValue::Text),
        _ => None,
    }
}

fn scalar_value(event: &Event, field: &str) -> Option<ScalarValue> {
    match field {
        "start_time" => event.start_time.map(ScalarValue::Time),
        "source_url" => event.source_url.clone().map(ScalarValue::Text),
        "description" => event.description.clone().map(ScalarValue::Text),
        "cover_charge" => event.cover_charge.clone().map(ScalarValue::Text),
        "image_url" => event.image_url.clone().map(ScalarValue::Text),
        "doors_time" => event.doors_time.map(ScalarValue::Time),
        "end_time" => event.end_time.map(ScalarValue::Time),
        "ticket_url" => event.ticket_url.clone().map(ScalarValue::Text),
        "age_restriction" => event.age_restriction.clone().map(ScalarValue::Text),
        _ => None,
    }
}

fn set_scalar(event: &mut Event, field: &str, value: Option<ScalarValue>) {
    match field {
        "start_time" => event.start_time = as_time(value),
        "source_url" => event.source_url = as_text(value),
        "description" => event.description = as_text(value),
        "cover_charge" => event.cover_charge = as_text(value),
        "image_url" => event.image_url = as_text(value),
        "doors_time" => event.doors_time = as_time(value),
        "end_time" => event.end_time = as_time(value),
        "ticket_url" => event.ticket_url = as_text(value),
        "age_restriction" => event.age_restriction = as_text(value),
        _ => {}
    }
}

fn as_text(value: Option<ScalarValue>) -> Option<String> {
    match value {
        Some(ScalarValue::Text(s)) => Some(s),
        _ => None,
    }
}

fn as_time(value: Option<ScalarValue>) -> Option<NaiveTime> {
    match value {
        Some(ScalarValue::Time(t)) => Some(t),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use chrono::NaiveDate;

    fn snapshot(source_type: SourceType, priority: i32, trust: f64) -> SourceSnapshot {
        SourceSnapshot {
            source_id: Uuid::new_v4(),
            slug: format!("src-{}", priority),
            source_type,
            priority,
            trust_score: trust,
        }
    }

    fn scraped(title: &str, url: &str) -> ScrapedEvent {
        ScrapedEvent {
            title: title.to_string(),
            event_day: NaiveDate::from_ymd_opt(2025, 11, 1),
            start_time: NaiveTime::from_hms_opt(20, 0, 0),
            source_url: url.to_string(),
            ..Default::default()
        }
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(MergeConfig::default())
    }

    async fn setup() -> (MergeEngine, Arc<InMemoryStorage>, Venue) {
        let storage = Arc::new(InMemoryStorage::new());
        let mut venue = Venue::new("Blue Moon Tavern", Uuid::new_v4(), "America/Los_Angeles");
        storage.create_venue(&mut venue).await.unwrap();
        (engine(), storage, venue)
    }

    async fn all_events(storage: &Arc<InMemoryStorage>, venue: &Venue) -> Vec<Event> {
        storage
            .find_events_by_venue_dates(
                venue.id.unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn new_event_created_with_provenance() {
        let (engine, storage, venue) = setup().await;
        let manual = snapshot(SourceType::Manual, 40, 0.8);
        let mut record = scraped("Jazz Night", "https://venue.example/jazz");
        record.genres = vec!["jazz".into()];

        let outcome = engine
            .merge_batch(storage.clone(), vec![record], &manual, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);

        let events = all_events(&storage, &venue).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "Jazz Night");
        assert_eq!(event.venue_id, venue.id.unwrap());
        assert_eq!(event.region_id, venue.region_id);
        assert_eq!(event.genres, vec![ProvenancedTag { value: "jazz".into(), source_id: manual.source_id }]);
        assert_eq!(event.field_sources.get("title").unwrap().source_id, manual.source_id);
    }

    #[tokio::test]
    async fn higher_priority_scraper_corrects_and_enriches() {
        let (engine, storage, venue) = setup().await;
        let manual = snapshot(SourceType::Manual, 40, 0.8);
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);

        let mut manual_record = scraped("Jaz Night", "https://venue.example/jazz");
        manual_record.genres = vec!["jazz".into()];
        engine
            .merge_batch(storage.clone(), vec![manual_record], &manual, &venue)
            .await
            .unwrap();

        let mut scraper_record = scraped("Jazz Night", "https://bluemoon.example/shows/jazz");
        scraper_record.cover_charge = Some("$10".into());
        scraper_record.genres = vec!["blues".into()];
        let outcome = engine
            .merge_batch(storage.clone(), vec![scraper_record], &scraper, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 1);

        let events = all_events(&storage, &venue).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "Jazz Night");
        assert_eq!(event.cover_charge.as_deref(), Some("$10"));
        let genre_values: Vec<&str> = event.genres.iter().map(|g| g.value.as_str()).collect();
        assert_eq!(genre_values, vec!["jazz", "blues"]);
        assert_eq!(event.field_sources.get("title").unwrap().source_id, scraper.source_id);
    }

    #[tokio::test]
    async fn lower_priority_source_never_overwrites() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let artist_site = snapshot(SourceType::Scraper, 40, 0.5);

        let mut first = scraped("Jazz Night", "https://bluemoon.example/jazz");
        first.description = Some("An evening of standards".into());
        engine
            .merge_batch(storage.clone(), vec![first], &scraper, &venue)
            .await
            .unwrap();

        let mut second = scraped("Jazz Night", "https://artist.example/tour");
        second.description = Some("SHOW!!!".into());
        engine
            .merge_batch(storage.clone(), vec![second], &artist_site, &venue)
            .await
            .unwrap();

        let events = all_events(&storage, &venue).await;
        let event = &events[0];
        assert_eq!(event.description.as_deref(), Some("An evening of standards"));
        assert_eq!(event.source_url.as_deref(), Some("https://bluemoon.example/jazz"));
    }

    #[tokio::test]
    async fn empty_value_never_regresses_populated_field() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let weaker = snapshot(SourceType::Scraper, 40, 0.5);

        let mut first = scraped("Jazz Night", "https://bluemoon.example/jazz");
        first.cover_charge = Some("$10".into());
        engine
            .merge_batch(storage.clone(), vec![first], &scraper, &venue)
            .await
            .unwrap();

        // Weaker source reports the same show without a cover charge.
        let second = scraped("Jazz Night", "https://other.example/jazz");
        engine
            .merge_batch(storage.clone(), vec![second], &weaker, &venue)
            .await
            .unwrap();

        let events = all_events(&storage, &venue).await;
        assert_eq!(events[0].cover_charge.as_deref(), Some("$10"));
    }

    #[tokio::test]
    async fn reingestion_of_identical_batch_is_idempotent() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let mut record = scraped("Jazz Night", "https://bluemoon.example/jazz");
        record.genres = vec!["jazz".into()];
        record.artists = vec!["Nina Simone".into()];

        engine
            .merge_batch(storage.clone(), vec![record.clone()], &scraper, &venue)
            .await
            .unwrap();
        let first_pass = all_events(&storage, &venue).await;

        let outcome = engine
            .merge_batch(storage.clone(), vec![record], &scraper, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.new_artists, 0);

        let second_pass = all_events(&storage, &venue).await;
        assert_eq!(second_pass.len(), 1);
        assert_eq!(second_pass[0].updated_at, first_pass[0].updated_at);
    }

    #[tokio::test]
    async fn equal_priority_ties_break_on_trust_then_stability() {
        let (engine, storage, venue) = setup().await;
        let trusted = snapshot(SourceType::Scraper, 20, 0.9);
        let less_trusted = snapshot(SourceType::Scraper, 20, 0.4);
        let equally_trusted = snapshot(SourceType::Scraper, 20, 0.4);

        let mut first = scraped("Jazz Night", "https://a.example/jazz");
        first.description = Some("from less trusted".into());
        engine
            .merge_batch(storage.clone(), vec![first], &less_trusted, &venue)
            .await
            .unwrap();

        let mut second = scraped("Jazz Night", "https://b.example/jazz");
        second.description = Some("from more trusted".into());
        engine
            .merge_batch(storage.clone(), vec![second], &trusted, &venue)
            .await
            .unwrap();

        let events = all_events(&storage, &venue).await;
        assert_eq!(events[0].description.as_deref(), Some("from more trusted"));

        // Full tie: existing value stays.
        let mut third = scraped("Jazz Night", "https://c.example/jazz");
        third.description = Some("from equal source".into());
        engine
            .merge_batch(storage.clone(), vec![third], &equally_trusted, &venue)
            .await
            .unwrap();
        let events = all_events(&storage, &venue).await;
        assert_eq!(events[0].description.as_deref(), Some("from more trusted"));
    }

    #[tokio::test]
    async fn malformed_records_drop_without_failing_batch() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let mut no_date = scraped("Dateless", "https://x.example/1");
        no_date.event_day = None;
        let good = scraped("Jazz Night", "https://x.example/2");

        let outcome = engine
            .merge_batch(storage.clone(), vec![no_date, good], &scraper, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn dissimilar_titles_make_distinct_events() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let outcome = engine
            .merge_batch(
                storage.clone(),
                vec![
                    scraped("Jazz Night", "https://x.example/jazz"),
                    scraped("Metal Mondays", "https://x.example/metal"),
                ],
                &scraper,
                &venue,
            )
            .await
            .unwrap();
        assert_eq!(outcome.created, 2);
    }

    #[tokio::test]
    async fn same_source_records_with_distinct_urls_never_merge() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let batch = vec![
            scraped("Jazz Night Vol 1", "https://x.example/v1"),
            scraped("Jazz Night Vol 2", "https://x.example/v2"),
        ];

        // Near-identical titles, but each url is its own record in the feed.
        let outcome = engine
            .merge_batch(storage.clone(), batch.clone(), &scraper, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.created, 2);

        // Re-running the feed finds each event by url instead of duplicating.
        let outcome = engine
            .merge_batch(storage.clone(), batch, &scraper, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.unchanged, 2);
        assert_eq!(all_events(&storage, &venue).await.len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_match_picks_closest_title() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        engine
            .merge_batch(
                storage.clone(),
                vec![
                    scraped("Jazz Night Vol 1", "https://x.example/v1"),
                    scraped("Jazz Night Vol 2", "https://x.example/v2"),
                ],
                &scraper,
                &venue,
            )
            .await
            .unwrap();

        // Matches both existing events above threshold; the exact title wins.
        let other = snapshot(SourceType::Scraper, 20, 0.5);
        let mut update = scraped("Jazz Night Vol 2", "https://y.example/v2");
        update.cover_charge = Some("$5".into());
        engine
            .merge_batch(storage.clone(), vec![update], &other, &venue)
            .await
            .unwrap();

        let events = all_events(&storage, &venue).await;
        assert_eq!(events.len(), 2);
        let vol2 = events.iter().find(|e| e.title == "Jazz Night Vol 2").unwrap();
        let vol1 = events.iter().find(|e| e.title == "Jazz Night Vol 1").unwrap();
        assert_eq!(vol2.cover_charge.as_deref(), Some("$5"));
        assert!(vol1.cover_charge.is_none());
    }

    #[tokio::test]
    async fn fresh_scrape_overrides_stale_manual_correction() {
        let (engine, storage, venue) = setup().await;
        // Manual source with the reserved highest-precedence number.
        let manual = snapshot(SourceType::Manual, 1, 1.0);
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);

        let mut corrected = scraped("Jazz Night", "https://venue.example/jazz");
        corrected.cover_charge = Some("$12 (corrected)".into());
        engine
            .merge_batch(storage.clone(), vec![corrected], &manual, &venue)
            .await
            .unwrap();

        // A scrape inside the staleness window loses despite repetition.
        let mut rescrape = scraped("Jazz Night", "https://bluemoon.example/jazz");
        rescrape.cover_charge = Some("$10".into());
        engine
            .merge_batch(storage.clone(), vec![rescrape.clone()], &scraper, &venue)
            .await
            .unwrap();
        let events = all_events(&storage, &venue).await;
        assert_eq!(events[0].cover_charge.as_deref(), Some("$12 (corrected)"));

        // Age the manual correction past the window, then rescrape.
        let mut event = events[0].clone();
        let owner = event.field_sources.get_mut("cover_charge").unwrap();
        owner.recorded_at = Utc::now() - Duration::days(30);
        storage
            .apply_merge_plan(MergePlan {
                source_id: manual.source_id,
                updated_events: vec![event],
                ..Default::default()
            })
            .await
            .unwrap();

        engine
            .merge_batch(storage.clone(), vec![rescrape], &scraper, &venue)
            .await
            .unwrap();
        let events = all_events(&storage, &venue).await;
        assert_eq!(events[0].cover_charge.as_deref(), Some("$10"));
    }

    #[tokio::test]
    async fn artists_are_created_pending_and_shared() {
        let (engine, storage, venue) = setup().await;
        let scraper = snapshot(SourceType::Scraper, 10, 0.9);
        let mut a = scraped("Nina Simone Tribute", "https://x.example/1");
        a.artists = vec!["Nina Simone".into()];
        let mut b = scraped("Late Night Jazz", "https://x.example/2");
        b.artists = vec!["Nina Simone".into(), "Gil Scott".into()];

        let outcome = engine
            .merge_batch(storage.clone(), vec![a, b], &scraper, &venue)
            .await
            .unwrap();
        assert_eq!(outcome.new_artists, 2);

        let artists = storage.list_artists().await.unwrap();
        assert_eq!(artists.len(), 2);
        assert!(artists
            .iter()
            .all(|artist| artist.spotify.status == crate::domain::MatchStatus::Pending));
    }
}
