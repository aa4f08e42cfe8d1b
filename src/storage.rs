use crate::domain::*;
use crate::error::{PipelineError, Result};
use crate::merge::MergePlan;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Storage trait for the canonical catalog: sources, scraper versions,
/// venues, artists, events, playlists.
#[async_trait]
pub trait Storage: Send + Sync {
    // Source operations
    async fn create_source(&self, source: &mut Source) -> Result<()>;
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>>;
    async fn get_source_by_slug(&self, slug: &str) -> Result<Option<Source>>;
    async fn list_sources(&self) -> Result<Vec<Source>>;
    async fn set_source_active(&self, id: Uuid, is_active: bool) -> Result<()>;
    async fn record_source_run(
        &self,
        id: Uuid,
        status: RunStatus,
        ran_at: DateTime<Utc>,
    ) -> Result<()>;

    // Scraper version operations
    /// Persists a new version and assigns it the next version number for
    /// its source, atomically, so concurrent creates never mint duplicates.
    async fn create_version(&self, version: &mut ScraperVersion) -> Result<()>;
    async fn get_version(&self, id: Uuid) -> Result<Option<ScraperVersion>>;
    async fn get_active_version(&self, source_id: Uuid) -> Result<Option<ScraperVersion>>;
    /// Versions for a source in ascending version-number order.
    async fn list_versions(&self, source_id: Uuid) -> Result<Vec<ScraperVersion>>;
    /// Activates one version and deactivates all siblings in one transition.
    async fn set_active_version(&self, source_id: Uuid, version_id: Uuid) -> Result<()>;
    async fn record_test_results(
        &self,
        version_id: Uuid,
        results: TestResults,
        tested_at: DateTime<Utc>,
    ) -> Result<()>;

    // Venue operations
    async fn create_venue(&self, venue: &mut Venue) -> Result<()>;
    async fn get_venue(&self, id: Uuid) -> Result<Option<Venue>>;
    async fn get_venue_by_name(&self, name: &str) -> Result<Option<Venue>>;

    // Artist operations
    async fn get_artist(&self, id: Uuid) -> Result<Option<Artist>>;
    async fn get_artist_by_slug(&self, slug: &str) -> Result<Option<Artist>>;
    /// Pending artists for a namespace, oldest first, stable order.
    async fn list_pending_artists(
        &self,
        namespace: MatchNamespace,
        limit: usize,
    ) -> Result<Vec<Artist>>;
    async fn list_artists(&self) -> Result<Vec<Artist>>;
    async fn update_artist(&self, artist: &Artist) -> Result<()>;

    // Event operations
    async fn get_event(&self, id: Uuid) -> Result<Option<Event>>;
    /// Dedup candidates: events at a venue within an inclusive day range.
    async fn find_events_by_venue_dates(
        &self,
        venue_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Event>>;
    async fn list_upcoming_events_in_region(
        &self,
        region_id: Uuid,
        after: NaiveDate,
    ) -> Result<Vec<Event>>;
    /// Applies a whole merge plan atomically: either every new and updated
    /// record commits or none do.
    async fn apply_merge_plan(&self, plan: MergePlan) -> Result<()>;
    /// Repairs events whose region_id drifted from their venue's.
    async fn backfill_event_regions(&self) -> Result<usize>;

    // Playlist operations
    async fn create_playlist(&self, playlist: &mut Playlist) -> Result<()>;
    async fn get_playlist(&self, id: Uuid) -> Result<Option<Playlist>>;
    async fn list_enabled_playlists(&self) -> Result<Vec<Playlist>>;
}

#[derive(Default)]
struct CatalogState {
    sources: HashMap<Uuid, Source>,
    versions: HashMap<Uuid, ScraperVersion>,
    venues: HashMap<Uuid, Venue>,
    artists: HashMap<Uuid, Artist>,
    events: HashMap<Uuid, Event>,
    playlists: HashMap<Uuid, Playlist>,
}

/// In-memory storage implementation for development/testing. All state sits
/// behind one mutex so a merge plan commits as a unit.
pub struct InMemoryStorage {
    state: Arc<Mutex<CatalogState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CatalogState::default())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_source(&self, source: &mut Source) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.sources.values().any(|s| s.slug == source.slug) {
            return Err(PipelineError::Validation(format!(
                "source slug '{}' already exists",
                source.slug
            )));
        }
        let id = Uuid::new_v4();
        source.id = Some(id);
        state.sources.insert(id, source.clone());
        debug!("Created source: {} with id {}", source.slug, id);
        Ok(())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        Ok(self.state.lock().unwrap().sources.get(&id).cloned())
    }

    async fn get_source_by_slug(&self, slug: &str) -> Result<Option<Source>> {
        let state = self.state.lock().unwrap();
        Ok(state.sources.values().find(|s| s.slug == slug).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let state = self.state.lock().unwrap();
        let mut sources: Vec<Source> = state.sources.values().cloned().collect();
        sources.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(sources)
    }

    async fn set_source_active(&self, id: Uuid, is_active: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let source = state
            .sources
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("source {}", id)))?;
        source.is_active = is_active;
        Ok(())
    }

    async fn record_source_run(
        &self,
        id: Uuid,
        status: RunStatus,
        ran_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let source = state
            .sources
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("source {}", id)))?;
        source.last_run_at = Some(ran_at);
        source.last_run_status = Some(status);
        debug!("Recorded {:?} run for source {}", status, source.slug);
        Ok(())
    }

    async fn create_version(&self, version: &mut ScraperVersion) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        version.version_number = state
            .versions
            .values()
            .filter(|v| v.source_id == version.source_id)
            .map(|v| v.version_number)
            .max()
            .map_or(1, |n| n + 1);
        let id = Uuid::new_v4();
        version.id = Some(id);
        state.versions.insert(id, version.clone());
        debug!(
            "Created version {} for source {}",
            version.version_number, version.source_id
        );
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<ScraperVersion>> {
        Ok(self.state.lock().unwrap().versions.get(&id).cloned())
    }

    async fn get_active_version(&self, source_id: Uuid) -> Result<Option<ScraperVersion>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .versions
            .values()
            .find(|v| v.source_id == source_id && v.is_active)
            .cloned())
    }

    async fn list_versions(&self, source_id: Uuid) -> Result<Vec<ScraperVersion>> {
        let state = self.state.lock().unwrap();
        let mut versions: Vec<ScraperVersion> = state
            .versions
            .values()
            .filter(|v| v.source_id == source_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn set_active_version(&self, source_id: Uuid, version_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state
            .versions
            .get(&version_id)
            .is_some_and(|v| v.source_id == source_id)
        {
            return Err(PipelineError::NotFound(format!(
                "version {} for source {}",
                version_id, source_id
            )));
        }
        // Single pass under the lock keeps "at most one active" observable.
        for version in state.versions.values_mut() {
            if version.source_id == source_id {
                version.is_active = version.id == Some(version_id);
            }
        }
        debug!("Activated version {} for source {}", version_id, source_id);
        Ok(())
    }

    async fn record_test_results(
        &self,
        version_id: Uuid,
        results: TestResults,
        tested_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state
            .versions
            .get_mut(&version_id)
            .ok_or_else(|| PipelineError::NotFound(format!("version {}", version_id)))?;
        version.last_tested_at = Some(tested_at);
        version.test_results = Some(results);
        Ok(())
    }

    async fn create_venue(&self, venue: &mut Venue) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = Uuid::new_v4();
        venue.id = Some(id);
        state.venues.insert(id, venue.clone());
        debug!("Created venue: {} with id {}", venue.name, id);
        Ok(())
    }

    async fn get_venue(&self, id: Uuid) -> Result<Option<Venue>> {
        Ok(self.state.lock().unwrap().venues.get(&id).cloned())
    }

    async fn get_venue_by_name(&self, name: &str) -> Result<Option<Venue>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .venues
            .values()
            .find(|v| v.name.to_lowercase() == name.to_lowercase())
            .cloned())
    }

    async fn get_artist(&self, id: Uuid) -> Result<Option<Artist>> {
        Ok(self.state.lock().unwrap().artists.get(&id).cloned())
    }

    async fn get_artist_by_slug(&self, slug: &str) -> Result<Option<Artist>> {
        let state = self.state.lock().unwrap();
        Ok(state.artists.values().find(|a| a.name_slug == slug).cloned())
    }

    async fn list_pending_artists(
        &self,
        namespace: MatchNamespace,
        limit: usize,
    ) -> Result<Vec<Artist>> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<Artist> = state
            .artists
            .values()
            .filter(|a| a.match_for(namespace).status == MatchStatus::Pending)
            .cloned()
            .collect();
        // Oldest first; slug tie-break keeps batches reproducible.
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name_slug.cmp(&b.name_slug))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_artists(&self) -> Result<Vec<Artist>> {
        Ok(self.state.lock().unwrap().artists.values().cloned().collect())
    }

    async fn update_artist(&self, artist: &Artist) -> Result<()> {
        let artist_id = artist
            .id
            .ok_or_else(|| PipelineError::Validation("cannot update artist without id".into()))?;
        let mut state = self.state.lock().unwrap();
        if !state.artists.contains_key(&artist_id) {
            return Err(PipelineError::NotFound(format!("artist {}", artist_id)));
        }
        state.artists.insert(artist_id, artist.clone());
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.state.lock().unwrap().events.get(&id).cloned())
    }

    async fn find_events_by_venue_dates(
        &self,
        venue_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Event>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.venue_id == venue_id && e.event_day >= from && e.event_day <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_day);
        Ok(events)
    }

    async fn list_upcoming_events_in_region(
        &self,
        region_id: Uuid,
        after: NaiveDate,
    ) -> Result<Vec<Event>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.region_id == region_id && e.event_day >= after)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.event_day, e.start_time));
        Ok(events)
    }

    async fn apply_merge_plan(&self, plan: MergePlan) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        // Validate before touching anything so a bad plan commits nothing.
        for event in &plan.updated_events {
            let id = event.id.ok_or_else(|| {
                PipelineError::Validation("merge plan update without event id".into())
            })?;
            if !state.events.contains_key(&id) {
                return Err(PipelineError::NotFound(format!("event {}", id)));
            }
        }
        for event in plan.new_events.iter().chain(plan.updated_events.iter()) {
            if event.id.is_none() {
                return Err(PipelineError::Validation(
                    "merge plan event without pre-assigned id".into(),
                ));
            }
        }
        for artist in &plan.new_artists {
            if artist.id.is_none() {
                return Err(PipelineError::Validation(
                    "merge plan artist without pre-assigned id".into(),
                ));
            }
        }

        for artist in plan.new_artists {
            state.artists.insert(artist.id.unwrap(), artist);
        }
        for event in plan.new_events {
            state.events.insert(event.id.unwrap(), event);
        }
        for event in plan.updated_events {
            state.events.insert(event.id.unwrap(), event);
        }
        Ok(())
    }

    async fn backfill_event_regions(&self) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let venue_regions: HashMap<Uuid, Uuid> = state
            .venues
            .values()
            .filter_map(|v| v.id.map(|id| (id, v.region_id)))
            .collect();
        let mut repaired = 0;
        for event in state.events.values_mut() {
            if let Some(&region_id) = venue_regions.get(&event.venue_id) {
                if event.region_id != region_id {
                    event.region_id = region_id;
                    repaired += 1;
                }
            }
        }
        if repaired > 0 {
            debug!("Backfilled region_id on {} events", repaired);
        }
        Ok(repaired)
    }

    async fn create_playlist(&self, playlist: &mut Playlist) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = Uuid::new_v4();
        playlist.id = Some(id);
        state.playlists.insert(id, playlist.clone());
        Ok(())
    }

    async fn get_playlist(&self, id: Uuid) -> Result<Option<Playlist>> {
        Ok(self.state.lock().unwrap().playlists.get(&id).cloned())
    }

    async fn list_enabled_playlists(&self) -> Result<Vec<Playlist>> {
        let state = self.state.lock().unwrap();
        let mut playlists: Vec<Playlist> = state
            .playlists
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        playlists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playlists)
    }
}
