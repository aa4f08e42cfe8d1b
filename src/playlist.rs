use crate::domain::{MatchNamespace, MatchStatus, Playlist};
use crate::error::{PipelineError, Result};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Provider-side playlist operations. Implemented by the Spotify client;
/// mocked in tests.
#[async_trait]
pub trait StreamingPlaylists: Send + Sync {
    /// The artist's most representative track, if the provider has one.
    async fn artist_top_track_uri(&self, spotify_artist_id: &str) -> Result<Option<String>>;
    async fn playlist_track_uris(&self, playlist_id: &str) -> Result<Vec<String>>;
    async fn replace_playlist_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PlaylistSyncResult {
    pub playlist_id: Uuid,
    pub playlist_name: String,
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

/// Rebuilds managed playlists from the catalog: one track per matched artist
/// with an upcoming show in the playlist's region, soonest show first.
/// Artists whose shows have all passed drop out on the next sync.
pub struct PlaylistSyncer {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn StreamingPlaylists>,
}

impl PlaylistSyncer {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<dyn StreamingPlaylists>) -> Self {
        Self { storage, provider }
    }

    #[instrument(skip(self))]
    pub async fn sync_playlist(&self, playlist_id: Uuid) -> Result<PlaylistSyncResult> {
        let playlist = self
            .storage
            .get_playlist(playlist_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("playlist {}", playlist_id)))?;
        if !playlist.enabled {
            return Err(PipelineError::Validation(format!(
                "playlist '{}' is disabled",
                playlist.name
            )));
        }
        self.sync_one(&playlist).await
    }

    /// Syncs every enabled playlist. One playlist's failure never blocks the
    /// rest; failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sync_all_playlists(&self) -> Result<Vec<PlaylistSyncResult>> {
        let playlists = self.storage.list_enabled_playlists().await?;
        info!("Syncing {} enabled playlists", playlists.len());

        let mut results = Vec::new();
        for playlist in &playlists {
            match self.sync_one(playlist).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    counter!("gigdex_playlist_sync_failures_total").increment(1);
                    warn!("Failed to sync playlist '{}': {}", playlist.name, e);
                }
            }
        }
        Ok(results)
    }

    async fn sync_one(&self, playlist: &Playlist) -> Result<PlaylistSyncResult> {
        let today = Utc::now().date_naive();
        let events = self
            .storage
            .list_upcoming_events_in_region(playlist.region_id, today)
            .await?;

        // Events arrive ordered by day; first appearance of an artist fixes
        // their slot, so the artist playing soonest leads the playlist.
        let mut seen = HashSet::new();
        let mut ordered_artist_ids = Vec::new();
        for event in &events {
            for artist_ref in &event.artist_ids {
                if seen.insert(artist_ref.id) {
                    ordered_artist_ids.push(artist_ref.id);
                }
            }
        }

        let mut desired_uris = Vec::new();
        for artist_id in ordered_artist_ids {
            if desired_uris.len() >= playlist.max_tracks {
                break;
            }
            let Some(artist) = self.storage.get_artist(artist_id).await? else {
                continue;
            };
            let spotify = artist.match_for(MatchNamespace::Spotify);
            if spotify.status != MatchStatus::Matched {
                continue;
            }
            let Some(spotify_id) = artist.spotify_id() else {
                continue;
            };
            match self.provider.artist_top_track_uri(spotify_id).await {
                Ok(Some(uri)) => desired_uris.push(uri),
                Ok(None) => {
                    info!("Artist '{}' has no top track, skipping", artist.name);
                }
                Err(e) => {
                    warn!("Top-track lookup failed for '{}': {}", artist.name, e);
                }
            }
        }

        let current_uris = self
            .provider
            .playlist_track_uris(&playlist.spotify_playlist_id)
            .await?;

        let current_set: HashSet<&String> = current_uris.iter().collect();
        let desired_set: HashSet<&String> = desired_uris.iter().collect();
        let added = desired_uris.iter().filter(|u| !current_set.contains(u)).count();
        let removed = current_uris.iter().filter(|u| !desired_set.contains(u)).count();

        if current_uris != desired_uris {
            self.provider
                .replace_playlist_tracks(&playlist.spotify_playlist_id, &desired_uris)
                .await?;
        }

        info!(
            "Playlist '{}': {} tracks ({} added, {} removed)",
            playlist.name,
            desired_uris.len(),
            added,
            removed
        );
        counter!("gigdex_playlist_tracks_added_total").increment(added as u64);
        counter!("gigdex_playlist_tracks_removed_total").increment(removed as u64);

        Ok(PlaylistSyncResult {
            playlist_id: playlist.id.unwrap_or_default(),
            playlist_name: playlist.name.clone(),
            added,
            removed,
            total: desired_uris.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Artist, Event, MatchStatus, ProvenancedId, Venue};
    use crate::merge::MergePlan;
    use crate::storage::InMemoryStorage;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubPlaylists {
        top_tracks: HashMap<String, String>,
        current: Mutex<Vec<String>>,
        replaced_with: Mutex<Option<Vec<String>>>,
    }

    impl StubPlaylists {
        fn new(current: Vec<&str>) -> Self {
            Self {
                top_tracks: HashMap::new(),
                current: Mutex::new(current.into_iter().map(String::from).collect()),
                replaced_with: Mutex::new(None),
            }
        }

        fn top_track(mut self, spotify_artist_id: &str, uri: &str) -> Self {
            self.top_tracks
                .insert(spotify_artist_id.to_string(), uri.to_string());
            self
        }
    }

    #[async_trait]
    impl StreamingPlaylists for StubPlaylists {
        async fn artist_top_track_uri(&self, spotify_artist_id: &str) -> Result<Option<String>> {
            Ok(self.top_tracks.get(spotify_artist_id).cloned())
        }

        async fn playlist_track_uris(&self, _playlist_id: &str) -> Result<Vec<String>> {
            Ok(self.current.lock().unwrap().clone())
        }

        async fn replace_playlist_tracks(
            &self,
            _playlist_id: &str,
            uris: &[String],
        ) -> Result<()> {
            *self.replaced_with.lock().unwrap() = Some(uris.to_vec());
            Ok(())
        }
    }

    fn matched_artist(name: &str, spotify_id: &str) -> Artist {
        let mut artist = Artist::new(name);
        artist.id = Some(Uuid::new_v4());
        let m = artist.match_for_mut(MatchNamespace::Spotify);
        m.status = MatchStatus::Matched;
        m.external_id = Some(spotify_id.to_string());
        m.matched_at = Some(Utc::now());
        artist
    }

    fn event_on(venue: &Venue, title: &str, days_ahead: i64, artists: &[&Artist]) -> Event {
        let now = Utc::now();
        Event {
            id: Some(Uuid::new_v4()),
            title: title.to_string(),
            venue_id: venue.id.unwrap(),
            region_id: venue.region_id,
            event_day: (now + Duration::days(days_ahead)).date_naive(),
            start_time: None,
            source_url: Some(format!("https://venue.example/{}", crate::domain::slugify(title))),
            description: None,
            cover_charge: None,
            image_url: None,
            doors_time: None,
            end_time: None,
            ticket_url: None,
            age_restriction: None,
            genres: Vec::new(),
            artist_ids: artists
                .iter()
                .map(|a| ProvenancedId {
                    id: a.id.unwrap(),
                    source_id: Uuid::new_v4(),
                })
                .collect(),
            field_sources: HashMap::new(),
            attendance_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed_catalog(
        storage: &Arc<InMemoryStorage>,
        artists: Vec<Artist>,
        events: Vec<Event>,
    ) {
        storage
            .apply_merge_plan(MergePlan {
                source_id: Uuid::new_v4(),
                new_artists: artists,
                new_events: events,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    async fn seed_playlist(storage: &Arc<InMemoryStorage>, region_id: Uuid, max_tracks: usize) -> Playlist {
        let mut playlist = Playlist {
            id: None,
            name: "Live This Month".to_string(),
            spotify_playlist_id: "pl-1".to_string(),
            region_id,
            enabled: true,
            max_tracks,
        };
        storage.create_playlist(&mut playlist).await.unwrap();
        playlist
    }

    async fn seed_venue(storage: &Arc<InMemoryStorage>, region_id: Uuid) -> Venue {
        let mut venue = Venue::new("The Crocodile", region_id, "America/Los_Angeles");
        storage.create_venue(&mut venue).await.unwrap();
        venue
    }

    #[tokio::test]
    async fn orders_artists_by_soonest_show() {
        let storage = Arc::new(InMemoryStorage::new());
        let region_id = Uuid::new_v4();
        let venue = seed_venue(&storage, region_id).await;

        let later = matched_artist("Later Act", "sp-later");
        let sooner = matched_artist("Sooner Act", "sp-sooner");
        let events = vec![
            event_on(&venue, "Later Act Live", 10, &[&later]),
            event_on(&venue, "Sooner Act Live", 2, &[&sooner]),
        ];
        seed_catalog(&storage, vec![later, sooner], events).await;
        let playlist = seed_playlist(&storage, region_id, 50).await;

        let provider = Arc::new(
            StubPlaylists::new(vec![])
                .top_track("sp-later", "spotify:track:later")
                .top_track("sp-sooner", "spotify:track:sooner"),
        );
        let syncer = PlaylistSyncer::new(storage, provider.clone());

        let result = syncer.sync_playlist(playlist.id.unwrap()).await.unwrap();
        assert_eq!(result.added, 2);
        assert_eq!(result.total, 2);
        let replaced = provider.replaced_with.lock().unwrap().clone().unwrap();
        assert_eq!(replaced, vec!["spotify:track:sooner", "spotify:track:later"]);
    }

    #[tokio::test]
    async fn unmatched_artists_are_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        let region_id = Uuid::new_v4();
        let venue = seed_venue(&storage, region_id).await;

        let matched = matched_artist("Matched Act", "sp-m");
        let mut pending = Artist::new("Pending Act");
        pending.id = Some(Uuid::new_v4());
        let events = vec![event_on(&venue, "Double Bill", 3, &[&pending, &matched])];
        seed_catalog(&storage, vec![matched, pending], events).await;
        let playlist = seed_playlist(&storage, region_id, 50).await;

        let provider =
            Arc::new(StubPlaylists::new(vec![]).top_track("sp-m", "spotify:track:m"));
        let syncer = PlaylistSyncer::new(storage, provider.clone());

        let result = syncer.sync_playlist(playlist.id.unwrap()).await.unwrap();
        assert_eq!(result.total, 1);
        let replaced = provider.replaced_with.lock().unwrap().clone().unwrap();
        assert_eq!(replaced, vec!["spotify:track:m"]);
    }

    #[tokio::test]
    async fn artists_with_no_upcoming_shows_drop_off() {
        let storage = Arc::new(InMemoryStorage::new());
        let region_id = Uuid::new_v4();
        let venue = seed_venue(&storage, region_id).await;

        let current = matched_artist("Still Touring", "sp-current");
        let events = vec![event_on(&venue, "Still Touring Live", 5, &[&current])];
        seed_catalog(&storage, vec![current], events).await;
        let playlist = seed_playlist(&storage, region_id, 50).await;

        // The provider playlist still holds a track from an act whose show
        // has already passed.
        let provider = Arc::new(
            StubPlaylists::new(vec!["spotify:track:passed"])
                .top_track("sp-current", "spotify:track:current"),
        );
        let syncer = PlaylistSyncer::new(storage, provider.clone());

        let result = syncer.sync_playlist(playlist.id.unwrap()).await.unwrap();
        assert_eq!(result.added, 1);
        assert_eq!(result.removed, 1);
        assert_eq!(result.total, 1);
        let replaced = provider.replaced_with.lock().unwrap().clone().unwrap();
        assert_eq!(replaced, vec!["spotify:track:current"]);
    }

    #[tokio::test]
    async fn max_tracks_caps_the_playlist() {
        let storage = Arc::new(InMemoryStorage::new());
        let region_id = Uuid::new_v4();
        let venue = seed_venue(&storage, region_id).await;

        let a = matched_artist("First", "sp-a");
        let b = matched_artist("Second", "sp-b");
        let c = matched_artist("Third", "sp-c");
        let events = vec![
            event_on(&venue, "First Live", 1, &[&a]),
            event_on(&venue, "Second Live", 2, &[&b]),
            event_on(&venue, "Third Live", 3, &[&c]),
        ];
        seed_catalog(&storage, vec![a, b, c], events).await;
        let playlist = seed_playlist(&storage, region_id, 2).await;

        let provider = Arc::new(
            StubPlaylists::new(vec![])
                .top_track("sp-a", "spotify:track:a")
                .top_track("sp-b", "spotify:track:b")
                .top_track("sp-c", "spotify:track:c"),
        );
        let syncer = PlaylistSyncer::new(storage, provider.clone());

        let result = syncer.sync_playlist(playlist.id.unwrap()).await.unwrap();
        assert_eq!(result.total, 2);
        let replaced = provider.replaced_with.lock().unwrap().clone().unwrap();
        assert_eq!(replaced, vec!["spotify:track:a", "spotify:track:b"]);
    }

    #[tokio::test]
    async fn unchanged_playlist_skips_the_provider_write() {
        let storage = Arc::new(InMemoryStorage::new());
        let region_id = Uuid::new_v4();
        let venue = seed_venue(&storage, region_id).await;

        let artist = matched_artist("Steady Act", "sp-s");
        let events = vec![event_on(&venue, "Steady Act Live", 4, &[&artist])];
        seed_catalog(&storage, vec![artist], events).await;
        let playlist = seed_playlist(&storage, region_id, 50).await;

        let provider = Arc::new(
            StubPlaylists::new(vec!["spotify:track:s"]).top_track("sp-s", "spotify:track:s"),
        );
        let syncer = PlaylistSyncer::new(storage, provider.clone());

        let result = syncer.sync_playlist(playlist.id.unwrap()).await.unwrap();
        assert_eq!(result.added, 0);
        assert_eq!(result.removed, 0);
        assert!(provider.replaced_with.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_all_covers_only_enabled_playlists() {
        let storage = Arc::new(InMemoryStorage::new());
        let region_id = Uuid::new_v4();
        seed_venue(&storage, region_id).await;
        seed_playlist(&storage, region_id, 50).await;

        let mut disabled = Playlist {
            id: None,
            name: "Paused".to_string(),
            spotify_playlist_id: "pl-paused".to_string(),
            region_id,
            enabled: false,
            max_tracks: 50,
        };
        storage.create_playlist(&mut disabled).await.unwrap();

        let provider = Arc::new(StubPlaylists::new(vec![]));
        let syncer = PlaylistSyncer::new(storage, provider);

        let results = syncer.sync_all_playlists().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].playlist_name, "Live This Month");
    }
}
