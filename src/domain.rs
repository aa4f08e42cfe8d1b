use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where a source's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Scraper,
    Manual,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceCategory {
    Venue,
    Artist,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failed,
}

/// A configured origin of event data: one venue's scraper, a manual-entry
/// queue, or an artist's own site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub source_type: SourceType,
    pub category: SourceCategory,
    /// Lower number wins field conflicts during merge.
    pub priority: i32,
    /// 0.0–1.0, breaks priority ties; never overrides priority ordering.
    pub trust_score: f64,
    pub is_active: bool,
    /// Opaque configuration handed to the scraper runtime (target URL etc).
    pub config: serde_json::Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
}

/// Arguments for onboarding a source.
#[derive(Debug, Clone)]
pub struct SourceArgs {
    pub name: String,
    pub source_type: SourceType,
    pub category: SourceCategory,
    pub priority: i32,
    pub trust_score: f64,
    pub config: serde_json::Value,
}

impl Source {
    pub fn new(args: SourceArgs) -> Self {
        let slug = slugify(&args.name);
        Self {
            id: None,
            name: args.name,
            slug,
            source_type: args.source_type,
            category: args.category,
            priority: args.priority,
            trust_score: args.trust_score.clamp(0.0, 1.0),
            is_active: true,
            config: args.config,
            last_run_at: None,
            last_run_status: None,
            created_at: Utc::now(),
        }
    }

    /// Snapshot used by the merge engine so conflict decisions are
    /// reproducible from their inputs alone.
    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            source_id: self.id.unwrap_or_default(),
            slug: self.slug.clone(),
            source_type: self.source_type,
            priority: self.priority,
            trust_score: self.trust_score,
        }
    }
}

/// Immutable view of the merge-relevant parts of a source.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub source_id: Uuid,
    pub slug: String,
    pub source_type: SourceType,
    pub priority: i32,
    pub trust_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOrigin {
    AiGenerated,
    ManualEdit,
    Rollback,
}

/// An immutable, numbered snapshot of the executable logic a source uses to
/// produce events. Code never changes after creation; only test and
/// activation metadata do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperVersion {
    pub id: Option<Uuid>,
    pub source_id: Uuid,
    /// 1-based, strictly increasing per source.
    pub version_number: u32,
    pub code: String,
    /// sha256 of the code, used to detect no-op edits.
    pub code_hash: String,
    pub origin: VersionOrigin,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub test_results: Option<TestResults>,
}

/// Outcome of running a version against its live target or a fixture.
/// Recorded on every test run, pass or fail. Production runs never write
/// these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub event_count: usize,
    pub sample_events: Vec<ScrapedEvent>,
    pub fields_analysis: FieldsAnalysis,
    pub warnings: Vec<String>,
}

/// Per-field coverage over a test run's output, split into the fields a
/// usable scraper must produce and the nice-to-haves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldsAnalysis {
    pub required: HashMap<String, FieldCoverage>,
    pub optional: HashMap<String, FieldCoverage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldCoverage {
    pub count: usize,
    pub percent: f64,
}

/// One observation of an event as reported by one source in one run,
/// prior to merging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedEvent {
    pub title: String,
    pub event_day: Option<NaiveDate>,
    /// None means the source reported no start time. A raw timestamp of
    /// exactly 00:00 normalizes to None.
    pub start_time: Option<NaiveTime>,
    /// Natural external key within a source.
    pub source_url: String,
    pub description: Option<String>,
    pub cover_charge: Option<String>,
    pub image_url: Option<String>,
    pub doors_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub ticket_url: Option<String>,
    pub genres: Vec<String>,
    pub artists: Vec<String>,
    pub age_restriction: Option<String>,
}

/// Which source last won a field, and with what rank, so later observations
/// can be arbitrated without re-reading the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub source_id: Uuid,
    pub source_type: SourceType,
    pub priority: i32,
    pub trust_score: f64,
    pub recorded_at: DateTime<Utc>,
}

/// A list item (genre tag, artist link) with the source that contributed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenancedTag {
    pub value: String,
    pub source_id: Uuid,
}

/// The single reconciled record for a real-world event, after merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<Uuid>,
    pub title: String,
    pub venue_id: Uuid,
    /// Denormalized from the venue for query performance. Invariant:
    /// always equals venue.region_id; backfill_event_regions repairs drift.
    pub region_id: Uuid,
    pub event_day: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub source_url: Option<String>,
    pub description: Option<String>,
    pub cover_charge: Option<String>,
    pub image_url: Option<String>,
    pub doors_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub ticket_url: Option<String>,
    pub age_restriction: Option<String>,
    pub genres: Vec<ProvenancedTag>,
    pub artist_ids: Vec<ProvenancedId>,
    /// Winning source per scalar field, keyed by field name.
    pub field_sources: HashMap<String, FieldProvenance>,
    pub attendance_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenancedId {
    pub id: Uuid,
    pub source_id: Uuid,
}

/// One external catalog space, tracked independently per artist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchNamespace {
    Spotify,
    MusicBrainz,
}

impl MatchNamespace {
    pub const ALL: [MatchNamespace; 2] = [MatchNamespace::Spotify, MatchNamespace::MusicBrainz];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchNamespace::Spotify => "spotify",
            MatchNamespace::MusicBrainz => "musicbrainz",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Pending,
    Matched,
    NoMatch,
}

/// Match state for one artist in one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistMatch {
    pub status: MatchStatus,
    pub external_id: Option<String>,
    /// Canonical name as the external catalog spells it.
    pub canonical_name: Option<String>,
    pub genre_count: usize,
    pub popularity: Option<u32>,
    pub matched_at: Option<DateTime<Utc>>,
}

impl Default for ArtistMatch {
    fn default() -> Self {
        Self {
            status: MatchStatus::Pending,
            external_id: None,
            canonical_name: None,
            genre_count: 0,
            popularity: None,
            matched_at: None,
        }
    }
}

/// A performer. Created in Pending for both namespaces when first referenced
/// by an ingested event; lifetime is catalog-wide, not tied to any event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artist {
    pub id: Option<Uuid>,
    pub name: String,
    pub name_slug: String,
    pub spotify: ArtistMatch,
    pub musicbrainz: ArtistMatch,
    pub genres: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Artist {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            name_slug: slugify(name),
            spotify: ArtistMatch::default(),
            musicbrainz: ArtistMatch::default(),
            genres: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn match_for(&self, namespace: MatchNamespace) -> &ArtistMatch {
        match namespace {
            MatchNamespace::Spotify => &self.spotify,
            MatchNamespace::MusicBrainz => &self.musicbrainz,
        }
    }

    pub fn match_for_mut(&mut self, namespace: MatchNamespace) -> &mut ArtistMatch {
        match namespace {
            MatchNamespace::Spotify => &mut self.spotify,
            MatchNamespace::MusicBrainz => &mut self.musicbrainz,
        }
    }

    /// Durable external id, mirrored out of the namespace match state.
    pub fn spotify_id(&self) -> Option<&str> {
        self.spotify.external_id.as_deref()
    }

    pub fn musicbrainz_id(&self) -> Option<&str> {
        self.musicbrainz.external_id.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub region_id: Uuid,
    /// IANA timezone name for date-window dedup.
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

impl Venue {
    pub fn new(name: &str, region_id: Uuid, timezone: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            slug: slugify(name),
            region_id,
            timezone: timezone.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A managed streaming playlist kept in step with upcoming shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: Option<Uuid>,
    pub name: String,
    pub spotify_playlist_id: String,
    pub region_id: Uuid,
    pub enabled: bool,
    pub max_tracks: usize,
}

/// Lowercase, alphanumeric, hyphen-separated slug.
pub fn slugify(input: &str) -> String {
    let lower = input.to_lowercase();
    let mut slug = String::with_capacity(lower.len());
    let mut last_was_sep = true;
    for c in lower.chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('-');
            last_was_sep = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}
