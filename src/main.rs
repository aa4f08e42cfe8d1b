use clap::{Parser, Subcommand};
use tracing::info;

use chrono::{Duration as ChronoDuration, Utc};
use gigdex::config::Config;
use gigdex::domain::{
    slugify, MatchNamespace, Playlist, ScraperVersion, Source, SourceArgs, SourceCategory,
    SourceType, VersionOrigin,
};
use gigdex::error::{PipelineError, Result};
use gigdex::ingest::IngestionCoordinator;
use gigdex::locks::SourceLocks;
use gigdex::merge::MergeEngine;
use gigdex::playlist::PlaylistSyncer;
use gigdex::resolver::{IdentityResolver, MusicBrainzCatalog, SpotifyCatalog};
use gigdex::scraper::{FixtureRuntime, ScraperRuntime};
use gigdex::storage::{InMemoryStorage, Storage};
use gigdex::versions::VersionManager;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

// Storage is in-memory, so every run seeds the same demo source and region.
const DEMO_REGION_ID: &str = "7b1f3c2e-9a64-4a0d-8f21-5c3de1a90b47";

#[derive(Parser)]
#[command(name = "gigdex")]
#[command(about = "Regional live-event catalog pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the demo source and merge its events into the catalog
    Ingest,
    /// Manage scraper versions for the demo source
    Version {
        #[command(subcommand)]
        action: VersionAction,
    },
    /// Match pending artists against an external catalog
    MatchArtists {
        /// Catalog namespace: spotify or musicbrainz
        #[arg(long, default_value = "musicbrainz")]
        namespace: String,
        /// Maximum artists to process in this run
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Operator overrides for a single artist's match state
    Artist {
        #[command(subcommand)]
        action: ArtistAction,
    },
    /// Print artist match state per namespace
    Stats,
    /// Rebuild enabled playlists from upcoming shows
    SyncPlaylists,
    /// Repair events whose region drifted from their venue's
    BackfillRegions,
}

#[derive(Subcommand)]
enum VersionAction {
    /// Draft a new version from a fixture payload file
    Create {
        code_file: PathBuf,
        /// Where the code came from: ai or manual
        #[arg(long, default_value = "manual")]
        origin: String,
        #[arg(long)]
        description: Option<String>,
        /// Activate immediately after creating
        #[arg(long)]
        activate: bool,
    },
    /// Run a version against its fixture and report field coverage
    Test {
        /// Version number to test; defaults to the active version
        #[arg(long)]
        version: Option<u32>,
    },
    /// Make a version the one ingestion runs
    Activate { version: u32 },
    /// Reissue an old version's code as a new active version
    Rollback { to: u32 },
    /// Show the version history
    List,
}

#[derive(Subcommand)]
enum ArtistAction {
    /// Force a match to a specific external id
    Match {
        name: String,
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        external_id: String,
    },
    /// Mark the artist as having no counterpart in the namespace
    NoMatch {
        name: String,
        #[arg(long)]
        namespace: String,
    },
    /// Return the artist to the automated matching queue
    Reset {
        name: String,
        #[arg(long)]
        namespace: String,
    },
}

struct App {
    storage: Arc<dyn Storage>,
    runtime: Arc<dyn ScraperRuntime>,
    locks: SourceLocks,
    config: Config,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            runtime: Arc::new(FixtureRuntime),
            locks: SourceLocks::new(),
            config,
        }
    }

    fn version_manager(&self) -> VersionManager {
        VersionManager::new(
            self.storage.clone(),
            self.runtime.clone(),
            self.locks.clone(),
            self.config.scraping.clone(),
        )
    }

    fn coordinator(&self) -> IngestionCoordinator {
        IngestionCoordinator::new(
            self.storage.clone(),
            self.runtime.clone(),
            MergeEngine::new(self.config.merge.clone()),
            self.locks.clone(),
            self.config.scraping.clone(),
        )
    }

    fn resolver(&self) -> Result<IdentityResolver> {
        let mut resolver = IdentityResolver::new(self.storage.clone(), self.config.matching.clone())
            .with_catalog(Arc::new(MusicBrainzCatalog::new(&self.config.matching)?));
        match SpotifyCatalog::from_env(&self.config.matching) {
            Ok(spotify) => resolver = resolver.with_catalog(Arc::new(spotify)),
            Err(e) => info!("Spotify catalog unavailable: {}", e),
        }
        Ok(resolver)
    }

    /// Seeds the demo source with an active fixture version so the other
    /// commands have something to operate on.
    async fn bootstrap(&self) -> Result<Source> {
        let mut source = Source::new(SourceArgs {
            name: "Demo Ballroom".to_string(),
            source_type: SourceType::Scraper,
            category: SourceCategory::Venue,
            priority: 10,
            trust_score: 0.8,
            config: json!({
                "venue_name": "Demo Ballroom",
                "region_id": DEMO_REGION_ID,
                "timezone": "America/Los_Angeles",
            }),
        });
        self.storage.create_source(&mut source).await?;
        let source_id = source.id.ok_or_else(|| {
            PipelineError::Validation("source id missing after create".into())
        })?;

        let manager = self.version_manager();
        let version = manager
            .create_version(
                source_id,
                demo_fixture(),
                VersionOrigin::ManualEdit,
                Some("seeded demo scraper".to_string()),
            )
            .await?;
        let version_id = version.id.ok_or_else(|| {
            PipelineError::Validation("version id missing after create".into())
        })?;
        manager.activate_version(source_id, version_id).await?;
        self.require_source(source_id).await
    }

    async fn require_source(&self, source_id: Uuid) -> Result<Source> {
        self.storage
            .get_source(source_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("source {}", source_id)))
    }

    async fn ingest_demo(&self) -> Result<Uuid> {
        let source = self.bootstrap().await?;
        let source_id = source.id.unwrap_or_default();
        let outcome = self.coordinator().run_ingestion(source_id).await?;

        println!("\n📊 Ingestion results for {}:", source.slug);
        println!("   Run status: {:?}", outcome.run_status);
        println!("   Events scraped: {}", outcome.events_scraped);
        if let Some(merge) = &outcome.merge {
            println!("   Created: {}", merge.created);
            println!("   Updated: {}", merge.updated);
            println!("   Unchanged: {}", merge.unchanged);
            println!("   Dropped: {}", merge.dropped);
            println!("   New artists: {}", merge.new_artists);
            if !merge.warnings.is_empty() {
                println!("\n⚠️  Warnings:");
                for warning in &merge.warnings {
                    println!("   - {}", warning);
                }
            }
        }
        if let Some(error) = &outcome.error {
            println!("   Error: {}", error);
        }
        Ok(source_id)
    }
}

/// Fixture payload standing in for a real scraper run: two upcoming shows
/// at the demo venue.
fn demo_fixture() -> String {
    let soon = (Utc::now() + ChronoDuration::days(3)).date_naive();
    let later = (Utc::now() + ChronoDuration::days(9)).date_naive();
    json!({
        "events": [
            {
                "title": "Silver Echoes with The Night Owls",
                "starts_at": format!("{}T20:00:00", soon),
                "source_url": "https://demoballroom.example/events/silver-echoes",
                "cover_charge": "$15",
                "genres": ["Indie Rock"],
                "artists": ["Silver Echoes", "The Night Owls"]
            },
            {
                "title": "Marisol Vega Quartet",
                "starts_at": format!("{}T19:30:00", later),
                "source_url": "https://demoballroom.example/events/marisol-vega",
                "ticket_url": "https://tickets.example/marisol-vega",
                "genres": ["Jazz"],
                "artists": ["Marisol Vega"]
            }
        ]
    })
    .to_string()
}

fn parse_namespace(value: &str) -> Result<MatchNamespace> {
    match value.to_lowercase().as_str() {
        "spotify" => Ok(MatchNamespace::Spotify),
        "musicbrainz" => Ok(MatchNamespace::MusicBrainz),
        other => Err(PipelineError::Validation(format!(
            "unknown namespace '{}', expected spotify or musicbrainz",
            other
        ))),
    }
}

fn parse_origin(value: &str) -> Result<VersionOrigin> {
    match value.to_lowercase().as_str() {
        "ai" => Ok(VersionOrigin::AiGenerated),
        "manual" => Ok(VersionOrigin::ManualEdit),
        other => Err(PipelineError::Validation(format!(
            "unknown origin '{}', expected ai or manual",
            other
        ))),
    }
}

fn print_version(version: &ScraperVersion) {
    println!(
        "   v{} [{:?}]{} {} - {}",
        version.version_number,
        version.origin,
        if version.is_active { " (active)" } else { "" },
        &version.code_hash[..12],
        version.description.as_deref().unwrap_or("no description"),
    );
}

async fn run_version_action(app: &App, action: VersionAction) -> Result<()> {
    let source = app.bootstrap().await?;
    let source_id = source.id.unwrap_or_default();
    let manager = app.version_manager();

    match action {
        VersionAction::Create {
            code_file,
            origin,
            description,
            activate,
        } => {
            let code = std::fs::read_to_string(&code_file)?;
            let origin = parse_origin(&origin)?;
            let version = manager
                .create_version(source_id, code, origin, description)
                .await?;
            println!("✅ Created:");
            print_version(&version);
            if activate {
                manager
                    .activate_version(source_id, version.id.unwrap_or_default())
                    .await?;
                println!("✅ Activated v{}", version.version_number);
            }
        }
        VersionAction::Test { version } => {
            let versions = manager.list_versions(source_id).await?;
            let target = match version {
                Some(number) => versions.iter().find(|v| v.version_number == number),
                None => versions.iter().find(|v| v.is_active),
            }
            .ok_or_else(|| PipelineError::NotFound("no such version".into()))?;

            let results = manager
                .test_version(source_id, target.id.unwrap_or_default())
                .await?;
            println!("🧪 Test results for v{}:", target.version_number);
            println!("   Success: {}", results.success);
            println!("   Events: {}", results.event_count);
            println!("   Execution: {}ms", results.execution_time_ms);
            for (field, coverage) in &results.fields_analysis.required {
                println!("   {}: {} ({:.0}%)", field, coverage.count, coverage.percent);
            }
            for warning in &results.warnings {
                println!("   ⚠️  {}", warning);
            }
            if let Some(error) = &results.error {
                println!("   Error: {}", error);
            }
        }
        VersionAction::Activate { version } => {
            let versions = manager.list_versions(source_id).await?;
            let target = versions
                .iter()
                .find(|v| v.version_number == version)
                .ok_or_else(|| PipelineError::NotFound(format!("version {}", version)))?;
            manager
                .activate_version(source_id, target.id.unwrap_or_default())
                .await?;
            println!("✅ Activated v{}", version);
        }
        VersionAction::Rollback { to } => {
            let restored = manager.rollback(source_id, to).await?;
            println!("↩️  Rolled back to v{} as:", to);
            print_version(&restored);
        }
        VersionAction::List => {
            println!("📜 Version history for {}:", source.slug);
            for version in manager.list_versions(source_id).await? {
                print_version(&version);
            }
        }
    }
    Ok(())
}

async fn run_artist_action(app: &App, action: ArtistAction) -> Result<()> {
    app.ingest_demo().await?;
    let resolver = app.resolver()?;

    let (name, namespace) = match &action {
        ArtistAction::Match { name, namespace, .. }
        | ArtistAction::NoMatch { name, namespace }
        | ArtistAction::Reset { name, namespace } => (name.clone(), parse_namespace(namespace)?),
    };
    let artist = app
        .storage
        .get_artist_by_slug(&slugify(&name))
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("artist '{}'", name)))?;
    let artist_id = artist.id.unwrap_or_default();

    let updated = match action {
        ArtistAction::Match { external_id, .. } => {
            resolver
                .manually_match_artist(artist_id, namespace, &external_id)
                .await?
        }
        ArtistAction::NoMatch { .. } => resolver.mark_artist_no_match(artist_id, namespace).await?,
        ArtistAction::Reset { .. } => resolver.reset_artist_match(artist_id, namespace).await?,
    };

    let state = updated.match_for(namespace);
    println!(
        "🎤 {} [{}]: {:?}{}",
        updated.name,
        namespace.as_str(),
        state.status,
        state
            .external_id
            .as_deref()
            .map(|id| format!(" ({})", id))
            .unwrap_or_default(),
    );
    Ok(())
}

async fn run_match_artists(app: &App, namespace: &str, limit: usize) -> Result<()> {
    let namespace = parse_namespace(namespace)?;
    app.ingest_demo().await?;

    println!("\n🔎 Matching pending artists against {}...", namespace.as_str());
    let summary = app
        .resolver()?
        .match_pending_artists(namespace, limit)
        .await?;
    println!("   Processed: {}", summary.processed);
    println!("   Matched: {}", summary.matched);
    println!("   No match: {}", summary.no_match);
    println!("   Errors: {}", summary.errors);
    for outcome in &summary.outcomes {
        println!("   - {}: {:?}", outcome.name, outcome.outcome);
    }
    Ok(())
}

async fn run_stats(app: &App) -> Result<()> {
    app.ingest_demo().await?;
    let stats = app.resolver()?.get_matching_stats().await?;

    println!("\n📈 Match state by namespace:");
    for namespace in MatchNamespace::ALL {
        let entry = stats.per_namespace.get(&namespace).cloned().unwrap_or_default();
        println!(
            "   {}: {} pending, {} matched, {} no-match",
            namespace.as_str(),
            entry.pending,
            entry.matched,
            entry.no_match
        );
    }
    Ok(())
}

async fn run_sync_playlists(app: &App) -> Result<()> {
    let spotify = Arc::new(SpotifyCatalog::from_env(&app.config.matching)?);
    app.ingest_demo().await?;

    let region_id = Uuid::parse_str(DEMO_REGION_ID)
        .map_err(|e| PipelineError::Config(format!("bad demo region id: {}", e)))?;
    let mut playlist = Playlist {
        id: None,
        name: "Demo Region Live".to_string(),
        spotify_playlist_id: std::env::var("SPOTIFY_PLAYLIST_ID")
            .map_err(|_| PipelineError::Config("SPOTIFY_PLAYLIST_ID is not set".into()))?,
        region_id,
        enabled: true,
        max_tracks: 50,
    };
    app.storage.create_playlist(&mut playlist).await?;

    println!("\n🔄 Matching artists on Spotify before syncing...");
    app.resolver()?
        .match_pending_artists(MatchNamespace::Spotify, 50)
        .await?;

    let syncer = PlaylistSyncer::new(app.storage.clone(), spotify);
    for result in syncer.sync_all_playlists().await? {
        println!(
            "🎵 {}: {} tracks ({} added, {} removed)",
            result.playlist_name, result.total, result.added, result.removed
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    gigdex::logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load_or_default();
    let app = App::new(config);

    match cli.command {
        Commands::Ingest => {
            println!("🔄 Running ingestion...");
            app.ingest_demo().await?;
        }
        Commands::Version { action } => {
            run_version_action(&app, action).await?;
        }
        Commands::MatchArtists { namespace, limit } => {
            run_match_artists(&app, &namespace, limit).await?;
        }
        Commands::Artist { action } => {
            run_artist_action(&app, action).await?;
        }
        Commands::Stats => {
            run_stats(&app).await?;
        }
        Commands::SyncPlaylists => {
            run_sync_playlists(&app).await?;
        }
        Commands::BackfillRegions => {
            app.ingest_demo().await?;
            let repaired = app.storage.backfill_event_regions().await?;
            println!("🔧 Repaired {} events", repaired);
        }
    }
    Ok(())
}
