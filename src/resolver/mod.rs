use crate::config::MatchingConfig;
use crate::domain::{Artist, ArtistMatch, MatchNamespace, MatchStatus};
use crate::error::{PipelineError, Result};
use crate::similarity;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub mod musicbrainz;
pub mod rate_limit;
pub mod spotify;

pub use musicbrainz::MusicBrainzCatalog;
pub use spotify::SpotifyCatalog;

/// One external artist record, as either catalog reports it.
#[derive(Debug, Clone)]
pub struct CatalogCandidate {
    pub external_id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub popularity: Option<u32>,
}

/// One external identity space the resolver can match against.
#[async_trait]
pub trait ArtistCatalog: Send + Sync {
    fn namespace(&self) -> MatchNamespace;
    /// Fuzzy search by artist name.
    async fn search_artists(&self, name: &str) -> Result<Vec<CatalogCandidate>>;
    /// Direct fetch by external id, bypassing search.
    async fn lookup_artist(&self, external_id: &str) -> Result<CatalogCandidate>;
}

/// Per-artist outcome of a batch matching run.
#[derive(Debug)]
pub enum MatchOutcome {
    Matched { external_id: String, score: f64 },
    NoMatch { best_score: f64 },
    Error(String),
}

#[derive(Debug)]
pub struct ArtistOutcome {
    pub artist_id: Uuid,
    pub name: String,
    pub outcome: MatchOutcome,
}

#[derive(Debug, Default)]
pub struct MatchRunSummary {
    pub processed: usize,
    pub matched: usize,
    pub no_match: usize,
    pub errors: usize,
    pub outcomes: Vec<ArtistOutcome>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NamespaceStats {
    pub pending: usize,
    pub matched: usize,
    pub no_match: usize,
}

#[derive(Debug, Default, Clone)]
pub struct MatchingStats {
    pub per_namespace: HashMap<MatchNamespace, NamespaceStats>,
}

/// Assigns external catalog identifiers to artists, independently per
/// namespace. Automated matching only ever moves Pending artists; Matched
/// and NoMatch are terminal for automation and move again only through the
/// manual operations.
pub struct IdentityResolver {
    storage: Arc<dyn Storage>,
    catalogs: HashMap<MatchNamespace, Arc<dyn ArtistCatalog>>,
    config: MatchingConfig,
}

impl IdentityResolver {
    pub fn new(storage: Arc<dyn Storage>, config: MatchingConfig) -> Self {
        Self {
            storage,
            catalogs: HashMap::new(),
            config,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ArtistCatalog>) -> Self {
        self.catalogs.insert(catalog.namespace(), catalog);
        self
    }

    fn catalog(&self, namespace: MatchNamespace) -> Result<&Arc<dyn ArtistCatalog>> {
        self.catalogs.get(&namespace).ok_or_else(|| {
            PipelineError::Config(format!("no catalog configured for {}", namespace.as_str()))
        })
    }

    /// Matches up to `limit` Pending artists against one namespace, oldest
    /// first. Lookups run sequentially (the catalog clients rate-limit
    /// themselves) and one artist's failure never aborts the batch.
    #[instrument(skip(self), fields(namespace = namespace.as_str()))]
    pub async fn match_pending_artists(
        &self,
        namespace: MatchNamespace,
        limit: usize,
    ) -> Result<MatchRunSummary> {
        let catalog = self.catalog(namespace)?;
        let pending = self.storage.list_pending_artists(namespace, limit).await?;
        info!("Matching {} pending artists against {}", pending.len(), namespace.as_str());

        let mut summary = MatchRunSummary::default();
        for artist in pending {
            summary.processed += 1;
            let artist_id = artist.id.unwrap();
            let outcome = match self.match_one(catalog.as_ref(), &artist).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Lookup failure leaves the artist Pending and eligible
                    // for the next batch.
                    warn!("Lookup failed for '{}': {}", artist.name, e);
                    counter!("gigdex_match_errors_total", "namespace" => namespace.as_str())
                        .increment(1);
                    summary.errors += 1;
                    summary.outcomes.push(ArtistOutcome {
                        artist_id,
                        name: artist.name.clone(),
                        outcome: MatchOutcome::Error(e.to_string()),
                    });
                    continue;
                }
            };

            match &outcome {
                MatchOutcome::Matched { external_id, score } => {
                    info!(
                        "Matched '{}' to {} {} (score {:.3})",
                        artist.name,
                        namespace.as_str(),
                        external_id,
                        score
                    );
                    summary.matched += 1;
                }
                MatchOutcome::NoMatch { best_score } => {
                    info!(
                        "No {} match for '{}' (best score {:.3})",
                        namespace.as_str(),
                        artist.name,
                        best_score
                    );
                    summary.no_match += 1;
                }
                MatchOutcome::Error(_) => unreachable!("errors handled above"),
            }
            summary.outcomes.push(ArtistOutcome {
                artist_id,
                name: artist.name.clone(),
                outcome,
            });
        }

        counter!("gigdex_artists_matched_total", "namespace" => namespace.as_str())
            .increment(summary.matched as u64);
        info!(
            "Match run complete: {} matched, {} no-match, {} errors",
            summary.matched, summary.no_match, summary.errors
        );
        Ok(summary)
    }

    /// Scores candidates and persists the resulting transition for one
    /// artist. Retries transient lookup failures a bounded number of times.
    async fn match_one(&self, catalog: &dyn ArtistCatalog, artist: &Artist) -> Result<MatchOutcome> {
        let candidates = self.search_with_retries(catalog, &artist.name).await?;

        let mut best: Option<(f64, &CatalogCandidate)> = None;
        for candidate in &candidates {
            let score = similarity::score(&artist.name, &candidate.name);
            let better = match best {
                None => true,
                Some((best_score, best_candidate)) => {
                    score > best_score
                        || (score == best_score
                            && candidate.popularity.unwrap_or(0)
                                > best_candidate.popularity.unwrap_or(0))
                }
            };
            if better {
                best = Some((score, candidate));
            }
        }

        let mut stored = artist.clone();
        let outcome = match best {
            Some((score, candidate)) if score >= self.config.confidence_threshold => {
                apply_match(&mut stored, catalog.namespace(), candidate);
                MatchOutcome::Matched {
                    external_id: candidate.external_id.clone(),
                    score,
                }
            }
            best => {
                // Below threshold we record NoMatch rather than guessing.
                let state = stored.match_for_mut(catalog.namespace());
                state.status = MatchStatus::NoMatch;
                state.matched_at = Some(Utc::now());
                MatchOutcome::NoMatch {
                    best_score: best.map(|(score, _)| score).unwrap_or(0.0),
                }
            }
        };
        self.storage.update_artist(&stored).await?;
        Ok(outcome)
    }

    async fn search_with_retries(
        &self,
        catalog: &dyn ArtistCatalog,
        name: &str,
    ) -> Result<Vec<CatalogCandidate>> {
        let mut attempt = 0u32;
        loop {
            match catalog.search_artists(name).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!("Transient catalog failure (attempt {}): {}", attempt, e);
                    tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Operator override: fetch the external record by id and force
    /// Matched, whatever the prior state was.
    #[instrument(skip(self), fields(namespace = namespace.as_str()))]
    pub async fn manually_match_artist(
        &self,
        artist_id: Uuid,
        namespace: MatchNamespace,
        external_id: &str,
    ) -> Result<Artist> {
        let catalog = self.catalog(namespace)?;
        let mut artist = self.require_artist(artist_id).await?;
        let candidate = catalog.lookup_artist(external_id).await?;

        apply_match(&mut artist, namespace, &candidate);
        self.storage.update_artist(&artist).await?;
        info!(
            "Manually matched '{}' to {} {}",
            artist.name,
            namespace.as_str(),
            external_id
        );
        Ok(artist)
    }

    pub async fn mark_artist_no_match(
        &self,
        artist_id: Uuid,
        namespace: MatchNamespace,
    ) -> Result<Artist> {
        let mut artist = self.require_artist(artist_id).await?;
        *artist.match_for_mut(namespace) = ArtistMatch {
            status: MatchStatus::NoMatch,
            matched_at: Some(Utc::now()),
            ..ArtistMatch::default()
        };
        self.storage.update_artist(&artist).await?;
        Ok(artist)
    }

    pub async fn reset_artist_match(
        &self,
        artist_id: Uuid,
        namespace: MatchNamespace,
    ) -> Result<Artist> {
        let mut artist = self.require_artist(artist_id).await?;
        *artist.match_for_mut(namespace) = ArtistMatch::default();
        self.storage.update_artist(&artist).await?;
        Ok(artist)
    }

    /// Exact counts straight off the persisted state; no caching here.
    pub async fn get_matching_stats(&self) -> Result<MatchingStats> {
        let artists = self.storage.list_artists().await?;
        let mut stats = MatchingStats::default();
        for namespace in MatchNamespace::ALL {
            let entry = stats.per_namespace.entry(namespace).or_default();
            for artist in &artists {
                match artist.match_for(namespace).status {
                    MatchStatus::Pending => entry.pending += 1,
                    MatchStatus::Matched => entry.matched += 1,
                    MatchStatus::NoMatch => entry.no_match += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn require_artist(&self, artist_id: Uuid) -> Result<Artist> {
        self.storage
            .get_artist(artist_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("artist {}", artist_id)))
    }
}

fn apply_match(artist: &mut Artist, namespace: MatchNamespace, candidate: &CatalogCandidate) {
    *artist.match_for_mut(namespace) = ArtistMatch {
        status: MatchStatus::Matched,
        external_id: Some(candidate.external_id.clone()),
        canonical_name: Some(candidate.name.clone()),
        genre_count: candidate.genres.len(),
        popularity: candidate.popularity,
        matched_at: Some(Utc::now()),
    };
    // Genre tags from the matched record feed recommendations downstream.
    for genre in &candidate.genres {
        let token = similarity::genre_token(genre);
        if !token.is_empty() && !artist.genres.contains(&token) {
            artist.genres.push(token);
        }
    }
}
