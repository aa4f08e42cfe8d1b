use crate::config::MatchingConfig;
use crate::domain::MatchNamespace;
use crate::error::{PipelineError, Result};
use crate::resolver::rate_limit::RateLimiter;
use crate::resolver::{ArtistCatalog, CatalogCandidate};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const MUSICBRAINZ_BASE_URL: &str = "https://musicbrainz.org/ws/2";
// MusicBrainz requires an identifying User-Agent and caps clients at 1 req/s.
const USER_AGENT: &str = "gigdex/0.1.0 (https://github.com/gigdex/gigdex)";
const SEARCH_LIMIT: u32 = 10;

#[derive(Debug, Deserialize)]
struct MBArtistSearchResponse {
    #[serde(default)]
    artists: Vec<MBArtist>,
}

#[derive(Debug, Deserialize)]
struct MBArtist {
    id: String,
    name: String,
    #[serde(default)]
    tags: Vec<MBTag>,
    /// Search relevance 0-100; absent on direct lookups.
    score: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MBTag {
    name: String,
}

/// Open music metadata database client (MusicBrainz WS/2).
pub struct MusicBrainzCatalog {
    http_client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl MusicBrainzCatalog {
    pub fn new(config: &MatchingConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::external("musicbrainz", e.to_string(), true))?;

        Ok(Self {
            http_client,
            rate_limiter: RateLimiter::new(config.rate_limit_ms),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.rate_limiter.wait().await;
        debug!(url = %url, "Querying MusicBrainz");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::external("musicbrainz", e.to_string(), true))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(PipelineError::NotFound("musicbrainz artist".into()));
        }
        if status.as_u16() == 503 {
            return Err(PipelineError::external("musicbrainz", "rate limit exceeded", true));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::external(
                "musicbrainz",
                format!("status {}: {}", status.as_u16(), body),
                status.is_server_error(),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::external("musicbrainz", format!("parse error: {}", e), false))
    }
}

fn to_candidate(artist: MBArtist) -> CatalogCandidate {
    CatalogCandidate {
        external_id: artist.id,
        name: artist.name,
        genres: artist.tags.into_iter().map(|t| t.name).collect(),
        popularity: artist.score,
    }
}

#[async_trait]
impl ArtistCatalog for MusicBrainzCatalog {
    fn namespace(&self) -> MatchNamespace {
        MatchNamespace::MusicBrainz
    }

    async fn search_artists(&self, name: &str) -> Result<Vec<CatalogCandidate>> {
        let escaped = name.replace('"', "\\\"");
        let url = format!(
            "{}/artist?query=artist:\"{}\"&limit={}&fmt=json",
            MUSICBRAINZ_BASE_URL,
            urlencoding_encode(&escaped),
            SEARCH_LIMIT
        );
        let response: MBArtistSearchResponse = self.get_json(&url).await?;
        Ok(response.artists.into_iter().map(to_candidate).collect())
    }

    async fn lookup_artist(&self, external_id: &str) -> Result<CatalogCandidate> {
        let url = format!(
            "{}/artist/{}?inc=tags&fmt=json",
            MUSICBRAINZ_BASE_URL, external_id
        );
        let artist: MBArtist = self.get_json(&url).await?;
        Ok(to_candidate(artist))
    }
}

/// Percent-encodes query characters MusicBrainz's Lucene endpoint chokes on.
fn urlencoding_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' | '"' => out.push(c),
            ' ' => out.push_str("%20"),
            _ => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", byte));
                }
            }
        }
    }
    out
}
