use crate::config::MatchingConfig;
use crate::domain::MatchNamespace;
use crate::error::{PipelineError, Result};
use crate::playlist::StreamingPlaylists;
use crate::resolver::rate_limit::RateLimiter;
use crate::resolver::{ArtistCatalog, CatalogCandidate};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1";
const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const SEARCH_LIMIT: u32 = 10;
// Refresh slightly before the advertised expiry.
const TOKEN_SLACK_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    artists: ArtistPage,
}

#[derive(Debug, Deserialize)]
struct ArtistPage {
    #[serde(default)]
    items: Vec<SpotifyArtist>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    id: String,
    name: String,
    #[serde(default)]
    genres: Vec<String>,
    popularity: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TopTracksResponse {
    #[serde(default)]
    tracks: Vec<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracksResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

/// Streaming-catalog provider client. Uses the client-credentials flow;
/// credentials come from SPOTIFY_CLIENT_ID / SPOTIFY_CLIENT_SECRET.
pub struct SpotifyCatalog {
    http_client: reqwest::Client,
    rate_limiter: RateLimiter,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl SpotifyCatalog {
    pub fn from_env(config: &MatchingConfig) -> Result<Self> {
        let client_id = std::env::var("SPOTIFY_CLIENT_ID")
            .map_err(|_| PipelineError::Config("SPOTIFY_CLIENT_ID is not set".into()))?;
        let client_secret = std::env::var("SPOTIFY_CLIENT_SECRET")
            .map_err(|_| PipelineError::Config("SPOTIFY_CLIENT_SECRET is not set".into()))?;
        Self::new(config, client_id, client_secret)
    }

    pub fn new(config: &MatchingConfig, client_id: String, client_secret: String) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::external("spotify", e.to_string(), true))?;

        Ok(Self {
            http_client,
            rate_limiter: RateLimiter::new(config.rate_limit_ms),
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        debug!("Refreshing Spotify access token");
        let response = self
            .http_client
            .post(SPOTIFY_TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| PipelineError::external("spotify", e.to_string(), true))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::external(
                "spotify",
                format!("token request failed with status {}", status.as_u16()),
                status.is_server_error(),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::external("spotify", format!("parse error: {}", e), false))?;
        let expires_at = Instant::now()
            + Duration::from_secs(token.expires_in.saturating_sub(TOKEN_SLACK_SECS));
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.rate_limiter.wait().await;
        let token = self.bearer_token().await?;
        debug!(url = %url, "Querying Spotify");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PipelineError::external("spotify", e.to_string(), true))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(PipelineError::NotFound("spotify resource".into()));
        }
        if status.as_u16() == 429 {
            return Err(PipelineError::external("spotify", "rate limit exceeded", true));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::external(
                "spotify",
                format!("status {}: {}", status.as_u16(), body),
                status.is_server_error(),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::external("spotify", format!("parse error: {}", e), false))
    }
}

fn to_candidate(artist: SpotifyArtist) -> CatalogCandidate {
    CatalogCandidate {
        external_id: artist.id,
        name: artist.name,
        genres: artist.genres,
        popularity: artist.popularity,
    }
}

#[async_trait]
impl ArtistCatalog for SpotifyCatalog {
    fn namespace(&self) -> MatchNamespace {
        MatchNamespace::Spotify
    }

    async fn search_artists(&self, name: &str) -> Result<Vec<CatalogCandidate>> {
        let url = format!(
            "{}/search?type=artist&limit={}&q={}",
            SPOTIFY_API_BASE,
            SEARCH_LIMIT,
            urlencode(name)
        );
        let response: SearchResponse = self.get_json(&url).await?;
        Ok(response.artists.items.into_iter().map(to_candidate).collect())
    }

    async fn lookup_artist(&self, external_id: &str) -> Result<CatalogCandidate> {
        let url = format!("{}/artists/{}", SPOTIFY_API_BASE, external_id);
        let artist: SpotifyArtist = self.get_json(&url).await?;
        Ok(to_candidate(artist))
    }
}

#[async_trait]
impl StreamingPlaylists for SpotifyCatalog {
    async fn artist_top_track_uri(&self, spotify_artist_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/artists/{}/top-tracks?market=US",
            SPOTIFY_API_BASE, spotify_artist_id
        );
        let response: TopTracksResponse = self.get_json(&url).await?;
        Ok(response.tracks.into_iter().next().map(|t| t.uri))
    }

    async fn playlist_track_uris(&self, playlist_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/playlists/{}/tracks?fields=items(track(uri))",
            SPOTIFY_API_BASE, playlist_id
        );
        let response: PlaylistTracksResponse = self.get_json(&url).await?;
        Ok(response
            .items
            .into_iter()
            .filter_map(|item| item.track.map(|t| t.uri))
            .collect())
    }

    async fn replace_playlist_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        self.rate_limiter.wait().await;
        let token = self.bearer_token().await?;
        let url = format!("{}/playlists/{}/tracks", SPOTIFY_API_BASE, playlist_id);

        let response = self
            .http_client
            .put(&url)
            .bearer_auth(token)
            .json(&json!({ "uris": uris }))
            .send()
            .await
            .map_err(|e| PipelineError::external("spotify", e.to_string(), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::external(
                "spotify",
                format!("playlist update failed with {}: {}", status.as_u16(), body),
                status.is_server_error(),
            ));
        }
        Ok(())
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            ' ' => out.push('+'),
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
