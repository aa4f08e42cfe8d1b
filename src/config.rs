use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub merge: MergeConfig,
    pub matching: MatchingConfig,
    pub scraping: ScrapingConfig,
}

/// Tunables for dedup matching and conflict resolution. The similarity
/// threshold and date tolerance are deliberately configurable: too strict
/// produces duplicate events, too loose merges distinct shows.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Jaro-Winkler score on normalized titles above which two observations
    /// describe the same event.
    pub title_similarity_threshold: f64,
    /// Observations this many days apart can still dedup to one event.
    pub date_tolerance_days: i64,
    /// A scraped value replaces a manual correction only once the scrape
    /// postdates the correction by this many days.
    pub manual_staleness_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum candidate score to accept an external-catalog match.
    pub confidence_threshold: f64,
    /// Minimum interval between external catalog requests, per namespace.
    pub rate_limit_ms: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    /// Hard cap on a single scraper execution (test or production run).
    pub run_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            title_similarity_threshold: 0.82,
            date_tolerance_days: 0,
            manual_staleness_days: 7,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            rate_limit_ms: 1000,
            request_timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 60,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            merge: MergeConfig::default(),
            matching: MatchingConfig::default(),
            scraping: ScrapingConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", config_path, e))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        Ok(config)
    }

    /// Loads config.toml when present, otherwise falls back to defaults.
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default config: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.merge.title_similarity_threshold > 0.5);
        assert!(config.merge.title_similarity_threshold < 1.0);
        assert!(config.matching.confidence_threshold > 0.5);
        assert_eq!(config.merge.date_tolerance_days, 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [merge]
            title_similarity_threshold = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.merge.title_similarity_threshold, 0.9);
        assert_eq!(config.merge.manual_staleness_days, 7);
        assert_eq!(config.matching.rate_limit_ms, 1000);
    }
}
