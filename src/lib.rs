pub mod config;
pub mod domain;
pub mod error;
pub mod locks;
pub mod logging;
pub mod similarity;
pub mod storage;

// Scraper lifecycle and ingestion
pub mod ingest;
pub mod normalize;
pub mod scraper;
pub mod versions;

// Catalog merge
pub mod merge;

// External identities and playlist upkeep
pub mod playlist;
pub mod resolver;
