use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already in progress: {0}")]
    Conflict(String),

    #[error("Source {slug} has no active scraper version")]
    NoActiveVersion { slug: String },

    #[error("Version code for source {slug} is identical to active version {active_version}")]
    DuplicateVersion { slug: String, active_version: u32 },

    #[error("External service error ({service}): {message}")]
    External {
        service: String,
        message: String,
        /// Network failures and 5xx responses are retryable; 4xx and parse
        /// failures are not.
        transient: bool,
    },

    #[error("Operation timed out after {0}s")]
    Timeout(u64),
}

impl PipelineError {
    pub fn external(service: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::External {
            service: service.into(),
            message: message.into(),
            transient,
        }
    }

    /// Whether the retry policy applies to this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::External { transient, .. } => *transient,
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
