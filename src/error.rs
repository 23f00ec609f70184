//! Error types for the harvester.

use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Errors that can abort a run or a setup step.
///
/// Per-attempt failures (blocked proxies, CAPTCHAs, timeouts) are not errors;
/// they are [`Outcome`](crate::Outcome)s consumed by the retry loop.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// HTTP request failed outside of a search attempt.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid run configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The proxy list was empty.
    #[error("No proxies configured")]
    NoProxies,

    /// Credentials could not be obtained.
    #[error("API credentials unavailable: {0}")]
    MissingCredentials(String),

    /// A proxy line could not be parsed.
    #[error("Invalid proxy '{0}': {1}")]
    InvalidProxy(String, String),

    /// No proxy can ever become available again, or none did in time.
    #[error("Proxy pool exhausted: {0}")]
    PoolExhausted(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl HarvestError {
    /// Returns true for errors raised before any work is dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            HarvestError::Config(_)
                | HarvestError::NoProxies
                | HarvestError::MissingCredentials(_)
                | HarvestError::InvalidProxy(..)
        )
    }
}
