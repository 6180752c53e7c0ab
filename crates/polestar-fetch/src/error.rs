//! Error types for the HTTP fetcher.

use thiserror::Error;

/// Result type for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors raised while retrieving module source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP {status} fetching {url}")]
    Status {
        /// URL that was requested
        url: String,
        /// Response status code
        status: u16,
    },

    /// The dependency annotation block did not parse
    #[error("Invalid dependency annotation in {url}: {reason}")]
    Annotation {
        /// URL the module came from
        url: String,
        /// Parse failure detail
        reason: String,
    },
}
