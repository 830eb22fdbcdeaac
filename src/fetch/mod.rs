use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod http;
pub mod request;

pub use http::HttpFetcher;
pub use request::{build_headers, expand_env_vars, prepare_url, redact_url};

/// Successful upstream body. The scheduler never looks inside it.
pub type Payload = serde_json::Value;

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Every failure class of a single outbound call. All of them are treated as
/// transient by the scheduler and retried until the retry ceiling is reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to decode upstream payload: {0}")]
    Decode(String),
    #[error("fetch task panicked: {0}")]
    Panicked(String),
}

/// Body excerpt length kept in [`FetchError::Status`].
const STATUS_BODY_EXCERPT: usize = 200;

impl FetchError {
    pub fn status(status: u16, body: &str) -> Self {
        let body = match body.char_indices().nth(STATUS_BODY_EXCERPT) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body.to_string(),
        };
        FetchError::Status { status, body }
    }
}

/// The network capability the scheduler sits in front of.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> FetchResult<Payload>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_truncates_long_bodies() {
        let body = "x".repeat(500);
        let FetchError::Status { status, body } = FetchError::status(503, &body) else {
            panic!("expected status variant");
        };
        assert_eq!(status, 503);
        assert_eq!(body.len(), STATUS_BODY_EXCERPT + 3);
        assert!(body.ends_with("..."));
    }

    #[test]
    fn status_error_keeps_short_bodies() {
        assert_eq!(
            FetchError::status(429, "slow down").to_string(),
            "upstream returned status 429: slow down"
        );
    }
}
