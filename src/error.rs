use std::time::Duration;

use thiserror::Error;

pub use anyhow::Context;

use crate::fetch::FetchError;
use crate::scheduler::RequestKind;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn message<T: Into<String>>(msg: T) -> Self {
        AppError::Message(msg.into())
    }
}

/// Reasons a submitted request settles without a payload.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("request for {key} ({kind}) failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        key: String,
        kind: RequestKind,
        attempts: u32,
        last_error: FetchError,
    },
    #[error("request queue was cleared")]
    QueueCleared,
    #[error("superseded by a newer request for the same resource")]
    Superseded,
    #[error("request deadline of {0:?} elapsed while queued")]
    DeadlineExceeded(Duration),
    #[error("scheduler is shut down")]
    ShutDown,
}

impl SchedulerError {
    /// True for the outcomes a UI should treat as "try again later".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::RetriesExhausted { .. } | SchedulerError::DeadlineExceeded(_)
        )
    }
}
