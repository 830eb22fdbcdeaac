//! Queued request type and the identifiers used to deduplicate it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::fetch::Payload;

/// Category of upstream call. Its priority comes from [`crate::config::PriorityTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Technical,
    Quote,
    News,
}

impl RequestKind {
    pub const ALL: [RequestKind; 3] = [
        RequestKind::Technical,
        RequestKind::Quote,
        RequestKind::News,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Technical => "technical",
            RequestKind::Quote => "quote",
            RequestKind::News => "news",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown request kind `{0}`")]
pub struct ParseKindError(String);

impl FromStr for RequestKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseKindError(s.to_string()))
    }
}

/// Dedup slot identity: one queued entry per resource and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestKey {
    pub resource_key: String,
    pub kind: RequestKind,
}

impl RequestKey {
    pub fn new(resource_key: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            resource_key: resource_key.into(),
            kind,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_key, self.kind)
    }
}

/// Resolver half of the caller's [`super::PendingFetch`].
pub type Responder = oneshot::Sender<Result<Payload, SchedulerError>>;

/// One pending unit of work.
pub struct QueuedRequest {
    pub id: Uuid,
    pub key: RequestKey,
    /// Derived from the kind at submission; never recomputed.
    pub priority: u32,
    pub url: String,
    pub enqueued_at: Instant,
    /// Wall-clock submission time, for debug dumps only.
    pub submitted_at: DateTime<Local>,
    pub retry_count: u32,
    pub deadline: Option<Instant>,
    responder: Option<Responder>,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl QueuedRequest {
    pub fn new(
        key: RequestKey,
        priority: u32,
        url: String,
        timeout: Option<Duration>,
        responder: Responder,
    ) -> Self {
        let enqueued_at = Instant::now();
        Self {
            id: Uuid::new_v4(),
            key,
            priority,
            url,
            enqueued_at,
            submitted_at: Local::now(),
            retry_count: 0,
            deadline: timeout.map(|t| enqueued_at + t),
            responder: Some(responder),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now >= d)
    }

    /// Time the request was allowed to wait, if it had a deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline.map(|d| d.duration_since(self.enqueued_at))
    }

    pub fn resolve(mut self, payload: Payload) {
        self.settle(Ok(payload));
    }

    pub fn reject(mut self, err: SchedulerError) {
        self.settle(Err(err));
    }

    fn settle(&mut self, outcome: Result<Payload, SchedulerError>) {
        if let Some(tx) = self.responder.take() {
            // The caller may have dropped its future; nothing to deliver then.
            let _ = tx.send(outcome);
        }
    }
}
