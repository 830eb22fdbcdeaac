//! Rate-limited, priority-ordered scheduling of upstream data calls.
//!
//! Callers submit a URL for a `(resource, kind)` pair and get back a
//! [`PendingFetch`]. A single dispatcher loop serves the queue in priority
//! order without exceeding the per-window call budget, retrying transient
//! failures with a linear backoff.

mod dispatcher;
mod executor;
mod queue;
mod request;
mod stats;
mod status;
mod watchdog;
mod window;


use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{validator, SchedulerConfig};
use crate::error::{AppError, Result, SchedulerError};
use crate::fetch::{redact_url, Fetcher, HttpFetcher, Payload};

pub use dispatcher::DispatcherState;
pub use queue::{InsertOutcome, RequestQueue};
pub use request::{ParseKindError, QueuedRequest, RequestKey, RequestKind};
pub use stats::{Stats, StatsSnapshot};
pub use status::{estimate_wait_seconds, QueueStatus, RequestState, WaitInputs};
pub use window::RateWindow;

use dispatcher::DispatcherCell;
use status::{Completion, CompletionLog};

/// Per-submission options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Reject the request with [`SchedulerError::DeadlineExceeded`] if it is
    /// still queued this long after submission.
    pub deadline: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

/// Future returned by [`Scheduler::submit`].
///
/// Resolves with the upstream payload or the reason the request gave up. A
/// request replaced by a newer submission for the same resource resolves
/// with [`SchedulerError::Superseded`].
#[derive(Debug)]
pub struct PendingFetch {
    id: Uuid,
    rx: oneshot::Receiver<std::result::Result<Payload, SchedulerError>>,
}

impl PendingFetch {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingFetch {
    type Output = std::result::Result<Payload, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SchedulerError::Superseded)))
    }
}

/// One row of [`Scheduler::debug_dump`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub resource_key: String,
    pub kind: RequestKind,
    pub priority: u32,
    /// Query string stripped.
    pub url: String,
    pub age_ms: u64,
    pub retry_count: u32,
    pub submitted_at: DateTime<Local>,
    /// Waiting out a retry backoff rather than sitting in the queue.
    pub parked: bool,
}

impl QueueEntry {
    fn from_request(request: &QueuedRequest, now: Instant, parked: bool) -> Self {
        Self {
            id: request.id,
            resource_key: request.key.resource_key.clone(),
            kind: request.key.kind,
            priority: request.priority,
            url: redact_url(&request.url).to_string(),
            age_ms: now.saturating_duration_since(request.enqueued_at).as_millis() as u64,
            retry_count: request.retry_count,
            submitted_at: request.submitted_at,
            parked,
        }
    }
}

pub(crate) struct SchedulerState {
    pub(crate) queue: RequestQueue,
    /// Requests waiting out a retry backoff, keyed by request id.
    pub(crate) parked: HashMap<Uuid, QueuedRequest>,
    pub(crate) in_flight: Option<RequestKey>,
    pub(crate) completions: CompletionLog,
    pub(crate) closed: bool,
}

impl SchedulerState {
    /// Remove parked retries for `key`; a newer submission replaces them.
    fn take_parked(&mut self, key: &RequestKey) -> Vec<QueuedRequest> {
        let ids: Vec<Uuid> = self
            .parked
            .iter()
            .filter(|(_, request)| request.key == *key)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.parked.remove(&id))
            .collect()
    }

    fn drain_pending(&mut self) -> Vec<QueuedRequest> {
        let mut drained = self.queue.remove_all();
        drained.extend(self.parked.drain().map(|(_, request)| request));
        drained
    }
}

/// State shared by the handle, the dispatcher, retry timers and the watchdog.
///
/// Lock order is `state` before `window`; `stats` is never held with either.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) runtime: Handle,
    pub(crate) cancel: CancellationToken,
    pub(crate) dispatcher: DispatcherCell,
    state: Mutex<SchedulerState>,
    window: Mutex<RateWindow>,
    stats: Mutex<Stats>,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_window(&self) -> MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_stats(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject queued requests whose deadline has passed.
    pub(crate) fn expire_overdue(&self, state: &mut SchedulerState, now: Instant) {
        for request in state.queue.remove_expired(now) {
            let waited = request.timeout().unwrap_or_default();
            info!("{} expired after waiting {:?}", request.key, waited);
            state
                .completions
                .record(request.key.clone(), Completion::Failed, now);
            request.reject(SchedulerError::DeadlineExceeded(waited));
        }
    }

    pub(crate) fn complete_in_flight(&self, key: &RequestKey, completion: Completion) {
        let mut state = self.lock_state();
        if state.in_flight.as_ref() == Some(key) {
            state.in_flight = None;
        }
        state
            .completions
            .record(key.clone(), completion, Instant::now());
    }

    pub(crate) fn clear_in_flight(&self) {
        self.lock_state().in_flight = None;
    }

    /// Move a parked retry back into the queue once its backoff has elapsed.
    pub(crate) fn requeue_parked(self: &Arc<Self>, id: Uuid) {
        {
            let mut state = self.lock_state();
            let Some(request) = state.parked.remove(&id) else {
                // Cleared while parked.
                return;
            };
            if let Err(stale) = state.queue.insert_if_vacant(request) {
                debug!(
                    "retry of {} dropped, a newer submission already holds the slot",
                    stale.key
                );
            }
        }
        dispatcher::ensure_running(self);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        for request in state.drain_pending() {
            request.reject(SchedulerError::ShutDown);
        }
    }
}

/// Handle to a running scheduler. Cheap to clone; all clones share one queue,
/// one rate window and one dispatcher.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Build a scheduler around `fetcher`. Must be called inside a tokio runtime,
    /// which hosts the dispatcher, retry timers and watchdog.
    pub fn new(config: SchedulerConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        validator::validate_config(&config)?;
        let runtime = Handle::try_current().map_err(|err| {
            AppError::message(format!(
                "scheduler must be created inside a tokio runtime: {err}"
            ))
        })?;

        let window = RateWindow::new(config.max_calls_per_window, config.window_length);
        let stats = Stats::new(config.latency_sample_capacity);
        let completions = CompletionLog::new(config.completed_marker_ttl);

        let shared = Arc::new(Shared {
            fetcher,
            runtime,
            cancel: CancellationToken::new(),
            dispatcher: DispatcherCell::new(),
            state: Mutex::new(SchedulerState {
                queue: RequestQueue::new(),
                parked: HashMap::new(),
                in_flight: None,
                completions,
                closed: false,
            }),
            window: Mutex::new(window),
            stats: Mutex::new(stats),
            config,
        });

        watchdog::spawn(&shared);
        info!(
            "scheduler started: {} calls per {}s, {} retries",
            shared.config.max_calls_per_window,
            shared.config.window_length.as_secs(),
            shared.config.max_retries
        );

        Ok(Self { shared })
    }

    /// Build a scheduler that calls the upstream over HTTP.
    pub fn with_http(config: SchedulerConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.upstream)?;
        Self::new(config, Arc::new(fetcher))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Queue a call for `(resource_key, kind)`. Never fails synchronously;
    /// every outcome arrives through the returned future.
    pub fn submit(
        &self,
        url: impl Into<String>,
        resource_key: impl Into<String>,
        kind: RequestKind,
    ) -> PendingFetch {
        self.submit_with(url, resource_key, kind, SubmitOptions::default())
    }

    pub fn submit_with(
        &self,
        url: impl Into<String>,
        resource_key: impl Into<String>,
        kind: RequestKind,
        options: SubmitOptions,
    ) -> PendingFetch {
        let (tx, rx) = oneshot::channel();
        let priority = self.shared.config.priorities.priority_of(kind);
        let request = QueuedRequest::new(
            RequestKey::new(resource_key, kind),
            priority,
            url.into(),
            options.deadline,
            tx,
        );
        let pending = PendingFetch { id: request.id, rx };

        {
            let mut state = self.shared.lock_state();
            if state.closed {
                drop(state);
                request.reject(SchedulerError::ShutDown);
                return pending;
            }

            debug!("queueing {} with priority {}", request.key, priority);
            for previous in state.take_parked(&request.key) {
                debug!("{} replaced parked retry {}", previous.key, previous.id);
            }
            if let InsertOutcome::Replaced(previous) = state.queue.insert(request) {
                debug!("{} replaced queued request {}", previous.key, previous.id);
            }
        }

        dispatcher::ensure_running(&self.shared);
        pending
    }

    /// Queue position and wait estimate for `(resource_key, kind)`.
    pub fn status_for(&self, resource_key: &str, kind: RequestKind) -> QueueStatus {
        let key = RequestKey::new(resource_key, kind);
        let now = Instant::now();
        let state = self.shared.lock_state();

        if let Some(index) = state.queue.position_of(&key) {
            let position = index + 1;
            let inputs = {
                let window = self.shared.lock_window();
                WaitInputs {
                    has_budget: window.has_budget_at(now),
                    time_until_reset: window.time_until_reset_at(now),
                    next_slot_estimate: self.shared.config.next_slot_estimate,
                    max_calls_per_window: window.max_calls_per_window(),
                    window_length: window.window_length(),
                }
            };
            return QueueStatus::queued(position, estimate_wait_seconds(position, &inputs));
        }

        let request_state = if state.in_flight.as_ref() == Some(&key) {
            RequestState::InFlight
        } else if state.parked.values().any(|request| request.key == key) {
            RequestState::RetryScheduled
        } else {
            match state.completions.lookup(&key, now) {
                Some(Completion::Served) => RequestState::Served,
                Some(Completion::Failed) => RequestState::Failed,
                None => RequestState::Unknown,
            }
        };
        QueueStatus::not_queued(request_state)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let now = Instant::now();
        let (queue_length, calls_in_window) = {
            let state = self.shared.lock_state();
            let window = self.shared.lock_window();
            (state.queue.len(), window.calls_in_window_at(now))
        };
        let stats = self.shared.lock_stats();

        StatsSnapshot {
            calls_in_window,
            queue_length,
            total_processed: stats.total_processed(),
            total_errors: stats.total_errors(),
            total_retries: stats.total_retries(),
            average_latency_ms: stats.average_latency().as_millis() as u64,
            dispatcher: self.shared.dispatcher.load(),
        }
    }

    /// Queued entries in pop order, followed by parked retries.
    pub fn debug_dump(&self) -> Vec<QueueEntry> {
        let now = Instant::now();
        let state = self.shared.lock_state();

        let mut parked: Vec<&QueuedRequest> = state.parked.values().collect();
        parked.sort_by_key(|request| request.enqueued_at);

        state
            .queue
            .iter()
            .map(|request| QueueEntry::from_request(request, now, false))
            .chain(
                parked
                    .into_iter()
                    .map(|request| QueueEntry::from_request(request, now, true)),
            )
            .collect()
    }

    /// Start the dispatcher now if it is idle. Returns whether it was started.
    pub fn force_process(&self) -> bool {
        dispatcher::ensure_running(&self.shared)
    }

    /// Reject every pending request with [`SchedulerError::QueueCleared`].
    /// Returns how many were rejected. A call already in flight is unaffected.
    pub fn clear_queue(&self) -> usize {
        let drained = self.shared.lock_state().drain_pending();
        let count = drained.len();
        for request in drained {
            request.reject(SchedulerError::QueueCleared);
        }
        info!("queue cleared, {count} pending requests rejected");
        count
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.shared.dispatcher.load()
    }

    /// Stop the dispatcher, watchdog and retry timers and reject everything
    /// still pending with [`SchedulerError::ShutDown`]. Later submissions are
    /// rejected immediately. Returns how many requests were rejected.
    pub fn shutdown(&self) -> usize {
        let drained = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            state.drain_pending()
        };
        self.shared.cancel.cancel();

        let count = drained.len();
        for request in drained {
            request.reject(SchedulerError::ShutDown);
        }
        info!("scheduler shut down, {count} pending requests rejected");
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Run a watchdog pass immediately.
    pub fn run_watchdog(&self) -> bool {
        watchdog::check(&self.shared)
    }
}
