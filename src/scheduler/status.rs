//! Queue position and wait estimates for polling clients.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::request::RequestKey;

/// Where a resource stands from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    InFlight,
    /// Failed at least once and is waiting out its backoff.
    RetryScheduled,
    /// Served recently; the marker expires after `completed_marker_ttl`.
    Served,
    /// Gave up recently (retries exhausted or deadline passed).
    Failed,
    /// Never submitted, or its completion marker already expired.
    Unknown,
}

/// Answer to a status poll.
///
/// `estimated_wait_seconds` is an upper-bound heuristic, not a promise; the
/// only guarantee is that it never decreases with queue position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub in_queue: bool,
    /// 1-based rank, 0 when not queued.
    pub position: usize,
    pub estimated_wait_seconds: u64,
    pub state: RequestState,
}

impl QueueStatus {
    pub fn queued(position: usize, estimated_wait_seconds: u64) -> Self {
        Self {
            in_queue: true,
            position,
            estimated_wait_seconds,
            state: RequestState::Queued,
        }
    }

    pub fn not_queued(state: RequestState) -> Self {
        Self {
            in_queue: false,
            position: 0,
            estimated_wait_seconds: 0,
            state,
        }
    }
}

/// Inputs of the wait estimate, sampled from the rate window.
#[derive(Debug, Clone, Copy)]
pub struct WaitInputs {
    pub has_budget: bool,
    pub time_until_reset: Duration,
    pub next_slot_estimate: Duration,
    pub max_calls_per_window: u32,
    pub window_length: Duration,
}

/// `next_slot + floor((position - 1) / budget) * window`, in whole seconds.
pub fn estimate_wait_seconds(position: usize, inputs: &WaitInputs) -> u64 {
    let next_slot = if inputs.has_budget {
        inputs.next_slot_estimate
    } else {
        inputs.time_until_reset
    };
    let budget = u64::from(inputs.max_calls_per_window.max(1));
    let windows_ahead = (position.saturating_sub(1) as u64) / budget;

    ceil_secs(next_slot) + windows_ahead * ceil_secs(inputs.window_length)
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Served,
    Failed,
}

/// Short-lived markers that separate "already served" from "never seen".
#[derive(Debug)]
pub struct CompletionLog {
    entries: HashMap<RequestKey, (Completion, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

/// Upper bound on retained markers; the oldest is evicted beyond it.
const MAX_COMPLETION_MARKERS: usize = 1024;

impl CompletionLog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: MAX_COMPLETION_MARKERS,
        }
    }

    pub fn record(&mut self, key: RequestKey, completion: Completion, now: Instant) {
        self.prune(now);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        self.entries.insert(key, (completion, now));
    }

    pub fn lookup(&self, key: &RequestKey, now: Instant) -> Option<Completion> {
        let (completion, at) = self.entries.get(key)?;
        if now.saturating_duration_since(*at) <= self.ttl {
            Some(*completion)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= ttl);
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, (_, at))| *at)
            .map(|(key, _)| key.clone())
        {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::request::RequestKind;

    fn inputs(has_budget: bool, time_until_reset: Duration) -> WaitInputs {
        WaitInputs {
            has_budget,
            time_until_reset,
            next_slot_estimate: Duration::from_secs(1),
            max_calls_per_window: 5,
            window_length: Duration::from_secs(60),
        }
    }

    #[test]
    fn first_window_uses_next_slot_estimate() {
        let inputs = inputs(true, Duration::from_secs(40));
        assert_eq!(estimate_wait_seconds(1, &inputs), 1);
        assert_eq!(estimate_wait_seconds(5, &inputs), 1);
        assert_eq!(estimate_wait_seconds(6, &inputs), 61);
        assert_eq!(estimate_wait_seconds(11, &inputs), 121);
    }

    #[test]
    fn exhausted_window_waits_for_reset() {
        let inputs = inputs(false, Duration::from_millis(12_300));
        assert_eq!(estimate_wait_seconds(1, &inputs), 13);
        assert_eq!(estimate_wait_seconds(6, &inputs), 73);
    }

    #[test]
    fn estimate_is_monotonic_in_position() {
        for has_budget in [true, false] {
            let inputs = inputs(has_budget, Duration::from_secs(30));
            let estimates: Vec<u64> = (1..=40)
                .map(|position| estimate_wait_seconds(position, &inputs))
                .collect();
            assert!(estimates.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn not_queued_status_is_zeroed() {
        let status = QueueStatus::not_queued(RequestState::Unknown);
        assert!(!status.in_queue);
        assert_eq!(status.position, 0);
        assert_eq!(status.estimated_wait_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_markers_expire() {
        let mut log = CompletionLog::new(Duration::from_secs(10));
        let key = RequestKey::new("AAPL", RequestKind::Quote);
        log.record(key.clone(), Completion::Served, Instant::now());

        assert_eq!(log.lookup(&key, Instant::now()), Some(Completion::Served));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(log.lookup(&key, Instant::now()), None);

        log.record(
            RequestKey::new("MSFT", RequestKind::Quote),
            Completion::Failed,
            Instant::now(),
        );
        assert_eq!(log.len(), 1, "expired marker pruned on record");
    }
}
