use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use super::dispatcher::DispatcherState;

/// Running counters, updated by the executor after every attempt.
#[derive(Debug)]
pub struct Stats {
    total_processed: u64,
    total_errors: u64,
    total_retries: u64,
    latencies: VecDeque<Duration>,
    capacity: usize,
}

impl Stats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            total_processed: 0,
            total_errors: 0,
            total_retries: 0,
            latencies: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.total_processed += 1;
        if self.latencies.len() == self.capacity {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    pub fn record_retry(&mut self) {
        self.total_retries += 1;
    }

    /// A request that gave up after its last retry. Counted once per request.
    pub fn record_failure(&mut self) {
        self.total_errors += 1;
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }

    /// Mean of the retained latency samples, zero before the first success.
    pub fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }
}

/// Point-in-time view served by [`super::Scheduler::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub calls_in_window: u32,
    pub queue_length: usize,
    pub total_processed: u64,
    pub total_errors: u64,
    pub total_retries: u64,
    pub average_latency_ms: u64,
    pub dispatcher: DispatcherState,
}
