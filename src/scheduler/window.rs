use std::time::Duration;

use log::trace;
use tokio::time::Instant;

/// Fixed-window call budget.
///
/// The window restarts once `window_length` has elapsed since the last
/// restart. The check runs before every consumption attempt, so an idle
/// stretch across a boundary is picked up on the next call.
#[derive(Debug)]
pub struct RateWindow {
    calls_in_window: u32,
    window_started_at: Instant,
    max_calls_per_window: u32,
    window_length: Duration,
}

impl RateWindow {
    pub fn new(max_calls_per_window: u32, window_length: Duration) -> Self {
        Self::with_start(max_calls_per_window, window_length, Instant::now())
    }

    pub fn with_start(max_calls_per_window: u32, window_length: Duration, now: Instant) -> Self {
        Self {
            calls_in_window: 0,
            window_started_at: now,
            max_calls_per_window,
            window_length,
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Reset if due, then take one call from the budget when any is left.
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.reset_if_elapsed(now);
        if self.calls_in_window < self.max_calls_per_window {
            self.calls_in_window += 1;
            true
        } else {
            false
        }
    }

    pub fn time_until_reset(&self) -> Duration {
        self.time_until_reset_at(Instant::now())
    }

    pub fn time_until_reset_at(&self, now: Instant) -> Duration {
        (self.window_started_at + self.window_length).saturating_duration_since(now)
    }

    /// Whether a call made at `now` would be admitted.
    pub fn has_budget_at(&self, now: Instant) -> bool {
        self.window_elapsed(now) || self.calls_in_window < self.max_calls_per_window
    }

    /// Calls counted against the window that is current at `now`.
    pub fn calls_in_window_at(&self, now: Instant) -> u32 {
        if self.window_elapsed(now) {
            0
        } else {
            self.calls_in_window
        }
    }

    pub fn max_calls_per_window(&self) -> u32 {
        self.max_calls_per_window
    }

    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_started_at) >= self.window_length
    }

    fn reset_if_elapsed(&mut self, now: Instant) {
        if self.window_elapsed(now) {
            trace!("rate window reset after {} calls", self.calls_in_window);
            self.calls_in_window = 0;
            self.window_started_at = now;
        }
    }
}
