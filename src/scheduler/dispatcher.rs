//! The single control loop that serializes upstream calls against the rate window.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::time::{sleep, Instant};

use super::executor;
use super::request::QueuedRequest;
use super::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Idle,
    Running,
    WaitingForWindow,
}

impl DispatcherState {
    fn as_u8(self) -> u8 {
        match self {
            DispatcherState::Idle => 0,
            DispatcherState::Running => 1,
            DispatcherState::WaitingForWindow => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatcherState::Running,
            2 => DispatcherState::WaitingForWindow,
            _ => DispatcherState::Idle,
        }
    }
}

/// Atomic holder of the dispatcher state; doubles as the running flag.
#[derive(Debug)]
pub(crate) struct DispatcherCell(AtomicU8);

impl DispatcherCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(DispatcherState::Idle.as_u8()))
    }

    pub(crate) fn load(&self) -> DispatcherState {
        DispatcherState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: DispatcherState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Idle -> Running. Fails when a loop is already active.
    fn try_start(&self) -> bool {
        self.0
            .compare_exchange(
                DispatcherState::Idle.as_u8(),
                DispatcherState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Start a dispatch loop unless one is already active. Returns whether a loop was spawned.
pub(crate) fn ensure_running(shared: &Arc<Shared>) -> bool {
    if shared.cancel.is_cancelled() || !shared.dispatcher.try_start() {
        return false;
    }

    let task_shared = Arc::clone(shared);
    shared.runtime.spawn(run(task_shared));
    true
}

enum Step {
    Idle,
    Dispatch(QueuedRequest),
    Wait(Duration),
}

async fn run(shared: Arc<Shared>) {
    let mut guard = IdleOnExit {
        shared: &shared,
        armed: true,
    };
    debug!("dispatcher started");

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        match next_step(&shared) {
            Step::Idle => {
                // The state was already set under the queue lock; a new loop may own it now.
                guard.armed = false;
                break;
            }
            Step::Dispatch(request) => executor::execute(&shared, request).await,
            Step::Wait(delay) => {
                shared.dispatcher.store(DispatcherState::WaitingForWindow);
                info!(
                    "rate budget exhausted, waiting {:.1}s for the window to reset",
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
                shared.dispatcher.store(DispatcherState::Running);
            }
        }
    }

    debug!("dispatcher stopped");
}

/// Decide the next move while holding the queue lock, so an empty-queue
/// check and the transition to idle cannot interleave with an insert.
fn next_step(shared: &Shared) -> Step {
    let now = Instant::now();
    let mut state = shared.lock_state();
    shared.expire_overdue(&mut state, now);

    if state.queue.is_empty() {
        shared.dispatcher.store(DispatcherState::Idle);
        return Step::Idle;
    }

    let mut window = shared.lock_window();
    if !window.try_consume_at(now) {
        return Step::Wait(window.time_until_reset_at(now) + shared.config.window_safety_margin);
    }
    drop(window);

    match state.queue.pop_next() {
        Some(request) => {
            state.in_flight = Some(request.key.clone());
            Step::Dispatch(request)
        }
        None => {
            shared.dispatcher.store(DispatcherState::Idle);
            Step::Idle
        }
    }
}

/// Returns the dispatcher to idle if the loop exits any way other than
/// finding the queue empty, so the watchdog can restart it.
struct IdleOnExit<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.dispatcher.store(DispatcherState::Idle);
        }
    }
}
