use std::sync::Arc;

use log::{debug, warn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::dispatcher::{self, DispatcherState};
use super::Shared;

/// Periodically restart the dispatcher if it sits idle with work queued.
///
/// Holds only a weak handle, so dropping the last [`super::Scheduler`] also
/// stops the watchdog.
pub(crate) fn spawn(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    let cancel = shared.cancel.clone();
    let period = shared.config.watchdog_interval;

    shared.runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(shared) = weak.upgrade() else { break };
                    check(&shared);
                }
            }
        }

        debug!("watchdog stopped");
    });
}

/// One watchdog pass. Returns whether the dispatcher was restarted.
pub(crate) fn check(shared: &Arc<Shared>) -> bool {
    let pending = {
        let mut state = shared.lock_state();
        shared.expire_overdue(&mut state, Instant::now());
        state.queue.len()
    };

    if pending == 0 || shared.dispatcher.load() != DispatcherState::Idle {
        return false;
    }

    let restarted = dispatcher::ensure_running(shared);
    if restarted {
        warn!("watchdog restarted idle dispatcher with {pending} queued requests");
    }
    restarted
}
