use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::error::SchedulerError;
use crate::fetch::{FetchError, FetchResult, Payload};

use super::request::QueuedRequest;
use super::status::Completion;
use super::Shared;

/// Perform one attempt for `request` and settle it or park it for a retry.
pub(crate) async fn execute(shared: &Arc<Shared>, mut request: QueuedRequest) {
    let started = Instant::now();
    let url = request.url.clone();

    let outcome = tokio::select! {
        _ = shared.cancel.cancelled() => {
            shared.clear_in_flight();
            request.reject(SchedulerError::ShutDown);
            return;
        }
        outcome = call_upstream(shared, url) => outcome,
    };
    let latency = started.elapsed();

    match outcome {
        Ok(payload) => {
            shared.lock_stats().record_success(latency);
            debug!(
                "{} served in {}ms (attempt {})",
                request.key,
                latency.as_millis(),
                request.retry_count + 1
            );
            shared.complete_in_flight(&request.key, Completion::Served);
            request.resolve(payload);
        }
        Err(err) if request.retry_count < shared.config.max_retries => {
            request.retry_count += 1;
            let delay = backoff(shared.config.retry_base_delay, request.retry_count);
            shared.lock_stats().record_retry();
            warn!(
                "{} failed: {}; retry {}/{} in {}ms",
                request.key,
                err,
                request.retry_count,
                shared.config.max_retries,
                delay.as_millis()
            );
            schedule_retry(shared, request, delay);
        }
        Err(err) => {
            shared.lock_stats().record_failure();
            let attempts = request.retry_count + 1;
            error!("{} failed after {} attempts: {}", request.key, attempts, err);
            shared.complete_in_flight(&request.key, Completion::Failed);
            let rejection = SchedulerError::RetriesExhausted {
                key: request.key.resource_key.clone(),
                kind: request.key.kind,
                attempts,
                last_error: err,
            };
            request.reject(rejection);
        }
    }
}

/// Linear backoff: `base * retry_count`.
pub(crate) fn backoff(base: Duration, retry_count: u32) -> Duration {
    base.saturating_mul(retry_count)
}

/// Run the fetch on its own task so a panicking fetcher cannot take the
/// dispatcher down with it, and bound it by the configured request timeout.
async fn call_upstream(shared: &Arc<Shared>, url: String) -> FetchResult<Payload> {
    let fetcher = Arc::clone(&shared.fetcher);
    let limit = shared.config.upstream.request_timeout;
    let mut handle = shared
        .runtime
        .spawn(async move { fetcher.fetch(&url).await });
    let _abort = AbortOnDrop(handle.abort_handle());

    match timeout(limit, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            error!("fetch task failed: {join_err}");
            Err(FetchError::Panicked(join_err.to_string()))
        }
        Err(_) => {
            handle.abort();
            Err(FetchError::Timeout(limit))
        }
    }
}

/// Aborts the fetch task if the attempt is dropped before it finishes.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn schedule_retry(shared: &Arc<Shared>, request: QueuedRequest, delay: Duration) {
    let id = request.id;
    {
        let mut state = shared.lock_state();
        state.in_flight = None;
        if state.closed {
            drop(state);
            request.reject(SchedulerError::ShutDown);
            return;
        }
        state.parked.insert(id, request);
    }

    let task_shared = Arc::clone(shared);
    shared.runtime.spawn(async move {
        tokio::select! {
            // Shutdown drains the parked set itself.
            _ = task_shared.cancel.cancelled() => {}
            _ = sleep(delay) => task_shared.requeue_parked(id),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let base = Duration::from_millis(2000);
        assert_eq!(backoff(base, 1), Duration::from_millis(2000));
        assert_eq!(backoff(base, 2), Duration::from_millis(4000));
        assert_eq!(backoff(base, 3), Duration::from_millis(6000));
    }
}
