//! Retry bookkeeping with exponential backoff
//!
//! [`RetryTracker`] keeps one record per stable name (a watch name such as
//! `Service-onLabel`, or a resource UID for controller-managed kinds) and can
//! run a callback once after the backoff delay for that name. Names never
//! share state.
//!
//! The tracker never fails: it only arranges future invocations. After
//! [`RetryTracker::shutdown`] every pending callback is cancelled and further
//! scheduling is a no-op.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kube::runtime::controller::Action;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum number of controller retries before waiting for a resource change
const MAX_RETRIES: u32 = 10;

/// Exponential backoff: `base × 2^attempt`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// First delay.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay cap.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay for a 0-indexed attempt. Non-decreasing in `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Per-name retry state
#[derive(Debug, Default)]
struct RetryRecord {
    /// Consecutive failures since the last reset
    attempts: u32,
    /// Delay the next failure will be scheduled with
    next_delay: Duration,
    /// Callback armed by the last `schedule_retry`
    pending: Option<AbortHandle>,
}

/// Tracks retry attempts per name and schedules delayed callbacks
#[derive(Debug)]
pub struct RetryTracker {
    backoff: Backoff,
    records: Mutex<HashMap<String, RetryRecord>>,
    shutdown: CancellationToken,
}

impl RetryTracker {
    /// Create a new retry tracker
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            records: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, RetryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Backoff used by this tracker.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Schedule `action` to run once after the backoff delay for `name`.
    ///
    /// The delay is derived from the current attempt count, which is then
    /// incremented. A callback still pending for the same name is replaced.
    /// Returns the scheduled delay, or `None` once the tracker is shut down.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule_retry<F>(&self, name: &str, action: F) -> Option<Duration>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            debug!(name = %name, "Retry tracker shut down, not scheduling");
            return None;
        }

        let mut records = self.records();
        let record = records.entry(name.to_string()).or_default();

        let delay = self.backoff.delay(record.attempts);
        record.attempts = record.attempts.saturating_add(1);
        record.next_delay = self.backoff.delay(record.attempts);

        if let Some(previous) = record.pending.take() {
            previous.abort();
        }

        let token = self.shutdown.clone();
        let task_name = name.to_string();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(name = %task_name, "Scheduled retry cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    debug!(name = %task_name, "Running scheduled retry");
                    action();
                }
            }
        });
        record.pending = Some(task.abort_handle());

        info!(
            name = %name,
            attempt = record.attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry with exponential backoff"
        );

        Some(delay)
    }

    /// Increment the attempt count for `name` and return the new count.
    pub fn increment(&self, name: &str) -> u32 {
        let mut records = self.records();
        let record = records.entry(name.to_string()).or_default();
        record.attempts = record.attempts.saturating_add(1);
        record.next_delay = self.backoff.delay(record.attempts);
        record.attempts
    }

    /// Discard the record for `name` (call after a successful attempt).
    ///
    /// A callback that is still pending for `name` keeps running.
    pub fn reset(&self, name: &str) {
        if self.records().remove(name).is_some() {
            debug!(name = %name, "Reset retry state");
        }
    }

    /// Current attempt count for `name`
    pub fn attempts(&self, name: &str) -> u32 {
        self.records().get(name).map(|r| r.attempts).unwrap_or(0)
    }

    /// Delay the next failure of `name` will be scheduled with
    pub fn next_delay(&self, name: &str) -> Duration {
        self.records()
            .get(name)
            .map(|r| r.next_delay)
            .unwrap_or_else(|| self.backoff.delay(0))
    }

    /// Cancel every pending callback and stop accepting new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let mut records = self.records();
        let cancelled = records
            .drain()
            .filter_map(|(_, record)| record.pending)
            .inspect(AbortHandle::abort)
            .count();

        info!(cancelled, "Retry tracker shut down");
    }

    /// Whether [`RetryTracker::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient errors that should be retried with backoff
    /// Examples: API server unavailable, conflicts, timeouts
    Transient,
    /// Permanent errors that will not recover without intervention
    /// Examples: missing required fields
    Permanent,
}

/// Determine the requeue action for a controller-managed resource.
///
/// `attempt` is 1-indexed (the value returned by [`RetryTracker::increment`]).
pub fn compute_backoff(attempt: u32, kind: ErrorKind, backoff: &Backoff) -> Action {
    match kind {
        ErrorKind::Transient => {
            if attempt >= MAX_RETRIES {
                warn!(
                    attempt,
                    max_retries = MAX_RETRIES,
                    "Max retries exceeded, waiting for resource change"
                );
                Action::await_change()
            } else {
                let delay = backoff.delay(attempt.saturating_sub(1));
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling requeue with exponential backoff"
                );
                Action::requeue(delay)
            }
        }
        ErrorKind::Permanent => {
            warn!("Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}
