//! Per-key trailing debounce
//!
//! [`Debouncer::debounce`] arms a timer of a fixed quiescence window for a key.
//! A later call for the same key cancels the pending timer (its action is
//! dropped, never run) and arms a new one, so a burst of events collapses
//! into a single run of the action attached to the last event.
//!
//! Actions run as Tokio tasks, off the caller's context. Actions for
//! different keys may run concurrently; actions for the same key never
//! overlap because each key owns a run gate held for the duration of an
//! action.
//!
//! [`Debouncer::shutdown`] drops all pending work without running it.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

/// Pending and in-flight state for one key
#[derive(Debug)]
struct Slot {
    /// Generation of the most recently armed timer
    generation: u64,
    /// Timer still waiting out the window (`None` once it fired)
    timer: Option<AbortHandle>,
    /// Serializes action runs for this key
    gate: Arc<AsyncMutex<()>>,
}

#[derive(Debug, Default)]
struct DebounceState {
    slots: HashMap<String, Slot>,
    next_generation: u64,
    shut_down: bool,
}

/// Debounces actions per key with cancel-and-replace semantics
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: Arc<Mutex<DebounceState>>,
}

fn lock(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Quiescence window applied to every key
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Run `action` once `key` has been quiet for the window.
    ///
    /// Cancelling the previous timer and arming the new one happen under a
    /// single lock, so concurrent calls for the same key cannot both survive.
    /// Ignored after [`Debouncer::shutdown`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn debounce<F>(&self, key: &str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);
        if state.shut_down {
            debug!(key = %key, "Debouncer shut down, dropping action");
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;

        let slot = state.slots.entry(key.to_string()).or_insert_with(|| Slot {
            generation,
            timer: None,
            gate: Arc::new(AsyncMutex::new(())),
        });

        if let Some(previous) = slot.timer.take() {
            previous.abort();
            debug!(key = %key, "Replaced pending debounced action");
        }
        slot.generation = generation;

        let task = tokio::spawn(fire(
            Arc::clone(&self.state),
            key.to_string(),
            generation,
            self.window,
            action,
        ));
        slot.timer = Some(task.abort_handle());
    }

    /// Whether `key` has an action waiting out its window
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.state)
            .slots
            .get(key)
            .is_some_and(|slot| slot.timer.is_some())
    }

    /// Number of keys with an action waiting out its window
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .slots
            .values()
            .filter(|slot| slot.timer.is_some())
            .count()
    }

    /// Cancel every pending timer without running its action.
    ///
    /// Actions already running are left to finish.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.shut_down = true;

        let cancelled = state
            .slots
            .drain()
            .filter_map(|(_, slot)| slot.timer)
            .inspect(AbortHandle::abort)
            .count();

        info!(cancelled, "Debouncer shut down");
    }
}

/// Timer task body: wait out the window, then run the action if this
/// generation is still the newest for the key.
async fn fire<F>(
    state: Arc<Mutex<DebounceState>>,
    key: String,
    generation: u64,
    window: Duration,
    action: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::time::sleep(window).await;

    let gate = {
        let mut state = lock(&state);
        match state.slots.get_mut(&key) {
            Some(slot) if slot.generation == generation => {
                slot.timer = None;
                Arc::clone(&slot.gate)
            }
            // superseded or shut down
            _ => return,
        }
    };

    let _running = gate.lock().await;

    let shut_down = lock(&state).shut_down;
    if shut_down {
        debug!(key = %key, "Debouncer shut down before action ran");
        return;
    }

    debug!(key = %key, "Running debounced action");
    if let Err(panic) = AssertUnwindSafe(action).catch_unwind().await {
        error!(
            key = %key,
            panic = %panic_message(panic.as_ref()),
            "Debounced action panicked"
        );
    }

    let mut state = lock(&state);
    let finished = state
        .slots
        .get(&key)
        .is_some_and(|slot| slot.generation == generation);
    if finished {
        state.slots.remove(&key);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
