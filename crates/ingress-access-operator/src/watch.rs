//! Self-healing label-filtered watch
//!
//! A [`WatchSupervisor`] owns at most one live subscription to a resource
//! stream and forwards `(action, resource)` pairs to an [`EventHandler`].
//! When the stream terminates (ends or fails) the supervisor does not retry
//! inline: it hands a resubscription callback to the shared
//! [`RetryTracker`], which calls [`WatchSupervisor::start`] again after the
//! backoff delay for the watch's name.
//!
//! ```text
//!                start()               subscribed
//! Disconnected ──────────▶ Connecting ────────────▶ Watching
//!      ▲                       │                       │
//!      │   retry scheduled     │ failed                │ stream ended / failed
//!      └───────────────────────┴───────────────────────┘
//!
//! any state ── shutdown() ──▶ ShuttingDown (terminal)
//! ```

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::controllers::retry::RetryTracker;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to open watch: {0}")]
    Subscribe(#[source] kube::Error),
    #[error("watch stream failed: {0}")]
    Stream(#[source] kube::Error),
    #[error("watch disconnected: {0}")]
    Disconnected(String),
}

/// Live event stream of one subscription
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, WatchError>>;

/// Opens subscriptions to a filtered resource stream
#[async_trait]
pub trait WatchSource<K>: Send + Sync {
    /// Open a new subscription. Dropping the stream closes it.
    async fn subscribe(&self) -> Result<EventStream<K>, WatchError>;
}

/// All-namespace watch on resources carrying a label key
pub struct LabelWatch<K> {
    api: Api<K>,
    params: WatchParams,
}

impl<K> LabelWatch<K> {
    pub fn new(api: Api<K>, label_key: &str) -> Self {
        Self {
            api,
            params: WatchParams::default().labels(label_key),
        }
    }
}

#[async_trait]
impl<K> WatchSource<K> for LabelWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn subscribe(&self) -> Result<EventStream<K>, WatchError> {
        let stream = self
            .api
            .watch(&self.params, "0")
            .await
            .map_err(WatchError::Subscribe)?;

        Ok(stream.map(|item| item.map_err(WatchError::Stream)).boxed())
    }
}

/// Resource-level action carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// Receives resource events on the watch task.
///
/// Implementations must not block: anything slow belongs on another task.
pub trait EventHandler<K>: Send + Sync {
    fn on_event(&self, action: WatchAction, resource: K);
}

/// Lifecycle state of a supervised watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Disconnected,
    Connecting,
    Watching,
    ShuttingDown,
}

/// Why a subscription ended
#[derive(Debug)]
enum Termination {
    Failed(WatchError),
    Ended,
}

#[derive(Debug)]
struct Inner {
    state: WatchState,
    /// Bumped on every start/stop; stale watch tasks compare against it
    generation: u64,
    subscription: Option<AbortHandle>,
}

/// Supervises one named watch
pub struct WatchSupervisor<K> {
    name: String,
    source: Arc<dyn WatchSource<K>>,
    handler: Arc<dyn EventHandler<K>>,
    retry: Arc<RetryTracker>,
    inner: Mutex<Inner>,
}

impl<K> WatchSupervisor<K>
where
    K: Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn WatchSource<K>>,
        handler: Arc<dyn EventHandler<K>>,
        retry: Arc<RetryTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source,
            handler,
            retry,
            inner: Mutex::new(Inner {
                state: WatchState::Disconnected,
                generation: 0,
                subscription: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stable name used for retry bookkeeping
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WatchState {
        self.inner().state
    }

    /// Open a new subscription, closing the previous one first.
    ///
    /// No-op once [`WatchSupervisor::shutdown`] has been called.
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.inner();
        if inner.state == WatchState::ShuttingDown {
            debug!(watch = %self.name, "Watch shutting down, not starting");
            return;
        }

        self.close(&mut inner);
        inner.generation += 1;
        inner.state = WatchState::Connecting;

        info!(watch = %self.name, generation = inner.generation, "Starting watch loop");

        let task = tokio::spawn(Arc::clone(self).run(inner.generation));
        inner.subscription = Some(task.abort_handle());
    }

    /// Close the current subscription, if any. Idempotent.
    ///
    /// A resubscription already handed to the retry tracker is not cancelled.
    pub fn stop(&self) {
        let mut inner = self.inner();
        inner.generation += 1;
        self.close(&mut inner);
        if inner.state != WatchState::ShuttingDown {
            inner.state = WatchState::Disconnected;
        }
    }

    /// Close the subscription and refuse any further `start()`.
    pub fn shutdown(&self) {
        let mut inner = self.inner();
        inner.state = WatchState::ShuttingDown;
        inner.generation += 1;
        self.close(&mut inner);
    }

    fn close(&self, inner: &mut Inner) {
        if let Some(subscription) = inner.subscription.take() {
            info!(watch = %self.name, "Closing watch loop");
            subscription.abort();
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let termination = match self.source.subscribe().await {
            Ok(mut stream) => {
                if !self.mark_watching(generation) {
                    return;
                }
                self.retry.reset(&self.name);
                info!(watch = %self.name, "Watch established");

                loop {
                    match stream.next().await {
                        Some(Ok(event)) => self.dispatch(event),
                        Some(Err(e)) => break Termination::Failed(e),
                        None => break Termination::Ended,
                    }
                }
            }
            Err(e) => Termination::Failed(e),
        };

        self.on_terminated(generation, termination);
    }

    fn mark_watching(&self, generation: u64) -> bool {
        let mut inner = self.inner();
        if inner.generation != generation || inner.state == WatchState::ShuttingDown {
            return false;
        }
        inner.state = WatchState::Watching;
        true
    }

    fn dispatch(&self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Added(resource) => self.handler.on_event(WatchAction::Added, resource),
            WatchEvent::Modified(resource) => {
                self.handler.on_event(WatchAction::Modified, resource)
            }
            WatchEvent::Deleted(resource) => {
                self.handler.on_event(WatchAction::Deleted, resource)
            }
            WatchEvent::Bookmark(_) => trace!(watch = %self.name, "Ignoring bookmark"),
            WatchEvent::Error(e) => {
                debug!(watch = %self.name, error = ?e, "Ignoring error event")
            }
        }
    }

    fn on_terminated(self: &Arc<Self>, generation: u64, termination: Termination) {
        {
            let mut inner = self.inner();
            if inner.generation != generation || inner.state == WatchState::ShuttingDown {
                return;
            }
            inner.state = WatchState::Disconnected;
            inner.subscription = None;
        }

        match &termination {
            Termination::Failed(e) => warn!(watch = %self.name, error = %e, "Watch failed"),
            Termination::Ended => info!(watch = %self.name, "Watch stream closed"),
        }

        let this = Arc::clone(self);
        self.retry.schedule_retry(&self.name, move || this.start());
    }
}
