//! Service controller
//!
//! Watches v1/Service resources carrying the expose label in every namespace
//! and drives the expose / de-expose reconciliation paths.
//!
//! ## Routing
//!
//! | action            | label value `true` (any case) | otherwise |
//! |-------------------|-------------------------------|-----------|
//! | ADDED / MODIFIED  | expose                        | cleanup   |
//! | DELETED           | cleanup                       | cleanup   |
//!
//! A Service whose label was changed away from `true` is cleaned up rather
//! than ignored. Deletions always clean up since the label of a tombstone
//! cannot be trusted.
//!
//! ## Debouncing
//!
//! The path is decided when the event arrives, then scheduled on the
//! [`Debouncer`] keyed by `namespace/name`. Events for one Service coalesce
//! whatever their action: the last event wins.
//!
//! ## Shutdown
//!
//! [`ServiceController::stop`] closes the watch first so no new event enters
//! the pipeline, then cancels pending resubscriptions, then drops pending
//! debounced work.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use tracing::{debug, error, info, instrument};

use crate::config::labels::{EXPOSE_LABEL_KEY, EXPOSE_LABEL_VALUE};
use crate::config::OperatorConfig;
use crate::debounce::Debouncer;
use crate::reconciler::{Reconciled, ServiceReconciler};
use crate::resource::{label_value, namespace_and_name};
use crate::watch::{EventHandler, LabelWatch, WatchAction, WatchSource, WatchState, WatchSupervisor};

use super::retry::RetryTracker;

/// Retry bookkeeping name of the Service watch
pub const WATCH_NAME: &str = "Service-onLabel";

/// Expose flag derived from a Service's labels at event time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    Expose,
    NotExpose,
}

impl LabelState {
    pub fn of(service: &Service) -> Self {
        match label_value(service, EXPOSE_LABEL_KEY) {
            Some(value) if value.eq_ignore_ascii_case(EXPOSE_LABEL_VALUE) => Self::Expose,
            _ => Self::NotExpose,
        }
    }
}

/// What led to a cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    /// The Service still exists but is no longer flagged for exposure
    Unlabeled,
    /// The Service was deleted
    Deleted,
}

/// Reconciliation path chosen for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileIntent {
    Expose,
    Deexpose(CleanupTrigger),
}

/// Decide the reconciliation path for an event.
pub fn intent_for(action: WatchAction, label: LabelState) -> ReconcileIntent {
    match (action, label) {
        (WatchAction::Added | WatchAction::Modified, LabelState::Expose) => ReconcileIntent::Expose,
        (WatchAction::Added | WatchAction::Modified, LabelState::NotExpose) => {
            ReconcileIntent::Deexpose(CleanupTrigger::Unlabeled)
        }
        (WatchAction::Deleted, LabelState::Expose | LabelState::NotExpose) => {
            ReconcileIntent::Deexpose(CleanupTrigger::Deleted)
        }
    }
}

/// Run one reconciliation and swallow whatever it reports.
///
/// Nothing escapes this boundary: the debounce task and the watch keep going
/// no matter how the reconciler behaves.
#[instrument(skip(reconciler, service), fields(resource = %resource))]
async fn apply_intent(
    reconciler: &dyn ServiceReconciler,
    intent: ReconcileIntent,
    service: &Service,
    resource: &str,
) {
    let result = match intent {
        ReconcileIntent::Expose => reconciler.reconcile(service).await,
        ReconcileIntent::Deexpose(trigger) => {
            debug!(trigger = ?trigger, "Cleaning up service exposure");
            reconciler.reconcile_on_delete(service).await
        }
    };

    match result {
        Ok(Reconciled::Done) => debug!(intent = ?intent, "Service reconciled"),
        Ok(Reconciled::NotManaged { resource }) => {
            error!(resource = %resource, "panic: could not work on resource, not managed by this operator");
        }
        Err(e) => {
            error!(intent = ?intent, error = %e, "Service reconciliation failed");
        }
    }
}

/// Routes Service watch events onto debounced reconciliation
pub struct ServiceRouter {
    reconciler: Arc<dyn ServiceReconciler>,
    debouncer: Arc<Debouncer>,
}

impl ServiceRouter {
    pub fn new(reconciler: Arc<dyn ServiceReconciler>, debouncer: Arc<Debouncer>) -> Self {
        Self {
            reconciler,
            debouncer,
        }
    }
}

impl EventHandler<Service> for ServiceRouter {
    fn on_event(&self, action: WatchAction, service: Service) {
        let resource = namespace_and_name(&service);
        let label = LabelState::of(&service);
        let intent = intent_for(action, label);

        match action {
            WatchAction::Added | WatchAction::Modified => info!(
                resource = %resource,
                is_to_expose = label == LabelState::Expose,
                "update event detected for service"
            ),
            WatchAction::Deleted => info!(resource = %resource, "delete event detected for service"),
        }

        let reconciler = Arc::clone(&self.reconciler);
        let key = resource.clone();
        self.debouncer.debounce(&key, async move {
            apply_intent(reconciler.as_ref(), intent, &service, &resource).await;
        });
    }
}

/// Owns the Service watch pipeline and its teardown
pub struct ServiceController {
    supervisor: Arc<WatchSupervisor<Service>>,
    retry: Arc<RetryTracker>,
    debouncer: Arc<Debouncer>,
}

impl ServiceController {
    pub fn new(
        source: Arc<dyn WatchSource<Service>>,
        reconciler: Arc<dyn ServiceReconciler>,
        config: &OperatorConfig,
    ) -> Self {
        let retry = Arc::new(RetryTracker::new(config.retry_backoff()));
        let debouncer = Arc::new(Debouncer::new(config.debounce_window()));
        let router = Arc::new(ServiceRouter::new(reconciler, Arc::clone(&debouncer)));
        let supervisor = WatchSupervisor::new(WATCH_NAME, source, router, Arc::clone(&retry));

        Self {
            supervisor,
            retry,
            debouncer,
        }
    }

    /// Controller watching labeled Services in all namespaces
    pub fn from_client(
        client: Client,
        reconciler: Arc<dyn ServiceReconciler>,
        config: &OperatorConfig,
    ) -> Self {
        let services: Api<Service> = Api::all(client);
        let source = Arc::new(LabelWatch::new(services, EXPOSE_LABEL_KEY));
        Self::new(source, reconciler, config)
    }

    /// Start watching. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        info!("Starting Service controller");
        self.supervisor.start();
    }

    /// Tear the pipeline down. Safe in any state, including before `start()`.
    pub fn stop(&self) {
        info!("Stopping Service controller");
        self.supervisor.shutdown();
        self.retry.shutdown();
        self.debouncer.shutdown();
    }

    pub fn watch_state(&self) -> WatchState {
        self.supervisor.state()
    }

    /// Number of Services with a reconciliation waiting out the debounce window
    pub fn pending(&self) -> usize {
        self.debouncer.pending_count()
    }
}
