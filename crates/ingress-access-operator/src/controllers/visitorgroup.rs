//! VisitorGroup CRD controller
//!
//! Watches cluster-scoped ingress.neo9.io/v1 VisitorGroup resources. A group is
//! consumed by the ingresses that reference it, so a change to the group and
//! its removal both mean the same thing to the reconciler: refresh whatever
//! depends on it.
//!
//! ## Deletion Handling
//!
//! Unlike the Service pipeline, this controller holds a finalizer on every
//! group so the reconciler still runs after `kubectl delete`. The finalizer is
//! released once the cleanup reconciliation succeeds.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{self, finalizer, Event as Finalizer};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client as KubeClient;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::reconciler::{ReconcileError, Reconciled, VisitorGroupReconciler};
use crate::visitorgroup::VisitorGroup;

use super::retry::{compute_backoff, ErrorKind, RetryTracker};

/// Finalizer held on every VisitorGroup until its cleanup has run
pub const FINALIZER: &str = "ingress.neo9.io/visitorgroup-cleanup";

#[derive(Debug, Error)]
pub enum VisitorGroupError {
    #[error("Reconciler error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<VisitorGroupError>>),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Shared state of the VisitorGroup controller
pub struct VisitorGroupContext {
    /// Kubernetes API client, used for finalizer patches
    pub client: KubeClient,
    pub reconciler: Arc<dyn VisitorGroupReconciler>,
    /// Failed attempts per group UID
    pub retry: Arc<RetryTracker>,
}

impl VisitorGroupContext {
    pub fn new(
        client: KubeClient,
        reconciler: Arc<dyn VisitorGroupReconciler>,
        retry: Arc<RetryTracker>,
    ) -> Self {
        Self {
            client,
            reconciler,
            retry,
        }
    }
}

/// Run the reconciler for one finalizer event
async fn apply(
    event: Finalizer<VisitorGroup>,
    ctx: &VisitorGroupContext,
) -> Result<Action, VisitorGroupError> {
    let (group, deleted) = match event {
        Finalizer::Apply(group) => (group, false),
        Finalizer::Cleanup(group) => (group, true),
    };
    let name = group.metadata.name.as_deref().unwrap_or("unknown");

    if deleted {
        info!(name = %name, "delete event detected for visitor group");
    } else {
        info!(
            name = %name,
            sources = group.spec.sources.len(),
            "update event detected for visitor group"
        );
    }

    match ctx.reconciler.reconcile(&group).await? {
        Reconciled::Done => debug!(name = %name, "Visitor group reconciled"),
        Reconciled::NotManaged { resource } => {
            error!(resource = %resource, "panic: could not work on resource, not managed by this operator");
        }
    }

    Ok(Action::await_change())
}

/// Reconcile a single VisitorGroup resource
#[instrument(
    skip(ctx, group),
    fields(name = %group.metadata.name.as_deref().unwrap_or("unknown"))
)]
async fn reconcile(
    group: Arc<VisitorGroup>,
    ctx: Arc<VisitorGroupContext>,
) -> Result<Action, VisitorGroupError> {
    if group.metadata.name.is_none() {
        return Err(VisitorGroupError::MissingField("metadata.name".to_string()));
    }
    let uid = group.metadata.uid.clone();

    let groups: Api<VisitorGroup> = Api::all(ctx.client.clone());
    let action = finalizer(&groups, FINALIZER, group, |event| apply(event, &ctx))
        .await
        .map_err(|e| VisitorGroupError::Finalizer(Box::new(e)))?;

    // Reset retry counter on success
    if let Some(uid) = uid.as_deref() {
        ctx.retry.reset(uid);
    }

    Ok(action)
}

/// Classify error type for retry behavior
fn classify_error(error: &VisitorGroupError) -> ErrorKind {
    match error {
        VisitorGroupError::Reconcile(_) => ErrorKind::Transient,
        VisitorGroupError::Finalizer(inner) => match inner.as_ref() {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => {
                classify_error(e)
            }
            finalizer::Error::AddFinalizer(_) | finalizer::Error::RemoveFinalizer(_) => {
                ErrorKind::Transient
            }
            // Unnamed objects and malformed finalizer names never fix themselves
            _ => ErrorKind::Permanent,
        },
        VisitorGroupError::MissingField(_) => ErrorKind::Permanent,
    }
}

/// Error policy for the controller with exponential backoff
fn error_policy(
    group: Arc<VisitorGroup>,
    error: &VisitorGroupError,
    ctx: Arc<VisitorGroupContext>,
) -> Action {
    let uid = group.metadata.uid.as_deref().unwrap_or("unknown");
    let kind = classify_error(error);
    let attempt = ctx.retry.increment(uid);

    warn!(
        name = %group.metadata.name.as_deref().unwrap_or("unknown"),
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "VisitorGroup reconciliation failed"
    );

    compute_backoff(attempt, kind, &ctx.retry.backoff())
}

/// Run the VisitorGroup controller until `shutdown` is cancelled
pub async fn run(client: KubeClient, ctx: Arc<VisitorGroupContext>, shutdown: CancellationToken) {
    let groups: Api<VisitorGroup> = Api::all(client);

    info!("Starting VisitorGroup controller");

    Controller::new(groups, WatcherConfig::default())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "VisitorGroup reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "VisitorGroup controller error");
                }
            }
        })
        .await;

    info!("VisitorGroup controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::retry::Backoff;
    use crate::reconciler::MockVisitorGroupReconciler;
    use crate::visitorgroup::{VisitorGroupSource, VisitorGroupSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::time::Duration;

    /// Mock service for creating a kube Client in tests.
    /// Finalizer patches are answered with a valid VisitorGroup.
    struct MockKubeService;

    impl tower::Service<http::Request<kube::client::Body>> for MockKubeService {
        type Response = http::Response<kube::client::Body>;
        type Error = std::convert::Infallible;
        type Future = std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
        >;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: http::Request<kube::client::Body>) -> Self::Future {
            Box::pin(async {
                let body = serde_json::json!({
                    "apiVersion": "ingress.neo9.io/v1",
                    "kind": "VisitorGroup",
                    "metadata": {
                        "name": "office",
                        "uid": "vg-uid"
                    },
                    "spec": {
                        "sources": []
                    }
                });
                let body_bytes = serde_json::to_vec(&body).unwrap();
                let response = http::Response::builder()
                    .status(200)
                    .header("content-type", "application/json")
                    .body(kube::client::Body::from(body_bytes))
                    .unwrap();
                Ok(response)
            })
        }
    }

    fn mock_kube_client() -> KubeClient {
        KubeClient::new(MockKubeService, "default")
    }

    fn make_context(reconciler: MockVisitorGroupReconciler) -> Arc<VisitorGroupContext> {
        Arc::new(VisitorGroupContext::new(
            mock_kube_client(),
            Arc::new(reconciler),
            Arc::new(RetryTracker::new(Backoff::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
            ))),
        ))
    }

    fn test_group(finalized: bool, deleting: bool) -> VisitorGroup {
        VisitorGroup {
            metadata: ObjectMeta {
                name: Some("office".to_string()),
                uid: Some("vg-uid".to_string()),
                finalizers: finalized.then(|| vec![FINALIZER.to_string()]),
                deletion_timestamp: deleting.then(deletion_time),
                ..Default::default()
            },
            spec: VisitorGroupSpec {
                sources: vec![VisitorGroupSource {
                    name: "office".to_string(),
                    cidr: "192.168.1.0/24".to_string(),
                }],
            },
        }
    }

    fn deletion_time() -> Time {
        serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z"))
            .expect("valid RFC 3339 timestamp")
    }

    fn failed(reason: &str) -> ReconcileError {
        ReconcileError::Failed {
            resource: "office".to_string(),
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_calls_reconciler_and_resets_retries() {
        let mut reconciler = MockVisitorGroupReconciler::new();
        reconciler
            .expect_reconcile()
            .withf(|group: &VisitorGroup| group.spec.cidrs() == vec!["192.168.1.0/24"])
            .times(1)
            .returning(|_| Ok(Reconciled::Done));

        let ctx = make_context(reconciler);
        ctx.retry.increment("vg-uid");

        let action = reconcile(Arc::new(test_group(true, false)), ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.retry.attempts("vg-uid"), 0);
    }

    #[tokio::test]
    async fn test_cleanup_calls_reconciler() {
        let mut reconciler = MockVisitorGroupReconciler::new();
        reconciler
            .expect_reconcile()
            .times(1)
            .returning(|_| Ok(Reconciled::Done));

        let ctx = make_context(reconciler);
        let result = reconcile(Arc::new(test_group(true, true)), ctx).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_finalizer_added_before_reconciling() {
        let mut reconciler = MockVisitorGroupReconciler::new();
        reconciler.expect_reconcile().never();

        let ctx = make_context(reconciler);
        let action = reconcile(Arc::new(test_group(false, false)), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_not_managed_is_swallowed() {
        let mut reconciler = MockVisitorGroupReconciler::new();
        reconciler
            .expect_reconcile()
            .times(1)
            .returning(|_| Ok(Reconciled::not_managed("office")));

        let ctx = make_context(reconciler);
        let result = reconcile(Arc::new(test_group(true, false)), ctx).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_reconciler_failure_surfaces_as_apply_failed() {
        let mut reconciler = MockVisitorGroupReconciler::new();
        reconciler
            .expect_reconcile()
            .times(1)
            .returning(|_| Err(failed("ingress refresh failed")));

        let ctx = make_context(reconciler);
        let err = reconcile(Arc::new(test_group(true, false)), ctx)
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            VisitorGroupError::Finalizer(inner)
                if matches!(inner.as_ref(), finalizer::Error::ApplyFailed(_))
        ));
        assert_eq!(classify_error(&err), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_missing_name_is_permanent() {
        let ctx = make_context(MockVisitorGroupReconciler::new());
        let mut group = test_group(true, false);
        group.metadata.name = None;

        let err = reconcile(Arc::new(group), ctx).await.unwrap_err();

        assert!(matches!(err, VisitorGroupError::MissingField(_)));
        assert_eq!(classify_error(&err), ErrorKind::Permanent);
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(
            classify_error(&VisitorGroupError::Reconcile(failed("boom"))),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_error(&VisitorGroupError::Finalizer(Box::new(
                finalizer::Error::CleanupFailed(VisitorGroupError::MissingField(
                    "spec".to_string()
                ))
            ))),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify_error(&VisitorGroupError::Finalizer(Box::new(
                finalizer::Error::UnnamedObject
            ))),
            ErrorKind::Permanent
        );
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_per_uid() {
        let ctx = make_context(MockVisitorGroupReconciler::new());
        let group = Arc::new(test_group(true, false));
        let error = VisitorGroupError::Reconcile(failed("boom"));

        let first = error_policy(group.clone(), &error, ctx.clone());
        let second = error_policy(group.clone(), &error, ctx.clone());

        assert_eq!(first, Action::requeue(Duration::from_secs(1)));
        assert_eq!(second, Action::requeue(Duration::from_secs(2)));
        assert_eq!(ctx.retry.attempts("vg-uid"), 2);
        assert_eq!(ctx.retry.attempts("other-uid"), 0);
    }

    #[tokio::test]
    async fn test_error_policy_permanent_waits_for_change() {
        let ctx = make_context(MockVisitorGroupReconciler::new());
        let group = Arc::new(test_group(true, false));
        let error = VisitorGroupError::MissingField("metadata.name".to_string());

        assert_eq!(error_policy(group, &error, ctx), Action::await_change());
    }
}
