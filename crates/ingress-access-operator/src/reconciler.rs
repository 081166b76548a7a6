//! Reconciliation capability boundary
//!
//! The operator core decides *when* to reconcile and *which* path to take;
//! what a resource should look like is decided behind these traits.
//! Implementations must be idempotent and may be slow.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use thiserror::Error;
use tracing::info;

use crate::resource::namespace_and_name;
use crate::visitorgroup::VisitorGroup;

/// Successful outcome of a reconciliation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The resource was converged (or already was)
    Done,
    /// The resource falls outside this operator's ownership boundary
    NotManaged {
        /// `namespace/name` of the offending resource
        resource: String,
    },
}

impl Reconciled {
    pub fn not_managed(resource: impl Into<String>) -> Self {
        Self::NotManaged {
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Reconciliation failed for {resource}: {reason}")]
    Failed { resource: String, reason: String },
}

/// Expose and cleanup entry points for watched Services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceReconciler: Send + Sync {
    /// Converge the side effects of an exposed Service
    async fn reconcile(&self, service: &Service) -> Result<Reconciled, ReconcileError>;

    /// Remove the side effects of a Service that is deleted or no longer exposed
    async fn reconcile_on_delete(&self, service: &Service)
        -> Result<Reconciled, ReconcileError>;
}

/// Entry point for VisitorGroup resources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisitorGroupReconciler: Send + Sync {
    /// Converge everything that depends on the group
    async fn reconcile(&self, group: &VisitorGroup) -> Result<Reconciled, ReconcileError>;
}

/// Reconciler that only logs what it would do.
///
/// Used by the binary when no business rules are plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunReconciler;

#[async_trait]
impl ServiceReconciler for DryRunReconciler {
    async fn reconcile(&self, service: &Service) -> Result<Reconciled, ReconcileError> {
        info!(resource = %namespace_and_name(service), "dry-run: would expose service");
        Ok(Reconciled::Done)
    }

    async fn reconcile_on_delete(
        &self,
        service: &Service,
    ) -> Result<Reconciled, ReconcileError> {
        info!(resource = %namespace_and_name(service), "dry-run: would de-expose service");
        Ok(Reconciled::Done)
    }
}

#[async_trait]
impl VisitorGroupReconciler for DryRunReconciler {
    async fn reconcile(&self, group: &VisitorGroup) -> Result<Reconciled, ReconcileError> {
        info!(
            visitor_group = %namespace_and_name(group),
            sources = group.spec.sources.len(),
            "dry-run: would refresh ingresses using visitor group"
        );
        Ok(Reconciled::Done)
    }
}
