//! ingress-access-operator: reacts to labeled Services and VisitorGroups
//!
//! Services carrying `ingress.neo9.io/expose` are watched through a
//! self-healing [`watch::WatchSupervisor`]; each event is routed to the
//! expose or cleanup path and debounced per `namespace/name` before it reaches
//! a [`reconciler::ServiceReconciler`]. VisitorGroups run on a standard
//! `kube::runtime::Controller`.

pub mod config;
pub mod controllers;
pub mod debounce;
pub mod reconciler;
pub mod resource;
pub mod visitorgroup;
pub mod watch;

#[cfg(test)]
mod test_utils;

pub use config::OperatorConfig;
pub use controllers::service::ServiceController;
pub use visitorgroup::VisitorGroup;
