//! Test utilities for operator tests.
//!
//! Provides a scriptable watch source, recording handler and reconciler,
//! and Service fixtures.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::WatchEvent;
use kube::Resource;
use tokio::time::Instant;

use crate::config::labels::EXPOSE_LABEL_KEY;
use crate::reconciler::{ReconcileError, Reconciled, ServiceReconciler};
use crate::resource::namespace_and_name;
use crate::watch::{EventHandler, EventStream, WatchAction, WatchError, WatchSource};

/// Feeds events into one scripted subscription
pub type StreamFeed<K> = UnboundedSender<Result<WatchEvent<K>, WatchError>>;

/// Watch source replaying a queue of scripted subscription outcomes.
///
/// Once the script is exhausted every `subscribe` fails.
pub struct FakeSource<K> {
    script: Mutex<VecDeque<Result<EventStream<K>, WatchError>>>,
    calls: Mutex<Vec<Instant>>,
}

impl<K: Send + 'static> FakeSource<K> {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful subscription and return the feed for its stream.
    ///
    /// Dropping the feed ends the stream.
    pub fn push_stream(&self) -> StreamFeed<K> {
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().unwrap().push_back(Ok(rx.boxed()));
        tx
    }

    /// Queue a failed subscription.
    pub fn push_failure(&self, reason: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(WatchError::Disconnected(reason.to_string())));
    }

    /// Instants at which `subscribe` was called
    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl<K: Send + 'static> WatchSource<K> for FakeSource<K> {
    async fn subscribe(&self) -> Result<EventStream<K>, WatchError> {
        self.calls.lock().unwrap().push(Instant::now());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(WatchError::Disconnected("no scripted subscription".into())))
    }
}

/// Handler that records `(action, namespace/name)` for every event
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(WatchAction, String)>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<(WatchAction, String)> {
        self.events.lock().unwrap().clone()
    }
}

impl<K: Resource> EventHandler<K> for RecordingHandler {
    fn on_event(&self, action: WatchAction, resource: K) {
        self.events
            .lock()
            .unwrap()
            .push((action, namespace_and_name(&resource)));
    }
}

/// Service fixture; `expose` sets the expose label to the given value.
pub fn service(namespace: &str, name: &str, expose: Option<&str>) -> Service {
    let labels = expose.map(|value| {
        BTreeMap::from([(EXPOSE_LABEL_KEY.to_string(), value.to_string())])
    });

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{namespace}-{name}-uid")),
            labels,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reconciliation path taken by a [`RecordingReconciler`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileCall {
    Expose,
    Cleanup,
}

/// Service reconciler recording every call.
///
/// Services named with [`RecordingReconciler::not_managed`] answer
/// `NotManaged`, those named with [`RecordingReconciler::failing`] fail.
#[derive(Default)]
pub struct RecordingReconciler {
    calls: Mutex<Vec<(ReconcileCall, Service)>>,
    not_managed: HashSet<String>,
    failing: HashSet<String>,
}

impl RecordingReconciler {
    pub fn not_managed(mut self, name: &str) -> Self {
        self.not_managed.insert(name.to_string());
        self
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// `(path, namespace/name)` of every call, in call order
    pub fn calls(&self) -> Vec<(ReconcileCall, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(call, svc)| (*call, namespace_and_name(svc)))
            .collect()
    }

    /// Snapshots passed to the reconciler, in call order
    pub fn snapshots(&self) -> Vec<Service> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, svc)| svc.clone())
            .collect()
    }

    fn record(&self, call: ReconcileCall, service: &Service) -> Result<Reconciled, ReconcileError> {
        self.calls.lock().unwrap().push((call, service.clone()));

        let name = service.metadata.name.clone().unwrap_or_default();
        let resource = namespace_and_name(service);
        if self.failing.contains(&name) {
            Err(ReconcileError::Failed {
                resource,
                reason: "scripted failure".to_string(),
            })
        } else if self.not_managed.contains(&name) {
            Ok(Reconciled::not_managed(resource))
        } else {
            Ok(Reconciled::Done)
        }
    }
}

#[async_trait]
impl ServiceReconciler for RecordingReconciler {
    async fn reconcile(&self, service: &Service) -> Result<Reconciled, ReconcileError> {
        self.record(ReconcileCall::Expose, service)
    }

    async fn reconcile_on_delete(&self, service: &Service) -> Result<Reconciled, ReconcileError> {
        self.record(ReconcileCall::Cleanup, service)
    }
}
