use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ingress_access_operator::controllers::retry::RetryTracker;
use ingress_access_operator::controllers::visitorgroup::{self, VisitorGroupContext};
use ingress_access_operator::reconciler::DryRunReconciler;
use ingress_access_operator::{OperatorConfig, ServiceController};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("ingress-access-operator starting");

    let config = OperatorConfig::from_env().context("Invalid operator configuration")?;

    info!(
        debounce_ms = config.debounce_window().as_millis() as u64,
        retry_base_ms = config.retry_backoff().base().as_millis() as u64,
        retry_max_ms = config.retry_backoff().max().as_millis() as u64,
        "Loaded configuration"
    );

    // Create Kubernetes client
    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let reconciler = Arc::new(DryRunReconciler);
    let services = ServiceController::from_client(kube_client.clone(), reconciler.clone(), &config);
    let ctx = Arc::new(VisitorGroupContext::new(
        kube_client.clone(),
        reconciler,
        Arc::new(RetryTracker::new(config.retry_backoff())),
    ));
    let shutdown = CancellationToken::new();

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    services.start();
    let mut visitorgroups = tokio::spawn(visitorgroup::run(kube_client, ctx, shutdown.clone()));

    info!("All controllers started");

    let exit = select! {
        result = &mut visitorgroups => {
            // Controller failure should trigger pod restart
            Some(handle_controller_exit("VisitorGroup", result))
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            None
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            None
        }
    };

    // Graceful shutdown
    info!(
        grace_seconds = config.shutdown_grace().as_secs(),
        "Starting graceful shutdown"
    );
    services.stop();
    shutdown.cancel();

    if exit.is_none() {
        match timeout(config.shutdown_grace(), visitorgroups).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "VisitorGroup controller failed during shutdown"),
            Err(_) => warn!("VisitorGroup controller did not stop within grace period"),
        }
    }
    info!("Shutdown complete");

    match exit {
        Some(result) => result.context("Controller failure"),
        None => Ok(()),
    }
}

/// Handle a controller task exit, returning an error to trigger pod restart
fn handle_controller_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            error!(controller = name, "Controller exited unexpectedly");
            bail!("{} controller exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(controller = name, "Controller was cancelled");
            bail!("{} controller was cancelled", name)
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}
