//! Operator configuration and well-known label constants

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::controllers::retry::Backoff;

/// Default quiescence window before a debounced reconciliation runs
const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 1000;

/// Default first delay before resubscribing a terminated watch
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Default cap for the resubscription delay
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Default time granted to in-flight work after shutdown is requested
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Labels used by the operator
pub mod labels {
    /// Label selecting the Services the operator watches
    pub const EXPOSE_LABEL_KEY: &str = "ingress.neo9.io/expose";
    /// Label value (case-insensitive) marking a Service as "should expose"
    pub const EXPOSE_LABEL_VALUE: &str = "true";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("debounce window must be greater than zero")]
    ZeroDebounceWindow,
    #[error("retry base delay must be greater than zero")]
    ZeroRetryDelay,
    #[error("retry max delay ({max:?}) must not be less than base delay ({base:?})")]
    RetryMaxBelowBase { base: Duration, max: Duration },
}

/// Runtime configuration of the event core.
///
/// Fields are private to keep the invariants checked in [`OperatorConfig::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    debounce_window: Duration,
    retry_backoff: Backoff,
    shutdown_grace: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(DEFAULT_DEBOUNCE_WINDOW_MS),
            retry_backoff: Backoff::new(
                Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
                Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            ),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl OperatorConfig {
    /// Create a configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `debounce_window` is zero
    /// - the backoff base delay is zero
    /// - the backoff cap is below its base delay
    pub fn new(
        debounce_window: Duration,
        retry_backoff: Backoff,
        shutdown_grace: Duration,
    ) -> Result<Self, ConfigError> {
        if debounce_window.is_zero() {
            return Err(ConfigError::ZeroDebounceWindow);
        }
        if retry_backoff.base().is_zero() {
            return Err(ConfigError::ZeroRetryDelay);
        }
        if retry_backoff.max() < retry_backoff.base() {
            return Err(ConfigError::RetryMaxBelowBase {
                base: retry_backoff.base(),
                max: retry_backoff.max(),
            });
        }

        Ok(Self {
            debounce_window,
            retry_backoff,
            shutdown_grace,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DEBOUNCE_WINDOW_MS`: quiescence window per resource (default: 1000)
    /// - `WATCH_RETRY_BASE_DELAY_MS`: first resubscription delay (default: 1000)
    /// - `WATCH_RETRY_MAX_DELAY_MS`: resubscription delay cap (default: 60000)
    /// - `SHUTDOWN_GRACE_SECS`: grace period after shutdown (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let debounce_window = parse_duration(
            &lookup,
            "DEBOUNCE_WINDOW_MS",
            Duration::from_millis(DEFAULT_DEBOUNCE_WINDOW_MS),
            Duration::from_millis,
        );
        let base = parse_duration(
            &lookup,
            "WATCH_RETRY_BASE_DELAY_MS",
            Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            Duration::from_millis,
        );
        let max = parse_duration(
            &lookup,
            "WATCH_RETRY_MAX_DELAY_MS",
            Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            Duration::from_millis,
        );
        let shutdown_grace = parse_duration(
            &lookup,
            "SHUTDOWN_GRACE_SECS",
            Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            Duration::from_secs,
        );

        Self::new(debounce_window, Backoff::new(base, max), shutdown_grace)
    }

    /// Quiescence window applied per resource identity.
    pub fn debounce_window(&self) -> Duration {
        self.debounce_window
    }

    /// Backoff applied between resubscription attempts of a watch.
    pub fn retry_backoff(&self) -> Backoff {
        self.retry_backoff
    }

    /// Time granted to in-flight work once shutdown starts.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

/// Parse a duration variable, logging and falling back to the default on failure.
fn parse_duration<F>(
    lookup: &F,
    var_name: &str,
    default: Duration,
    unit: fn(u64) -> Duration,
) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var_name) {
        Some(v) => match v.trim().parse::<u64>() {
            Ok(amount) => unit(amount),
            Err(e) => {
                warn!(
                    env_var = var_name,
                    value = %v,
                    error = %e,
                    default_ms = default.as_millis() as u64,
                    "Failed to parse duration env var, using default"
                );
                default
            }
        },
        None => default,
    }
}
