//! Reconcile-loop plumbing shared by all triage controllers.
//!
//! `ReconcileError` is the lightweight per-pass error type handed to the
//! kube runtime; `default_error_policy` is the shared requeue policy.
//! Terminal outcomes (timeouts, budget exhaustion decisions) are states
//! and events, not errors; only failures that a later pass can repair
//! flow through here.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use thiserror::Error;
use tracing::warn;

use crate::error::Error;

/// Delay applied by [`default_error_policy`] before the failed key is retried.
pub const ERROR_REQUEUE_SECS: u64 = 30;

/// Base delay in seconds for the exponential retry backoff.
pub const RETRY_BASE_DELAY_SECS: u64 = 5;

/// Cap in seconds for the exponential retry backoff (16 minutes).
pub const RETRY_MAX_DELAY_SECS: u64 = 960;

/// Per-pass error returned by controller reconcile functions.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API failure; usually transient
    #[error("Kubernetes API error: {0}")]
    Kube(String),

    /// Configuration that needs external correction
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal failure in a shared mechanism
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<kube::Error> for ReconcileError {
    fn from(err: kube::Error) -> Self {
        ReconcileError::Kube(err.to_string())
    }
}

impl From<Error> for ReconcileError {
    fn from(err: Error) -> Self {
        match err {
            Error::Kube { source } => ReconcileError::Kube(source.to_string()),
            Error::Validation { object, message } => {
                ReconcileError::Validation(format!("{object}: {message}"))
            }
            Error::Serialization { source } => ReconcileError::Internal(source.to_string()),
            Error::Yaml { source } => ReconcileError::Internal(source.to_string()),
            Error::Internal { context, message } => {
                ReconcileError::Internal(format!("{context}: {message}"))
            }
        }
    }
}

/// Shared error policy: log a warning and requeue after a fixed delay.
pub fn default_error_policy<K, C>(_obj: Arc<K>, error: &ReconcileError, _ctx: Arc<C>) -> Action {
    warn!(error = %error, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS))
}

/// Exponential backoff delay for the given retry count: `min(5s * 2^n, 16m)`.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let secs = RETRY_BASE_DELAY_SECS
        .saturating_mul(2u64.saturating_pow(retry_count))
        .min(RETRY_MAX_DELAY_SECS);
    Duration::from_secs(secs)
}
