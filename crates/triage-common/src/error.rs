//! Error types shared across the triage controllers.
//!
//! One enum covers the failure classes the controllers care about:
//! Kubernetes API failures (usually transient), validation failures
//! (bad configuration that needs a human), serialization failures, and
//! internal invariant violations. `is_retryable()` is what the
//! controllers consult when deciding between requeue-and-retry and
//! give-up-and-report.

use thiserror::Error;

/// Errors produced by triage controllers and shared mechanisms.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (get/list/create/update/delete/patch)
    #[error("Kubernetes API error: {source}")]
    Kube {
        /// Underlying kube client error
        #[from]
        source: kube::Error,
    },

    /// Configuration or object state that needs external correction
    #[error("validation failed for {object}: {message}")]
    Validation {
        /// Object the validation applies to (kind/name or a field path)
        object: String,
        /// What is wrong with it
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serde_json error
        #[from]
        source: serde_json::Error,
    },

    /// YAML parse error (condition policy, CRD manifests)
    #[error("YAML error: {source}")]
    Yaml {
        /// Underlying serde_yaml error
        #[from]
        source: serde_yaml::Error,
    },

    /// Internal invariant violation; `context` names the mechanism that failed
    #[error("internal error in {context}: {message}")]
    Internal {
        /// Mechanism or code path that failed
        context: String,
        /// Description of the failure
        message: String,
    },
}

impl Error {
    /// Create a validation error for the given object.
    pub fn validation(object: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with the given context.
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Whether a retry can plausibly succeed without external correction.
    ///
    /// Kubernetes 4xx responses are treated as non-retryable except for
    /// request timeout (408), conflict (409, the optimistic-concurrency
    /// retry signal), and throttling (429). Validation and serialization
    /// failures always need external correction.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => {
                    matches!(ae.code, 408 | 409 | 429)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Yaml { .. } => false,
            Error::Internal { .. } => false,
        }
    }
}
