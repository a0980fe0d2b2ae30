//! Reconcilers, one per watched resource.
//!
//! Every reconciler follows the same shape: a mockable client trait for
//! its Kubernetes access, a `Context` carried through the kube runtime,
//! and a `reconcile` entry point that works off fresh API reads rather
//! than the dispatched cache view wherever state must not regress.

/// Disruption-budget accounting and the decrement protocol.
pub mod budget;
/// Health-check sweeps that open remediation requests.
pub mod healthcheck;
/// Reboot-marker annotation handling on nodes.
pub mod marker;
/// Node replacement through the recovery phase machine.
pub mod recovery;
/// Dispatch of remediation requests to their protocol.
pub mod remediation;
