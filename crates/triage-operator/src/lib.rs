//! Triage Kubernetes operator for node-health remediation
//!
//! Five controllers share one binary: the remediation dispatcher, the
//! node-recovery phase machine, the disruption-budget reconciler, the
//! machine health check, and the reboot-marker watcher. All of them run
//! behind a single leader-election lease.

#![deny(missing_docs)]

/// Reconcilers for the triage CRDs and the node reboot marker
pub mod controller;
/// Controller future construction (one `build_*` per vertical slice)
pub mod controller_runner;
/// Remediation protocols (bare-metal reboot, machine recreate)
pub mod remediator;

#[cfg(test)]
pub(crate) mod fixtures;
