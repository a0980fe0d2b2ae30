//! Common types for the triage operator: CRDs, errors, events, and shared mechanisms

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod expectations;
pub mod kube_utils;
pub mod leader_election;
pub mod reconcile;
pub mod selector;

pub use error::Error;
pub use reconcile::ReconcileError;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for triage system resources (recovery records, condition policy, leases)
pub const TRIAGE_SYSTEM_NAMESPACE: &str = "triage-system";

/// Annotation on a Machine naming its power-management host as `namespace/name`
pub const ANNOTATION_BARE_METAL_HOST: &str = "triage.dev/bare-metal-host";

/// Annotation on a Node naming its backing machine as `namespace/name`
pub const ANNOTATION_MACHINE: &str = "triage.dev/machine";

/// Annotation on a Node requesting a reboot remediation; cleared once the reboot succeeds
pub const ANNOTATION_REBOOT: &str = "triage.dev/reboot";

/// Annotation on a MachineHealthCheck suspending remediation while present
pub const ANNOTATION_DISABLE_REMEDIATION: &str = "triage.dev/disable-remediation";

/// Name of the Lease used for operator leader election
pub const LEADER_ELECTION_LEASE: &str = "triage-operator-leader";

/// Field manager for server-side apply and status patches issued by the operator
pub const FIELD_MANAGER: &str = "triage-operator";
