//! Custom Resource Definitions for triage
//!
//! The owned API group is `triage.dev/v1alpha1`: MachineRemediation,
//! NodeRecovery, MachineDisruptionBudget, and MachineHealthCheck. The
//! foreign types (cluster-api Machine/MachineSet/MachineDeployment and
//! the metal3 BareMetalHost) are modeled with the fields triage touches;
//! their CRDs are installed by their own operators.

mod baremetal;
mod budget;
mod healthcheck;
mod machine;
mod recovery;
mod remediation;

pub use baremetal::{BareMetalHost, BareMetalHostSpec, BareMetalHostStatus};
pub use budget::{
    MachineDisruptionBudget, MachineDisruptionBudgetSpec, MachineDisruptionBudgetStatus,
};
pub use healthcheck::{
    MachineHealthCheck, MachineHealthCheckSpec, MachineHealthCheckStatus, RemediationStrategy,
    TargetedCondition, TargetedMachine,
};
pub use machine::{
    Machine, MachineDeployment, MachineDeploymentSpec, MachineSet, MachineSetSpec, MachineSpec,
    MachineStatus,
};
pub use recovery::{NodeRecovery, NodeRecoveryPhase, NodeRecoverySpec, NodeRecoveryStatus};
pub use remediation::{
    MachineRemediation, MachineRemediationSpec, MachineRemediationStatus, RemediationState,
    RemediationType,
};
