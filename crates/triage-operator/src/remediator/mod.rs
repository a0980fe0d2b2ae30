//! Remediation protocols for unhealthy machines.
//!
//! The dispatcher routes each MachineRemediation to one of these by its
//! spec type. Protocols advance the request by at most one transition per
//! call and must tolerate being re-invoked with a stale view.

mod baremetal;

pub use baremetal::{BareMetalRemediator, RemediationClient, RemediationClientImpl, REBOOT_TIMEOUT};

#[cfg(test)]
pub use baremetal::MockRemediationClient;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use triage_common::crd::MachineRemediation;
use triage_common::Error;

/// A remediation protocol the dispatcher can drive.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Advance a reboot request one step.
    async fn reboot(&self, request: &MachineRemediation) -> Result<(), Error>;

    /// Advance a recreate request one step.
    async fn recreate(&self, request: &MachineRemediation) -> Result<(), Error>;
}
