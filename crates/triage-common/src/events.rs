//! Kubernetes Event recording for triage controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "RebootStarted")
    /// * `action` - What action was taken (e.g. "Remediate")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "triage-remediation-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored; no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Reboot remediation transitions
    /// Power-off requested, the reboot protocol is running
    pub const REBOOT_STARTED: &str = "RebootStarted";
    /// Node returned Ready (or the reboot was skipped for a host already off)
    pub const REBOOT_SUCCEEDED: &str = "RebootSucceeded";
    /// Reboot timed out; the node is removed from the cluster
    pub const REBOOT_FAILED: &str = "RebootFailed";

    // Node-recovery outcomes
    /// Replacement machine healed the node
    pub const NODE_RECOVERY_SUCCEEDED: &str = "NodeRecoverySucceeded";
    /// Replacement did not heal the node within the remediation timeout
    pub const NODE_RECOVERY_FAILED: &str = "NodeRecoveryFailed";
    /// Backing machine deleted under expectation tracking
    pub const MACHINE_DELETED: &str = "MachineDeleted";
    /// Replacement machine created from the snapshot
    pub const MACHINE_CREATED: &str = "MachineCreated";

    // Disruption-budget observability
    /// Budget selector matched no machines
    pub const NO_MACHINES: &str = "NoMachines";
    /// Disrupted machines still within the disruption window
    pub const DISRUPTED_MACHINES: &str = "DisruptedMachines";
    /// A machine matched more than one disruption budget
    pub const AMBIGUOUS_BUDGETS: &str = "AmbiguousBudgets";

    // Health-check decisions
    /// A MachineRemediation was created for an unhealthy machine
    pub const REMEDIATION_CREATED: &str = "RemediationCreated";
    /// Remediation was skipped (budget denied or disabled by annotation)
    pub const REMEDIATION_SKIPPED: &str = "RemediationSkipped";
}

/// Well-known event action strings.
pub mod actions {
    /// Driving the reboot protocol for a request
    pub const REMEDIATE: &str = "Remediate";
    /// Replacing a backing machine
    pub const RECOVER: &str = "Recover";
    /// Recomputing a disruption budget
    pub const RECONCILE_BUDGET: &str = "ReconcileBudget";
    /// Evaluating machine health
    pub const CHECK_HEALTH: &str = "CheckHealth";
}
