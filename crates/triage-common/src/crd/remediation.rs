//! MachineRemediation CRD: a single bounded remediation request for one machine.
//!
//! One live request exists per unhealthy target. The request is created by
//! the health-check reconciler or the reboot-marker controller, mutated
//! only by the remediation state machine, and deleted (or left inert) once
//! it reaches a terminal state. `state` never regresses.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Remediation protocol applied to an unhealthy machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RemediationType {
    /// Power-cycle the backing host through its power-management record
    #[default]
    Reboot,
    /// Delete and recreate the backing machine via the node-recovery path
    Recreate,
}

/// State of a reboot remediation, monotonically non-decreasing through
/// `Started -> PowerOff -> PowerOn -> {Succeeded, Failed}`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RemediationState {
    /// Request observed, no power transition issued yet
    #[default]
    Started,
    /// Power-off requested, waiting for the host to report off
    PowerOff,
    /// Power-on requested, waiting for the node to report Ready
    PowerOn,
    /// Remediation finished; the node recovered (or never needed the reboot)
    Succeeded,
    /// Remediation failed; the node is removed from the cluster
    Failed,
}

impl RemediationState {
    /// Terminal states stop the state machine; only cleanup runs afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemediationState::Succeeded | RemediationState::Failed)
    }
}

/// Spec for the MachineRemediation resource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "triage.dev",
    version = "v1alpha1",
    kind = "MachineRemediation",
    plural = "machineremediations",
    shortname = "mr",
    status = "MachineRemediationStatus",
    namespaced
)]
#[kube(printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MachineRemediationSpec {
    /// Remediation protocol to apply
    #[serde(rename = "type")]
    pub remediation_type: RemediationType,
    /// Name of the machine to remediate, in the request's namespace
    pub machine_name: String,
}

/// Observed status of a MachineRemediation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRemediationStatus {
    /// Current state of the remediation protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RemediationState>,
    /// Human-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the protocol started; the timeout overlay measures from here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    /// When the protocol reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Time>,
}

impl MachineRemediationStatus {
    /// Initial status stamped when the state machine first observes a request.
    pub fn started(now: Time) -> Self {
        MachineRemediationStatus {
            state: Some(RemediationState::Started),
            reason: Some("Machine remediation started".to_string()),
            start_time: Some(now),
            end_time: None,
        }
    }
}

impl MachineRemediation {
    /// Current state; a request without status has not been observed yet.
    pub fn state(&self) -> Option<RemediationState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// Whether the request reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(|s| s.is_terminal())
    }

    /// Protocol start time, if the state machine already stamped one.
    pub fn start_time(&self) -> Option<&Time> {
        self.status.as_ref().and_then(|s| s.start_time.as_ref())
    }
}
