//! MachineHealthCheck CRD: which machines are watched and how they are fixed.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How an unhealthy machine targeted by this check is remediated.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemediationStrategy {
    /// Power-cycle the backing host
    #[default]
    Reboot,
    /// Delete and recreate the backing machine
    Recreate,
}

/// Spec for the MachineHealthCheck resource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "triage.dev",
    version = "v1alpha1",
    kind = "MachineHealthCheck",
    plural = "machinehealthchecks",
    shortname = "mhc",
    status = "MachineHealthCheckStatus",
    namespaced
)]
#[kube(printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.remediationStrategy"}"#)]
#[kube(printcolumn = r#"{"name":"Healthy","type":"integer","jsonPath":".status.totalHealthyMachines"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckSpec {
    /// Label selector for the machines whose health is exercised
    pub selector: LabelSelector,
    /// Remediation strategy for unhealthy targets; reboot when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_strategy: Option<RemediationStrategy>,
}

/// Observed status of a MachineHealthCheck, recomputed every pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckStatus {
    /// Machines targeted by the selector and their health verdicts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targeted_machines: Vec<TargetedMachine>,
    /// Condition rules the verdicts were computed against
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targeted_conditions: Vec<TargetedCondition>,
    /// Number of targeted machines currently healthy
    pub total_healthy_machines: i32,
}

/// Health verdict for one targeted machine.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetedMachine {
    /// Machine name
    pub name: String,
    /// Whether the machine's node passed the condition rules
    pub healthy: bool,
    /// Node condition types that marked the machine unhealthy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhealthy_conditions: Vec<String>,
}

/// One (type, status) condition rule in effect for this check.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetedCondition {
    /// Node condition type (e.g. `Ready`)
    pub name: String,
    /// Condition status that counts as unhealthy (e.g. `Unknown`)
    pub status: String,
}

impl MachineHealthCheck {
    /// Remediation strategy with the reboot default applied.
    pub fn strategy(&self) -> RemediationStrategy {
        self.spec.remediation_strategy.unwrap_or_default()
    }
}
