//! MachineDisruptionBudget CRD: the disruption ledger for a machine fleet.
//!
//! The status carries the shared `disruptionsAllowed` counter and the
//! disrupted-machine map. Both are mutated only through the admission
//! protocols; `observedGeneration` pins the spec generation the counters
//! were computed against.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec for the MachineDisruptionBudget resource. Exactly one of
/// `minAvailable` / `maxUnavailable` is expected to be set.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "triage.dev",
    version = "v1alpha1",
    kind = "MachineDisruptionBudget",
    plural = "machinedisruptionbudgets",
    shortname = "mdb",
    status = "MachineDisruptionBudgetStatus",
    namespaced
)]
#[kube(printcolumn = r#"{"name":"Allowed","type":"integer","jsonPath":".status.disruptionsAllowed"}"#)]
#[kube(printcolumn = r#"{"name":"Healthy","type":"integer","jsonPath":".status.currentHealthy"}"#)]
#[kube(printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredHealthy"}"#)]
#[kube(printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.total"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MachineDisruptionBudgetSpec {
    /// Label selector for governed machines. Absent: governs nothing.
    /// Present but empty: matches nothing (deliberately unlike the
    /// usual match-everything semantics, to make an accidental
    /// cluster-wide budget impossible).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Minimum number of governed machines that must stay healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,
    /// Maximum number of governed machines that may be unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// Observed status of a MachineDisruptionBudget.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDisruptionBudgetStatus {
    /// Fleet size derived from the owner walk over matched machines
    pub total: i32,
    /// Healthy machines the budget requires
    pub desired_healthy: i32,
    /// Healthy machines currently observed
    pub current_healthy: i32,
    /// Remaining disruptions; consumed through the retry-decrement protocol
    pub disruptions_allowed: i32,
    /// Machine name -> disruption start time, expired after a fixed window
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disrupted_machines: BTreeMap<String, Time>,
    /// Spec generation the counters were computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MachineDisruptionBudget {
    /// Remaining disruptions, zero when no status has been computed yet.
    pub fn disruptions_allowed(&self) -> i32 {
        self.status.as_ref().map_or(0, |s| s.disruptions_allowed)
    }

    /// Whether the computed status is current for the spec generation.
    pub fn status_is_current(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        observed == self.metadata.generation
    }
}
