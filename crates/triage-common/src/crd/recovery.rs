//! NodeRecovery CRD: one record per unhealthy node being replaced.
//!
//! Records live in the triage system namespace, named after the node.
//! The phase machine runs `Init -> Wait -> Remediate` and ends by
//! deleting the record; a node that turns Ready at any point short-cuts
//! straight to deletion (false alarm).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine::MachineSpec;

/// Phase of a node-recovery record.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeRecoveryPhase {
    /// Record created; node observed not-Ready for the first time
    #[default]
    Init,
    /// Grace window running; the node may still come back on its own
    Wait,
    /// Backing machine deleted; waiting for the replacement to heal the node
    Remediate,
}

/// Spec for the NodeRecovery resource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "triage.dev",
    version = "v1alpha1",
    kind = "NodeRecovery",
    plural = "noderecoveries",
    status = "NodeRecoveryStatus",
    namespaced
)]
#[kube(printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecoverySpec {
    /// Name of the unhealthy node this record recovers
    pub node_name: String,
}

/// Observed status of a NodeRecovery, including the machine snapshot
/// captured before the backing machine is deleted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecoveryStatus {
    /// Current phase of the recovery machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodeRecoveryPhase>,
    /// Human-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the current phase started; grace and remediation timeouts
    /// measure from here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    /// Consecutive deferrals while resolving the backing machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Name of the backing machine, captured before deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    /// Namespace of the backing machine, captured before deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_namespace: Option<String>,
    /// Full spec snapshot the replacement machine is created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_spec: Option<MachineSpec>,
}

impl NodeRecovery {
    /// Current phase; a record without status is still in `Init`.
    pub fn phase(&self) -> NodeRecoveryPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    /// Phase start time, if stamped.
    pub fn start_time(&self) -> Option<&Time> {
        self.status.as_ref().and_then(|s| s.start_time.as_ref())
    }

    /// Retry counter for machine-resolution deferrals.
    pub fn retry_count(&self) -> u32 {
        self.status
            .as_ref()
            .and_then(|s| s.retry_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_has_expected_identity() {
        let crd = NodeRecovery::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("noderecoveries.triage.dev"));
        assert_eq!(crd.spec.names.kind, "NodeRecovery");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn phases_serialize_as_pascal_case() {
        for (phase, wire) in [
            (NodeRecoveryPhase::Init, "Init"),
            (NodeRecoveryPhase::Wait, "Wait"),
            (NodeRecoveryPhase::Remediate, "Remediate"),
        ] {
            assert_eq!(serde_json::to_value(phase).unwrap(), wire);
        }
    }

    #[test]
    fn record_without_status_is_in_init() {
        let rec = NodeRecovery::new(
            "worker-0",
            NodeRecoverySpec {
                node_name: "worker-0".to_string(),
            },
        );
        assert_eq!(rec.phase(), NodeRecoveryPhase::Init);
        assert_eq!(rec.retry_count(), 0);
    }
}
