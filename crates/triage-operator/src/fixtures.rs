//! Object constructors shared by the controller tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time};
use kube::Resource;

use triage_common::crd::{
    BareMetalHost, BareMetalHostSpec, BareMetalHostStatus, Machine, MachineDeployment,
    MachineDeploymentSpec, MachineDisruptionBudget, MachineDisruptionBudgetSpec,
    MachineHealthCheck, MachineHealthCheckSpec, MachineRemediation, MachineRemediationSpec,
    MachineRemediationStatus, MachineSet, MachineSetSpec, MachineSpec, MachineStatus, NodeRecovery,
    NodeRecoverySpec, RemediationState, RemediationStrategy, RemediationType,
};
use triage_common::{ANNOTATION_BARE_METAL_HOST, ANNOTATION_MACHINE, ANNOTATION_REBOOT};

/// Namespace the machine fixtures live in.
pub const MACHINE_NAMESPACE: &str = "cluster";
/// Namespace the host fixtures live in.
pub const HOST_NAMESPACE: &str = "metal";

pub fn minutes_ago(now: DateTime<Utc>, minutes: i64) -> Time {
    Time(now - Duration::minutes(minutes))
}

/// Stamp a deletion timestamp so the object reads as terminating.
pub fn deleting<K: Resource>(mut obj: K) -> K {
    obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
    obj
}

pub fn host(name: &str, online: bool, powered_on: bool) -> BareMetalHost {
    let mut host = BareMetalHost::new(
        name,
        BareMetalHostSpec {
            online,
            other: BTreeMap::new(),
        },
    );
    host.metadata.namespace = Some(HOST_NAMESPACE.to_string());
    host.status = Some(BareMetalHostStatus {
        powered_on,
        other: BTreeMap::new(),
    });
    host
}

pub fn machine(name: &str, node_name: Option<&str>) -> Machine {
    let mut machine = Machine::new(name, MachineSpec::default());
    machine.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    machine.metadata.uid = Some(format!("uid-{name}"));
    if let Some(node) = node_name {
        machine.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                name: Some(node.to_string()),
                ..Default::default()
            }),
            phase: None,
        });
    }
    machine
}

pub fn machine_with_host(name: &str, node_name: Option<&str>, host_name: &str) -> Machine {
    let mut machine = machine(name, node_name);
    machine
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            ANNOTATION_BARE_METAL_HOST.to_string(),
            format!("{HOST_NAMESPACE}/{host_name}"),
        );
    machine
}

pub fn labeled_machine(name: &str, labels: &[(&str, &str)]) -> Machine {
    let mut machine = machine(name, Some(&format!("node-{name}")));
    machine.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    machine
}

/// Give the machine a controller owner reference pointing at a MachineSet.
pub fn owned_by_machine_set(mut machine: Machine, set_name: &str) -> Machine {
    machine.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "MachineSet".to_string(),
        name: set_name.to_string(),
        uid: format!("uid-{set_name}"),
        controller: Some(true),
        ..Default::default()
    }]);
    machine
}

pub fn machine_set(name: &str, replicas: i32) -> MachineSet {
    let mut set = MachineSet::new(
        name,
        MachineSetSpec {
            replicas: Some(replicas),
            selector: None,
            other: BTreeMap::new(),
        },
    );
    set.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    set.metadata.uid = Some(format!("uid-{name}"));
    set
}

/// Give the machine set a controller owner reference pointing at a
/// MachineDeployment.
pub fn set_owned_by_deployment(mut set: MachineSet, deployment_name: &str) -> MachineSet {
    set.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "MachineDeployment".to_string(),
        name: deployment_name.to_string(),
        uid: format!("uid-{deployment_name}"),
        controller: Some(true),
        ..Default::default()
    }]);
    set
}

pub fn machine_deployment(name: &str, replicas: i32) -> MachineDeployment {
    let mut deployment = MachineDeployment::new(
        name,
        MachineDeploymentSpec {
            replicas: Some(replicas),
            selector: None,
            other: BTreeMap::new(),
        },
    );
    deployment.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    deployment.metadata.uid = Some(format!("uid-{name}"));
    deployment
}

pub fn node(name: &str, ready: bool) -> Node {
    let status = if ready { "True" } else { "Unknown" };
    node_with_condition(name, "Ready", status, Utc::now())
}

pub fn node_with_condition(
    name: &str,
    type_: &str,
    status: &str,
    transition: DateTime<Utc>,
) -> Node {
    Node {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: type_.to_string(),
                status: status.to_string(),
                last_transition_time: Some(Time(transition)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Annotate the node with the key of its backing machine.
pub fn node_backed_by(mut node: Node, machine_name: &str) -> Node {
    node.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            ANNOTATION_MACHINE.to_string(),
            format!("{MACHINE_NAMESPACE}/{machine_name}"),
        );
    node
}

/// Put the reboot marker on the node.
pub fn node_with_reboot_marker(mut node: Node) -> Node {
    node.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_REBOOT.to_string(), String::new());
    node
}

pub fn remediation(
    machine_name: &str,
    remediation_type: RemediationType,
    state: Option<RemediationState>,
) -> MachineRemediation {
    let mut mr = MachineRemediation::new(
        machine_name,
        MachineRemediationSpec {
            remediation_type,
            machine_name: machine_name.to_string(),
        },
    );
    mr.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    if let Some(state) = state {
        mr.status = Some(MachineRemediationStatus {
            state: Some(state),
            reason: None,
            start_time: Some(Time(Utc::now())),
            end_time: None,
        });
    }
    mr
}

pub fn recovery(node_name: &str) -> NodeRecovery {
    let mut record = NodeRecovery::new(
        node_name,
        NodeRecoverySpec {
            node_name: node_name.to_string(),
        },
    );
    record.metadata.namespace = Some(triage_common::TRIAGE_SYSTEM_NAMESPACE.to_string());
    record
}

pub fn health_check(
    name: &str,
    match_labels: &[(&str, &str)],
    strategy: Option<RemediationStrategy>,
) -> MachineHealthCheck {
    let mut check = MachineHealthCheck::new(
        name,
        MachineHealthCheckSpec {
            selector: LabelSelector {
                match_labels: Some(
                    match_labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            remediation_strategy: strategy,
        },
    );
    check.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    check
}

pub fn budget(name: &str, match_labels: &[(&str, &str)], min_available: i32) -> MachineDisruptionBudget {
    let mut budget = MachineDisruptionBudget::new(
        name,
        MachineDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(
                    match_labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            min_available: Some(min_available),
            max_unavailable: None,
        },
    );
    budget.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    budget.metadata.generation = Some(1);
    budget
}

/// Event publisher that records reasons instead of talking to the API.
#[derive(Default)]
pub struct RecordingEvents {
    reasons: std::sync::Mutex<Vec<String>>,
}

impl RecordingEvents {
    /// Reasons of every event published so far, in order.
    pub fn reasons(&self) -> Vec<String> {
        self.reasons
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl triage_common::events::EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: kube::runtime::events::EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(reason.to_string());
    }
}
