//! Bare-metal remediation: the reboot protocol and the recreate hand-off.
//!
//! The reboot drives `Started -> PowerOff -> PowerOn -> {Succeeded, Failed}`
//! through the machine's power-management record, one transition per pass.
//! State never regresses: every pass re-reads the request and a terminal
//! request only re-runs its idempotent cleanup. Recreate does not touch
//! power at all; it hands the machine's node to the recovery record and
//! reports what the recovery machine did.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use triage_common::conditions::node_ready;
use triage_common::crd::{
    BareMetalHost, Machine, MachineRemediation, MachineRemediationStatus, NodeRecovery,
    NodeRecoverySpec, RemediationState,
};
use triage_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use triage_common::kube_utils::{annotation, ignore_not_found, split_namespaced_key};
use triage_common::{
    Error, ANNOTATION_BARE_METAL_HOST, ANNOTATION_REBOOT, FIELD_MANAGER, TRIAGE_SYSTEM_NAMESPACE,
};

use super::Remediator;

/// A reboot that has not finished after this long is failed and the node
/// is removed from the cluster.
pub const REBOOT_TIMEOUT: Duration = Duration::from_secs(300);

/// A recreate with no recovery record in flight after this long is failed.
/// Covers the worst case of the recovery grace window plus its own
/// remediation timeout.
pub const RECREATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Status reason: the host was off before we touched it.
pub const REASON_SKIPPED_POWERED_OFF: &str =
    "Host already powered off by an operator, skipping the reboot";
/// Status reason: power-off has been requested.
pub const REASON_REBOOT_STARTED: &str = "Starting the reboot process";
/// Status reason: power-on has been requested, waiting for the node.
pub const REASON_REBOOT_IN_PROGRESS: &str = "Reboot in progress";
/// Status reason: the node reported Ready after the power cycle.
pub const REASON_REBOOT_SUCCEEDED: &str = "Reboot succeeded";
/// Status reason: the reboot did not finish inside [`REBOOT_TIMEOUT`].
pub const REASON_REBOOT_TIMED_OUT: &str = "Reboot failed on timeout";
/// Status reason: the node has been handed to the recovery machine.
pub const REASON_RECREATE_IN_PROGRESS: &str = "Waiting for the node-recovery record";
/// Status reason: the replacement machine healed the node.
pub const REASON_RECREATE_SUCCEEDED: &str = "Replacement machine healed the node";
/// Status reason: recovery finished without healing the node in time.
pub const REASON_RECREATE_TIMED_OUT: &str = "Recreate failed on timeout";

/// Kubernetes access needed by the remediation protocols.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemediationClient: Send + Sync {
    /// Fresh view of a remediation request; `None` when it is gone.
    async fn get_remediation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineRemediation>, Error>;

    /// Get a machine by namespace and name.
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// Get a power-management record by namespace and name.
    async fn get_host(&self, namespace: &str, name: &str) -> Result<Option<BareMetalHost>, Error>;

    /// Set the desired power state on a host. Only `spec.online` is
    /// touched; everything else on the host is left alone.
    async fn set_host_online(&self, namespace: &str, name: &str, online: bool)
        -> Result<(), Error>;

    /// Get a node by name.
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Remove the reboot marker from a node. A missing node or marker is
    /// not an error.
    async fn clear_reboot_marker(&self, node_name: &str) -> Result<(), Error>;

    /// Delete a node. A missing node is not an error.
    async fn delete_node(&self, node_name: &str) -> Result<(), Error>;

    /// Patch the status of a remediation request.
    async fn patch_remediation_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineRemediationStatus,
    ) -> Result<(), Error>;

    /// Make sure a recovery record exists for the node. Races with the
    /// node watcher are tolerated.
    async fn ensure_node_recovery(&self, node_name: &str) -> Result<(), Error>;

    /// Whether a recovery record currently exists for the node.
    async fn node_recovery_exists(&self, node_name: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation.
pub struct RemediationClientImpl {
    client: Client,
}

impl RemediationClientImpl {
    /// Wrap the given kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemediationClient for RemediationClientImpl {
    async fn get_remediation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineRemediation>, Error> {
        let api: Api<MachineRemediation> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_host(&self, namespace: &str, name: &str) -> Result<Option<BareMetalHost>, Error> {
        let api: Api<BareMetalHost> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn set_host_online(
        &self,
        namespace: &str,
        name: &str,
        online: bool,
    ) -> Result<(), Error> {
        let api: Api<BareMetalHost> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "online": online } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn clear_reboot_marker(&self, node_name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "annotations": { ANNOTATION_REBOOT: null } }
        });
        ignore_not_found(
            api.patch(node_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await,
        )?;
        Ok(())
    }

    async fn delete_node(&self, node_name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        ignore_not_found(api.delete(node_name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn patch_remediation_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineRemediationStatus,
    ) -> Result<(), Error> {
        triage_common::kube_utils::patch_resource_status::<MachineRemediation>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await
    }

    async fn ensure_node_recovery(&self, node_name: &str) -> Result<(), Error> {
        let api: Api<NodeRecovery> = Api::namespaced(self.client.clone(), TRIAGE_SYSTEM_NAMESPACE);
        if api.get_opt(node_name).await?.is_some() {
            return Ok(());
        }
        let record = NodeRecovery::new(
            node_name,
            NodeRecoverySpec {
                node_name: node_name.to_string(),
            },
        );
        match api.create(&PostParams::default(), &record).await {
            Ok(_) => info!(node = %node_name, "created recovery record"),
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn node_recovery_exists(&self, node_name: &str) -> Result<bool, Error> {
        let api: Api<NodeRecovery> = Api::namespaced(self.client.clone(), TRIAGE_SYSTEM_NAMESPACE);
        Ok(api.get_opt(node_name).await?.is_some())
    }
}

/// Remediator for machines backed by bare-metal hosts.
pub struct BareMetalRemediator {
    kube: Arc<dyn RemediationClient>,
    events: Arc<dyn EventPublisher>,
}

impl BareMetalRemediator {
    /// Production remediator talking to the cluster.
    pub fn new(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "triage-remediation-controller",
        ));
        Self {
            kube: Arc::new(RemediationClientImpl::new(client)),
            events,
        }
    }

    /// Remediator with injected mock clients for unit tests.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn RemediationClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    async fn publish(
        &self,
        request: &MachineRemediation,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        self.events
            .publish(
                &request.object_ref(&()),
                type_,
                reason,
                actions::REMEDIATE,
                Some(note),
            )
            .await;
    }

    /// Status as stamped on the server, initializing it on the first pass.
    async fn load_status(
        &self,
        namespace: &str,
        name: &str,
        request: &MachineRemediation,
        now: DateTime<Utc>,
    ) -> Result<MachineRemediationStatus, Error> {
        match request.status.clone().filter(|s| s.state.is_some()) {
            Some(status) => Ok(status),
            None => {
                let status = MachineRemediationStatus::started(Time(now));
                self.kube
                    .patch_remediation_status(namespace, name, &status)
                    .await?;
                Ok(status)
            }
        }
    }

    async fn node_is_ready(&self, machine: &Machine) -> Result<bool, Error> {
        let Some(node_name) = machine.node_name() else {
            return Ok(false);
        };
        Ok(self.kube.get_node(node_name).await?.as_ref().is_some_and(node_ready))
    }

    /// Succeeded cleanup: drop the reboot marker so the node does not get
    /// re-queued for another power cycle.
    async fn cleanup_succeeded(&self, machine: &Machine) -> Result<(), Error> {
        if let Some(node_name) = machine.node_name() {
            self.kube.clear_reboot_marker(node_name).await?;
        }
        Ok(())
    }

    /// Failed cleanup: remove the node so the scheduler stops considering
    /// a machine that never came back.
    async fn cleanup_failed(&self, machine: &Machine) -> Result<(), Error> {
        if let Some(node_name) = machine.node_name() {
            self.kube.delete_node(node_name).await?;
        }
        Ok(())
    }

    /// Cleanup runs before the terminal write: if it fails the request is
    /// still non-terminal and the next pass retries it.
    async fn finish_succeeded(
        &self,
        namespace: &str,
        name: &str,
        machine: &Machine,
        status: &mut MachineRemediationStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.cleanup_succeeded(machine).await?;
        status.state = Some(RemediationState::Succeeded);
        status.reason = Some(reason.to_string());
        status.end_time = Some(Time(now));
        self.kube
            .patch_remediation_status(namespace, name, status)
            .await
    }

    async fn finish_failed(
        &self,
        namespace: &str,
        name: &str,
        machine: &Machine,
        status: &mut MachineRemediationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.cleanup_failed(machine).await?;
        status.state = Some(RemediationState::Failed);
        status.reason = Some(REASON_REBOOT_TIMED_OUT.to_string());
        status.end_time = Some(Time(now));
        self.kube
            .patch_remediation_status(namespace, name, status)
            .await
    }

    async fn step_reboot(
        &self,
        namespace: &str,
        name: &str,
        request: &MachineRemediation,
    ) -> Result<(), Error> {
        let machine_name = &request.spec.machine_name;
        let machine = self
            .kube
            .get_machine(namespace, machine_name)
            .await?
            .ok_or_else(|| {
                Error::validation(
                    format!("MachineRemediation/{name}"),
                    format!("machine {machine_name} not found"),
                )
            })?;
        let host_key = annotation(&machine.metadata, ANNOTATION_BARE_METAL_HOST).ok_or_else(
            || {
                Error::validation(
                    format!("Machine/{machine_name}"),
                    "no bare-metal host annotation",
                )
            },
        )?;
        let (host_namespace, host_name) = split_namespaced_key(host_key)?;
        let host = self
            .kube
            .get_host(&host_namespace, &host_name)
            .await?
            .ok_or_else(|| {
                Error::validation(
                    format!("BareMetalHost/{host_key}"),
                    "power-management record not found",
                )
            })?;

        let now = Utc::now();
        let mut status = self.load_status(namespace, name, request, now).await?;

        match status.state.unwrap_or_default() {
            RemediationState::Started => {
                if !host.powered_on() {
                    // someone already turned the host off; a power cycle
                    // on top of that would fight the operator
                    self.finish_succeeded(
                        namespace,
                        name,
                        &machine,
                        &mut status,
                        REASON_SKIPPED_POWERED_OFF,
                        now,
                    )
                    .await?;
                    self.publish(
                        request,
                        EventType::Normal,
                        reasons::REBOOT_SUCCEEDED,
                        REASON_SKIPPED_POWERED_OFF.to_string(),
                    )
                    .await;
                    return Ok(());
                }
                self.kube
                    .set_host_online(&host_namespace, &host_name, false)
                    .await?;
                status.state = Some(RemediationState::PowerOff);
                status.reason = Some(REASON_REBOOT_STARTED.to_string());
                self.kube
                    .patch_remediation_status(namespace, name, &status)
                    .await?;
                self.publish(
                    request,
                    EventType::Normal,
                    reasons::REBOOT_STARTED,
                    format!("powering off host {host_namespace}/{host_name}"),
                )
                .await;
            }
            RemediationState::PowerOff => {
                if host.powered_on() {
                    debug!(request = %name, "waiting for the host to power off");
                } else {
                    self.kube
                        .set_host_online(&host_namespace, &host_name, true)
                        .await?;
                    status.state = Some(RemediationState::PowerOn);
                    status.reason = Some(REASON_REBOOT_IN_PROGRESS.to_string());
                    self.kube
                        .patch_remediation_status(namespace, name, &status)
                        .await?;
                }
            }
            RemediationState::PowerOn => {
                if self.node_is_ready(&machine).await? {
                    self.finish_succeeded(
                        namespace,
                        name,
                        &machine,
                        &mut status,
                        REASON_REBOOT_SUCCEEDED,
                        now,
                    )
                    .await?;
                    self.publish(
                        request,
                        EventType::Normal,
                        reasons::REBOOT_SUCCEEDED,
                        format!("node backed by machine {machine_name} is Ready again"),
                    )
                    .await;
                    return Ok(());
                }
                debug!(request = %name, "waiting for the node to report Ready");
            }
            // terminal states only re-run their idempotent cleanup
            RemediationState::Succeeded => {
                self.cleanup_succeeded(&machine).await?;
                return Ok(());
            }
            RemediationState::Failed => {
                self.cleanup_failed(&machine).await?;
                return Ok(());
            }
        }

        // the timeout applies to every non-terminal pass, waits included
        if !status.state.unwrap_or_default().is_terminal() && timed_out(&status, REBOOT_TIMEOUT, now)
        {
            self.finish_failed(namespace, name, &machine, &mut status, now)
                .await?;
            self.publish(
                request,
                EventType::Warning,
                reasons::REBOOT_FAILED,
                format!("{REASON_REBOOT_TIMED_OUT}; removing the node backed by {machine_name}"),
            )
            .await;
        }
        Ok(())
    }

    async fn step_recreate(
        &self,
        namespace: &str,
        name: &str,
        request: &MachineRemediation,
    ) -> Result<(), Error> {
        let machine_name = &request.spec.machine_name;
        let now = Utc::now();
        let mut status = self.load_status(namespace, name, request, now).await?;
        if status.state.unwrap_or_default().is_terminal() {
            return Ok(());
        }

        // the machine disappears and reappears while the recovery record
        // replaces it; an absent or unregistered machine means the record
        // is mid-flight
        let machine = self.kube.get_machine(namespace, machine_name).await?;
        let Some(node_name) = machine.as_ref().and_then(|m| m.node_name().map(str::to_string))
        else {
            debug!(machine = %machine_name, "machine absent or unregistered, recovery in progress");
            return Ok(());
        };

        let ready = self
            .kube
            .get_node(&node_name)
            .await?
            .as_ref()
            .is_some_and(node_ready);
        let record_exists = self.kube.node_recovery_exists(&node_name).await?;

        if ready && !record_exists {
            status.state = Some(RemediationState::Succeeded);
            status.reason = Some(REASON_RECREATE_SUCCEEDED.to_string());
            status.end_time = Some(Time(now));
            return self
                .kube
                .patch_remediation_status(namespace, name, &status)
                .await;
        }

        if !ready {
            if !record_exists && timed_out(&status, RECREATE_TIMEOUT, now) {
                status.state = Some(RemediationState::Failed);
                status.reason = Some(REASON_RECREATE_TIMED_OUT.to_string());
                status.end_time = Some(Time(now));
                return self
                    .kube
                    .patch_remediation_status(namespace, name, &status)
                    .await;
            }
            self.kube.ensure_node_recovery(&node_name).await?;
            if status.reason.as_deref() != Some(REASON_RECREATE_IN_PROGRESS) {
                status.reason = Some(REASON_RECREATE_IN_PROGRESS.to_string());
                self.kube
                    .patch_remediation_status(namespace, name, &status)
                    .await?;
            }
        }
        // ready with a live record: the recovery machine drops the record
        // itself once it notices
        Ok(())
    }
}

#[async_trait]
impl Remediator for BareMetalRemediator {
    async fn reboot(&self, request: &MachineRemediation) -> Result<(), Error> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        // the dispatched view may be stale; re-read so state cannot regress
        let Some(request) = self.kube.get_remediation(&namespace, &name).await? else {
            debug!(request = %name, "remediation request gone");
            return Ok(());
        };
        self.step_reboot(&namespace, &name, &request).await
    }

    async fn recreate(&self, request: &MachineRemediation) -> Result<(), Error> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        let Some(request) = self.kube.get_remediation(&namespace, &name).await? else {
            debug!(request = %name, "remediation request gone");
            return Ok(());
        };
        self.step_recreate(&namespace, &name, &request).await
    }
}

/// Whether the protocol has run past `timeout`, measured from the stamped
/// start. A status without a start time cannot time out.
fn timed_out(status: &MachineRemediationStatus, timeout: Duration, now: DateTime<Utc>) -> bool {
    match status.start_time.as_ref() {
        Some(start) => {
            now.signed_duration_since(start.0)
                .to_std()
                .unwrap_or_default()
                >= timeout
        }
        None => false,
    }
}
