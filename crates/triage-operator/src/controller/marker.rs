//! Reboot-marker controller: turns a node annotation into a reboot request.
//!
//! Operators ask for a power cycle by annotating the node. The controller
//! resolves the backing machine and opens a reboot-typed remediation
//! request for it; the request's own state machine clears the marker once
//! the node comes back Ready.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use triage_common::crd::{
    Machine, MachineRemediation, MachineRemediationSpec, RemediationType,
};
use triage_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use triage_common::kube_utils::{annotation, ignore_not_found, split_namespaced_key};
use triage_common::{Error, ReconcileError, ANNOTATION_MACHINE, ANNOTATION_REBOOT};

/// Kubernetes access needed by the marker controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MarkerClient: Send + Sync {
    /// Get a machine by namespace and name.
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// Get a remediation request by namespace and name.
    async fn get_remediation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineRemediation>, Error>;

    /// Create a remediation request. A request that already exists is not
    /// an error; another writer won the race.
    async fn create_remediation(
        &self,
        namespace: &str,
        request: &MachineRemediation,
    ) -> Result<(), Error>;

    /// Delete a remediation request. A missing request is not an error.
    async fn delete_remediation(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation.
pub struct MarkerClientImpl {
    client: Client,
}

#[async_trait]
impl MarkerClient for MarkerClientImpl {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_remediation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineRemediation>, Error> {
        let api: Api<MachineRemediation> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_remediation(
        &self,
        namespace: &str,
        request: &MachineRemediation,
    ) -> Result<(), Error> {
        let api: Api<MachineRemediation> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), request).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_remediation(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<MachineRemediation> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }
}

/// Shared state for the marker controller.
pub struct Context {
    kube: Arc<dyn MarkerClient>,
    events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Production context talking to the cluster.
    pub fn new(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "triage-marker-controller",
        ));
        Self {
            kube: Arc::new(MarkerClientImpl { client }),
            events,
        }
    }

    /// Context with injected mock clients for unit tests.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn MarkerClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }
}

/// Reconcile one node's reboot marker.
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if annotation(&node.metadata, ANNOTATION_REBOOT).is_none() {
        return Ok(Action::await_change());
    }
    if node.metadata.deletion_timestamp.is_some() {
        debug!("node is terminating, ignoring the reboot marker");
        return Ok(Action::await_change());
    }

    let Some(machine_key) = annotation(&node.metadata, ANNOTATION_MACHINE) else {
        warn!("reboot marker on a node with no machine annotation");
        return Ok(Action::await_change());
    };
    let (namespace, machine_name) = split_namespaced_key(machine_key)?;

    if ctx.kube.get_machine(&namespace, &machine_name).await?.is_none() {
        warn!(machine = %machine_key, "reboot marker points at a machine that does not exist");
        return Ok(Action::await_change());
    }

    // one live request per machine: a running one wins, a finished one is
    // replaced so the marker triggers a fresh cycle
    if let Some(existing) = ctx.kube.get_remediation(&namespace, &machine_name).await? {
        if !existing.is_terminal() {
            debug!(machine = %machine_name, "remediation already in flight");
            return Ok(Action::await_change());
        }
        ctx.kube.delete_remediation(&namespace, &machine_name).await?;
    }

    let request = MachineRemediation::new(
        &machine_name,
        MachineRemediationSpec {
            remediation_type: RemediationType::Reboot,
            machine_name: machine_name.clone(),
        },
    );
    ctx.kube.create_remediation(&namespace, &request).await?;
    info!(machine = %machine_name, "opened reboot request from the node marker");
    ctx.events
        .publish(
            &node.object_ref(&()),
            EventType::Normal,
            reasons::REMEDIATION_CREATED,
            actions::REMEDIATE,
            Some(format!("reboot requested for machine {namespace}/{machine_name}")),
        )
        .await;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, RecordingEvents};
    use triage_common::crd::RemediationState;

    const NODE: &str = "node-0";
    const MACHINE: &str = "worker-0";
    const NS: &str = fixtures::MACHINE_NAMESPACE;

    fn marked_node() -> Node {
        fixtures::node_with_reboot_marker(fixtures::node_backed_by(
            fixtures::node(NODE, true),
            MACHINE,
        ))
    }

    fn context(kube: MockMarkerClient) -> (Arc<Context>, Arc<RecordingEvents>) {
        let events = Arc::new(RecordingEvents::default());
        (
            Arc::new(Context::for_testing(Arc::new(kube), events.clone())),
            events,
        )
    }

    #[tokio::test]
    async fn unmarked_nodes_are_ignored() {
        let node = fixtures::node(NODE, true);
        let (ctx, events) = context(MockMarkerClient::new());

        let action = reconcile(Arc::new(node), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn marker_opens_a_reboot_request() {
        let mut kube = MockMarkerClient::new();
        kube.expect_get_machine()
            .withf(|ns, name| ns == NS && name == MACHINE)
            .returning(|_, name| Ok(Some(fixtures::machine(name, Some(NODE)))));
        kube.expect_get_remediation().returning(|_, _| Ok(None));
        kube.expect_create_remediation()
            .withf(|ns, request| {
                ns == NS
                    && request.spec.remediation_type == RemediationType::Reboot
                    && request.spec.machine_name == MACHINE
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, events) = context(kube);

        reconcile(Arc::new(marked_node()), ctx).await.unwrap();
        assert_eq!(events.reasons(), vec![reasons::REMEDIATION_CREATED]);
    }

    #[tokio::test]
    async fn marker_without_a_machine_annotation_is_skipped() {
        let node = fixtures::node_with_reboot_marker(fixtures::node(NODE, true));
        let (ctx, events) = context(MockMarkerClient::new());

        let action = reconcile(Arc::new(node), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn marker_pointing_at_a_missing_machine_is_skipped() {
        let mut kube = MockMarkerClient::new();
        kube.expect_get_machine().returning(|_, _| Ok(None));
        let (ctx, events) = context(kube);

        reconcile(Arc::new(marked_node()), ctx).await.unwrap();
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn a_running_request_is_not_duplicated() {
        let mut kube = MockMarkerClient::new();
        kube.expect_get_machine()
            .returning(|_, name| Ok(Some(fixtures::machine(name, Some(NODE)))));
        kube.expect_get_remediation().returning(|_, _| {
            Ok(Some(fixtures::remediation(
                MACHINE,
                RemediationType::Reboot,
                Some(RemediationState::PowerOff),
            )))
        });
        let (ctx, events) = context(kube);

        reconcile(Arc::new(marked_node()), ctx).await.unwrap();
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn a_finished_request_is_replaced() {
        let mut kube = MockMarkerClient::new();
        kube.expect_get_machine()
            .returning(|_, name| Ok(Some(fixtures::machine(name, Some(NODE)))));
        kube.expect_get_remediation().returning(|_, _| {
            Ok(Some(fixtures::remediation(
                MACHINE,
                RemediationType::Reboot,
                Some(RemediationState::Succeeded),
            )))
        });
        kube.expect_delete_remediation()
            .withf(|ns, name| ns == NS && name == MACHINE)
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_create_remediation()
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, _) = context(kube);

        reconcile(Arc::new(marked_node()), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn terminating_nodes_are_ignored() {
        let mut node = marked_node();
        node.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        let (ctx, _) = context(MockMarkerClient::new());

        let action = reconcile(Arc::new(node), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
