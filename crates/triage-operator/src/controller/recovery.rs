//! Node-recovery controller: replaces the machine under a broken node.
//!
//! One record per node runs `Init -> Wait -> Remediate`. The grace window
//! gives the node a chance to come back on its own; after it elapses the
//! backing machine's spec is pinned into the record status, the machine
//! is deleted, and an identical replacement is created. Deletes and
//! creates are tracked through the expectation ledger and confirmed by
//! fresh reads, so a half-finished pass never doubles a write.
//!
//! The record status is written before the write it describes: the spec
//! snapshot lands before the machine delete, and the terminal outcome
//! (deleting the record) happens last. A crash between any two steps
//! resumes where it left off.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use triage_common::conditions::{
    effective_grace, load_conditions, node_ready, UnhealthyCondition,
};
use triage_common::crd::{
    Machine, NodeRecovery, NodeRecoveryPhase, NodeRecoverySpec, NodeRecoveryStatus,
};
use triage_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use triage_common::expectations::Expectations;
use triage_common::kube_utils::{
    annotation, ignore_not_found, is_api_error_code, namespaced_name, split_namespaced_key,
};
use triage_common::reconcile::backoff_delay;
use triage_common::{
    Error, ReconcileError, ANNOTATION_MACHINE, FIELD_MANAGER, TRIAGE_SYSTEM_NAMESPACE,
};

/// Grace window applied when no condition rule matches the node.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(60);

/// How long the replacement machine gets to bring the node back Ready.
pub const REMEDIATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Requeue while an expected create or delete has not been confirmed.
pub const EXPECTATION_REQUEUE: Duration = Duration::from_secs(5);

/// Poll cadence while waiting out the grace window or the node's return.
pub const READY_POLL: Duration = Duration::from_secs(30);

/// Status reason while the grace window runs.
pub const REASON_GRACE_WAIT: &str = "Waiting out the grace window";
/// Status reason while the backing machine cannot be resolved yet.
pub const REASON_MACHINE_PENDING: &str = "Waiting for the backing machine to appear";
/// Status reason while the machine is being replaced.
pub const REASON_REPLACING: &str = "Replacing the backing machine";

/// Kubernetes access needed by the recovery controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecoveryClient: Send + Sync {
    /// Fresh view of a recovery record; `None` when it is gone.
    async fn get_recovery(&self, name: &str) -> Result<Option<NodeRecovery>, Error>;

    /// Create a recovery record. A record that already exists is not an
    /// error; another writer won the race.
    async fn create_recovery(&self, record: &NodeRecovery) -> Result<(), Error>;

    /// Delete a recovery record. A missing record is not an error.
    async fn delete_recovery(&self, name: &str) -> Result<(), Error>;

    /// Patch the status of a recovery record.
    async fn patch_recovery_status(
        &self,
        name: &str,
        status: &NodeRecoveryStatus,
    ) -> Result<(), Error>;

    /// Get a node by name.
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Get a machine by namespace and name.
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// Create a machine. Conflicts are surfaced, not swallowed; the
    /// caller settles the expectation ledger either way.
    async fn create_machine(&self, namespace: &str, machine: &Machine) -> Result<(), Error>;

    /// Delete a machine. A missing machine is not an error.
    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Condition rules in effect, falling back to the built-in defaults.
    async fn condition_policy(&self) -> Vec<UnhealthyCondition>;
}

/// Real Kubernetes client implementation.
pub struct RecoveryClientImpl {
    client: Client,
}

impl RecoveryClientImpl {
    /// Wrap the given kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn recoveries(&self) -> Api<NodeRecovery> {
        Api::namespaced(self.client.clone(), TRIAGE_SYSTEM_NAMESPACE)
    }
}

#[async_trait]
impl RecoveryClient for RecoveryClientImpl {
    async fn get_recovery(&self, name: &str) -> Result<Option<NodeRecovery>, Error> {
        Ok(self.recoveries().get_opt(name).await?)
    }

    async fn create_recovery(&self, record: &NodeRecovery) -> Result<(), Error> {
        match self.recoveries().create(&PostParams::default(), record).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_recovery(&self, name: &str) -> Result<(), Error> {
        ignore_not_found(self.recoveries().delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn patch_recovery_status(
        &self,
        name: &str,
        status: &NodeRecoveryStatus,
    ) -> Result<(), Error> {
        triage_common::kube_utils::patch_resource_status::<NodeRecovery>(
            &self.client,
            name,
            TRIAGE_SYSTEM_NAMESPACE,
            status,
            FIELD_MANAGER,
        )
        .await
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_machine(&self, namespace: &str, machine: &Machine) -> Result<(), Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), machine).await?;
        Ok(())
    }

    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn condition_policy(&self) -> Vec<UnhealthyCondition> {
        load_conditions(self.client.clone(), TRIAGE_SYSTEM_NAMESPACE).await
    }
}

/// Shared state for the recovery controller.
pub struct Context {
    kube: Arc<dyn RecoveryClient>,
    events: Arc<dyn EventPublisher>,
    expectations: Expectations,
}

impl Context {
    /// Production context talking to the cluster.
    pub fn new(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "triage-recovery-controller",
        ));
        Self {
            kube: Arc::new(RecoveryClientImpl::new(client)),
            events,
            expectations: Expectations::new(),
        }
    }

    /// Context with injected mock clients for unit tests.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn RecoveryClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube,
            events,
            expectations: Expectations::new(),
        }
    }
}

/// Reconcile one recovery record through its phase machine.
#[instrument(skip(record, ctx), fields(record = %record.name_any()))]
pub async fn reconcile(record: Arc<NodeRecovery>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = record.name_any();
    // fresh read: the phase machine must never act on a stale view
    let Some(record) = ctx.kube.get_recovery(&name).await? else {
        debug!("recovery record gone");
        // ledger entries must not outlive the record, or a fresh record
        // for the same node inherits them and stalls
        if let Some(status) = record.status.as_ref() {
            if let (Some(ns), Some(machine)) = (
                status.machine_namespace.as_deref(),
                status.machine_name.as_deref(),
            ) {
                ctx.expectations.clear(&format!("{ns}/{machine}"));
            }
        }
        return Ok(Action::await_change());
    };
    let node = ctx.kube.get_node(&record.spec.node_name).await?;
    let now = Utc::now();

    match record.phase() {
        NodeRecoveryPhase::Init => step_init(&record, node.as_ref(), &ctx, now).await,
        NodeRecoveryPhase::Wait => step_wait(&record, node.as_ref(), &ctx, now).await,
        NodeRecoveryPhase::Remediate => step_remediate(&record, node.as_ref(), &ctx, now).await,
    }
}

async fn step_init(
    record: &NodeRecovery,
    node: Option<&Node>,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    if node.is_some_and(node_ready) {
        // the watcher raced a flapping node; nothing to recover
        ctx.kube.delete_recovery(&record.name_any()).await?;
        return Ok(Action::await_change());
    }
    let status = NodeRecoveryStatus {
        phase: Some(NodeRecoveryPhase::Wait),
        reason: Some(REASON_GRACE_WAIT.to_string()),
        start_time: Some(Time(now)),
        ..Default::default()
    };
    ctx.kube
        .patch_recovery_status(&record.name_any(), &status)
        .await?;

    let rules = ctx.kube.condition_policy().await;
    let grace = node
        .map(|n| effective_grace(n, &rules, DEFAULT_GRACE))
        .unwrap_or(DEFAULT_GRACE);
    info!(
        node = %record.spec.node_name,
        grace_secs = grace.as_secs(),
        "node unhealthy, grace window opened"
    );
    Ok(Action::requeue(grace))
}

async fn step_wait(
    record: &NodeRecovery,
    node: Option<&Node>,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let name = record.name_any();
    if node.is_some_and(node_ready) {
        info!(node = %record.spec.node_name, "node recovered on its own");
        ctx.kube.delete_recovery(&name).await?;
        return Ok(Action::await_change());
    }

    let rules = ctx.kube.condition_policy().await;
    let grace = node
        .map(|n| effective_grace(n, &rules, DEFAULT_GRACE))
        .unwrap_or(DEFAULT_GRACE);
    let start = record.start_time().map_or(now, |t| t.0);
    let held = now.signed_duration_since(start).to_std().unwrap_or_default();
    if held < grace {
        return Ok(Action::requeue((grace - held).min(READY_POLL)));
    }

    // grace over: pin the machine snapshot, then take the machine down
    let Some(machine_key) = node.and_then(|n| annotation(&n.metadata, ANNOTATION_MACHINE)) else {
        return defer(ctx, record, "no machine annotation on the node").await;
    };
    let (machine_namespace, machine_name) = split_namespaced_key(machine_key)?;
    let Some(machine) = ctx.kube.get_machine(&machine_namespace, &machine_name).await? else {
        return defer(ctx, record, "backing machine not found").await;
    };

    let status = NodeRecoveryStatus {
        phase: Some(NodeRecoveryPhase::Remediate),
        reason: Some(REASON_REPLACING.to_string()),
        start_time: Some(Time(now)),
        retry_count: None,
        machine_name: Some(machine_name.clone()),
        machine_namespace: Some(machine_namespace.clone()),
        machine_spec: Some(machine.spec.clone()),
    };
    // the snapshot must be durable before the machine goes away
    ctx.kube.patch_recovery_status(&name, &status).await?;

    let key = namespaced_name(&machine);
    let uid = machine.uid().unwrap_or_default();
    // a failed delete stays recorded; the next pass retries it against
    // the still-live uid instead of mistaking it for the replacement
    ctx.expectations.expect_delete(&key, &uid);
    ctx.kube.delete_machine(&machine_namespace, &machine_name).await?;
    info!(machine = %key, "deleted unhealthy backing machine");
    ctx.events
        .publish(
            &record.object_ref(&()),
            EventType::Normal,
            reasons::MACHINE_DELETED,
            actions::RECOVER,
            Some(format!(
                "deleted machine {key} backing node {}",
                record.spec.node_name
            )),
        )
        .await;
    Ok(Action::requeue(EXPECTATION_REQUEUE))
}

async fn step_remediate(
    record: &NodeRecovery,
    node: Option<&Node>,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let name = record.name_any();
    let status = record.status.clone().unwrap_or_default();
    let (Some(machine_namespace), Some(machine_name)) =
        (status.machine_namespace.clone(), status.machine_name.clone())
    else {
        return Err(Error::validation(
            format!("NodeRecovery/{name}"),
            "remediating without a machine snapshot",
        )
        .into());
    };
    let key = format!("{machine_namespace}/{machine_name}");

    match ctx.kube.get_machine(&machine_namespace, &machine_name).await? {
        Some(machine) => {
            let uid = machine.uid().unwrap_or_default();
            if machine.metadata.deletion_timestamp.is_some() {
                // the delete landed; wait for the object to go away
                return Ok(Action::requeue(EXPECTATION_REQUEUE));
            }
            if ctx.expectations.pending_delete(&key, &uid) {
                // the promised delete never landed; issue it again
                ctx.kube
                    .delete_machine(&machine_namespace, &machine_name)
                    .await?;
                return Ok(Action::requeue(EXPECTATION_REQUEUE));
            }
            // a live machine with an unrecorded uid proves the old one gone
            ctx.expectations.observe_deletes_except(&key, &uid);
            ctx.expectations.observe_add(&key);

            if node.is_some_and(node_ready) {
                ctx.events
                    .publish(
                        &record.object_ref(&()),
                        EventType::Normal,
                        reasons::NODE_RECOVERY_SUCCEEDED,
                        actions::RECOVER,
                        Some(format!(
                            "node {} is Ready on the replacement machine",
                            record.spec.node_name
                        )),
                    )
                    .await;
                return finish(ctx, &name, &key).await;
            }

            let start = status.start_time.map_or(now, |t| t.0);
            let held = now.signed_duration_since(start).to_std().unwrap_or_default();
            if held >= REMEDIATION_TIMEOUT {
                warn!(node = %record.spec.node_name, "replacement machine did not heal the node in time");
                ctx.events
                    .publish(
                        &record.object_ref(&()),
                        EventType::Warning,
                        reasons::NODE_RECOVERY_FAILED,
                        actions::RECOVER,
                        Some(format!(
                            "node {} did not turn Ready within {}s of the machine replacement",
                            record.spec.node_name,
                            REMEDIATION_TIMEOUT.as_secs()
                        )),
                    )
                    .await;
                return finish(ctx, &name, &key).await;
            }
            Ok(Action::requeue(READY_POLL.min(REMEDIATION_TIMEOUT - held)))
        }
        None => {
            ctx.expectations.observe_all_deletes(&key);
            if !ctx.expectations.satisfied(&key) {
                // an issued create has not shown up yet
                return Ok(Action::requeue(EXPECTATION_REQUEUE));
            }
            let spec = status.machine_spec.clone().ok_or_else(|| {
                Error::validation(
                    format!("NodeRecovery/{name}"),
                    "remediating without a machine spec snapshot",
                )
            })?;
            let mut replacement = Machine::new(&machine_name, spec);
            replacement.metadata.namespace = Some(machine_namespace.clone());

            ctx.expectations.expect_add(&key);
            match ctx.kube.create_machine(&machine_namespace, &replacement).await {
                Ok(()) => {
                    info!(machine = %key, "created replacement machine");
                    ctx.events
                        .publish(
                            &record.object_ref(&()),
                            EventType::Normal,
                            reasons::MACHINE_CREATED,
                            actions::RECOVER,
                            Some(format!(
                                "created replacement machine {key} for node {}",
                                record.spec.node_name
                            )),
                        )
                        .await;
                }
                Err(e) if is_api_error_code(&e, 409) => {
                    // another writer created it between the read and now
                    ctx.expectations.observe_add(&key);
                }
                Err(e) => {
                    ctx.expectations.cancel_add(&key);
                    return Err(e.into());
                }
            }
            Ok(Action::requeue(EXPECTATION_REQUEUE))
        }
    }
}

/// Deferral with a capped exponential backoff, keyed on the stored retry
/// count so restarts keep the cadence.
async fn defer(ctx: &Context, record: &NodeRecovery, why: &str) -> Result<Action, ReconcileError> {
    let retries = record.retry_count();
    let mut status = record.status.clone().unwrap_or_default();
    status.retry_count = Some(retries + 1);
    status.reason = Some(REASON_MACHINE_PENDING.to_string());
    ctx.kube
        .patch_recovery_status(&record.name_any(), &status)
        .await?;
    warn!(
        node = %record.spec.node_name,
        retries,
        why,
        "cannot resolve the backing machine yet"
    );
    Ok(Action::requeue(backoff_delay(retries)))
}

/// Terminal step for both outcomes: drop the ledger entries and the record.
async fn finish(ctx: &Context, name: &str, key: &str) -> Result<Action, ReconcileError> {
    ctx.expectations.clear(key);
    ctx.kube.delete_recovery(name).await?;
    Ok(Action::await_change())
}

/// Watch mapper for nodes: opens a recovery record for every broken node
/// and maps the event onto the record the reconciler owns.
pub fn discover_broken_nodes(client: Client) -> impl Fn(Node) -> Vec<ObjectRef<NodeRecovery>> {
    move |node: Node| {
        let name = node.name_any();
        if node.metadata.deletion_timestamp.is_none()
            && !node_ready(&node)
            && annotation(&node.metadata, ANNOTATION_MACHINE).is_some()
        {
            let client = client.clone();
            let node_name = name.clone();
            tokio::spawn(async move {
                let kube = RecoveryClientImpl::new(client);
                if let Err(err) = ensure_recovery_record(&kube, &node_name).await {
                    warn!(node = %node_name, error = %err, "failed to open recovery record");
                }
            });
        }
        vec![ObjectRef::new(&name).within(TRIAGE_SYSTEM_NAMESPACE)]
    }
}

/// Create the recovery record for a node unless one already exists.
pub(crate) async fn ensure_recovery_record(
    kube: &dyn RecoveryClient,
    node_name: &str,
) -> Result<(), Error> {
    if kube.get_recovery(node_name).await?.is_some() {
        return Ok(());
    }
    let record = NodeRecovery::new(
        node_name,
        NodeRecoverySpec {
            node_name: node_name.to_string(),
        },
    );
    kube.create_recovery(&record).await?;
    info!(node = %node_name, "opened recovery record");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, RecordingEvents};
    use mockall::Sequence;
    use triage_common::conditions::default_conditions;

    const NODE: &str = "node-0";
    const MACHINE: &str = "worker-0";
    const NS: &str = fixtures::MACHINE_NAMESPACE;

    fn key() -> String {
        format!("{NS}/{MACHINE}")
    }

    fn waiting(started_minutes_ago: i64) -> NodeRecovery {
        let mut record = fixtures::recovery(NODE);
        record.status = Some(NodeRecoveryStatus {
            phase: Some(NodeRecoveryPhase::Wait),
            reason: Some(REASON_GRACE_WAIT.to_string()),
            start_time: Some(fixtures::minutes_ago(Utc::now(), started_minutes_ago)),
            ..Default::default()
        });
        record
    }

    fn remediating(started_minutes_ago: i64) -> NodeRecovery {
        let mut record = fixtures::recovery(NODE);
        record.status = Some(NodeRecoveryStatus {
            phase: Some(NodeRecoveryPhase::Remediate),
            reason: Some(REASON_REPLACING.to_string()),
            start_time: Some(fixtures::minutes_ago(Utc::now(), started_minutes_ago)),
            retry_count: None,
            machine_name: Some(MACHINE.to_string()),
            machine_namespace: Some(NS.to_string()),
            machine_spec: Some(fixtures::machine(MACHINE, Some(NODE)).spec),
        });
        record
    }

    fn broken_node() -> Node {
        fixtures::node_backed_by(fixtures::node(NODE, false), MACHINE)
    }

    fn mock_with_record(record: NodeRecovery) -> MockRecoveryClient {
        let mut kube = MockRecoveryClient::new();
        kube.expect_get_recovery()
            .returning(move |_| Ok(Some(record.clone())));
        kube
    }

    fn context(kube: MockRecoveryClient) -> (Arc<Context>, Arc<RecordingEvents>) {
        let events = Arc::new(RecordingEvents::default());
        (
            Arc::new(Context::for_testing(Arc::new(kube), events.clone())),
            events,
        )
    }

    #[tokio::test]
    async fn first_observation_opens_the_grace_window() {
        let record = fixtures::recovery(NODE);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_patch_recovery_status()
            .withf(|_, s| {
                s.phase == Some(NodeRecoveryPhase::Wait)
                    && s.reason.as_deref() == Some(REASON_GRACE_WAIT)
                    && s.start_time.is_some()
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_condition_policy()
            .returning(default_conditions);
        let (ctx, _) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        // the Ready/Unknown rule carries a 300s timeout
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn a_node_that_recovers_during_grace_closes_the_record() {
        let record = waiting(1);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(fixtures::node(NODE, true))));
        kube.expect_delete_recovery()
            .withf(|name| name == NODE)
            .times(1)
            .returning(|_| Ok(()));
        let (ctx, events) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn grace_still_running_polls() {
        let record = waiting(2);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_condition_policy()
            .returning(default_conditions);
        let (ctx, _) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(READY_POLL));
    }

    #[tokio::test]
    async fn grace_elapsed_snapshots_before_deleting() {
        let record = waiting(6);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_condition_policy()
            .returning(default_conditions);
        kube.expect_get_machine()
            .withf(|ns, name| ns == NS && name == MACHINE)
            .returning(|_, name| Ok(Some(fixtures::machine(name, Some(NODE)))));
        let mut seq = Sequence::new();
        kube.expect_patch_recovery_status()
            .withf(|_, s| {
                s.phase == Some(NodeRecoveryPhase::Remediate)
                    && s.machine_spec.is_some()
                    && s.machine_name.as_deref() == Some(MACHINE)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        kube.expect_delete_machine()
            .withf(|ns, name| ns == NS && name == MACHINE)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let (ctx, events) = context(kube);

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(EXPECTATION_REQUEUE));
        assert_eq!(events.reasons(), vec![reasons::MACHINE_DELETED]);
        assert!(!ctx.expectations.satisfied(&key()));
    }

    #[tokio::test]
    async fn unresolvable_machine_defers_with_backoff() {
        let record = waiting(6);
        let mut kube = mock_with_record(record.clone());
        // no machine annotation on the node
        kube.expect_get_node()
            .returning(|_| Ok(Some(fixtures::node(NODE, false))));
        kube.expect_condition_policy()
            .returning(default_conditions);
        kube.expect_patch_recovery_status()
            .withf(|_, s| {
                s.retry_count == Some(1)
                    && s.reason.as_deref() == Some(REASON_MACHINE_PENDING)
                    && s.phase == Some(NodeRecoveryPhase::Wait)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, _) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(backoff_delay(0)));
    }

    #[tokio::test]
    async fn deferrals_back_off_exponentially() {
        let mut record = waiting(6);
        record.status.as_mut().unwrap().retry_count = Some(3);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(fixtures::node(NODE, false))));
        kube.expect_condition_policy()
            .returning(default_conditions);
        kube.expect_patch_recovery_status()
            .withf(|_, s| s.retry_count == Some(4))
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, _) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(backoff_delay(3)));
    }

    #[tokio::test]
    async fn lingering_machine_is_deleted_again() {
        let record = remediating(0);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine()
            .returning(|_, name| Ok(Some(fixtures::machine(name, Some(NODE)))));
        kube.expect_delete_machine()
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, _) = context(kube);
        ctx.expectations.expect_delete(&key(), &format!("uid-{MACHINE}"));

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(EXPECTATION_REQUEUE));
        assert!(!ctx.expectations.satisfied(&key()), "delete is still owed");
    }

    #[tokio::test]
    async fn terminating_machine_is_not_deleted_again() {
        let record = remediating(0);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine()
            .returning(|_, name| Ok(Some(fixtures::deleting(fixtures::machine(name, Some(NODE))))));
        // no delete_machine expectation: a second delete would panic
        let (ctx, _) = context(kube);
        ctx.expectations.expect_delete(&key(), &format!("uid-{MACHINE}"));

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(EXPECTATION_REQUEUE));
        assert!(!ctx.expectations.satisfied(&key()), "delete still awaits confirmation");
    }

    #[tokio::test]
    async fn externally_deleted_record_clears_its_ledger_key() {
        let record = remediating(0);
        let mut kube = MockRecoveryClient::new();
        kube.expect_get_recovery().returning(|_| Ok(None));
        let (ctx, _) = context(kube);
        ctx.expectations.expect_delete(&key(), "uid-old");

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.expectations.satisfied(&key()), "entries must not outlive the record");
    }

    #[tokio::test]
    async fn confirmed_delete_creates_the_replacement() {
        let record = remediating(0);
        let snapshot = record.status.clone().unwrap().machine_spec.unwrap();
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine().returning(|_, _| Ok(None));
        kube.expect_create_machine()
            .withf(move |ns, m| {
                ns == NS && m.name_any() == MACHINE && m.spec == snapshot
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, events) = context(kube);
        ctx.expectations.expect_delete(&key(), "uid-old");

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(EXPECTATION_REQUEUE));
        assert_eq!(events.reasons(), vec![reasons::MACHINE_CREATED]);
        assert!(!ctx.expectations.satisfied(&key()), "create is now pending");
    }

    #[tokio::test]
    async fn create_conflict_counts_as_the_replacement() {
        let record = remediating(0);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine().returning(|_, _| Ok(None));
        kube.expect_create_machine().returning(|_, _| {
            Err(Error::Kube {
                source: kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "machine exists".to_string(),
                    reason: "AlreadyExists".to_string(),
                    code: 409,
                }),
            })
        });
        let (ctx, _) = context(kube);

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(EXPECTATION_REQUEUE));
        assert!(ctx.expectations.satisfied(&key()));
    }

    #[tokio::test]
    async fn create_failure_rolls_the_ledger_back() {
        let record = remediating(0);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine().returning(|_, _| Ok(None));
        kube.expect_create_machine()
            .returning(|_, _| Err(Error::internal("machine create", "etcd unavailable")));
        let (ctx, _) = context(kube);

        let result = reconcile(Arc::new(record), ctx.clone()).await;
        assert!(result.is_err());
        assert!(ctx.expectations.satisfied(&key()), "failed create must not wedge the key");
    }

    #[tokio::test]
    async fn replacement_waits_for_the_node_to_return() {
        let record = remediating(0);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine().returning(|_, _| {
            let mut machine = fixtures::machine(MACHINE, Some(NODE));
            machine.metadata.uid = Some("uid-replacement".to_string());
            Ok(Some(machine))
        });
        let (ctx, events) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(READY_POLL));
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn ready_node_finishes_the_recovery() {
        let record = remediating(1);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(fixtures::node(NODE, true))));
        kube.expect_get_machine().returning(|_, _| {
            let mut machine = fixtures::machine(MACHINE, Some(NODE));
            machine.metadata.uid = Some("uid-replacement".to_string());
            Ok(Some(machine))
        });
        kube.expect_delete_recovery()
            .withf(|name| name == NODE)
            .times(1)
            .returning(|_| Ok(()));
        let (ctx, events) = context(kube);
        // stale ledger state from an earlier pass must not survive the record
        ctx.expectations.expect_add(&key());

        let action = reconcile(Arc::new(record), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(events.reasons(), vec![reasons::NODE_RECOVERY_SUCCEEDED]);
        assert!(ctx.expectations.satisfied(&key()));
    }

    #[tokio::test]
    async fn recovery_times_out_when_the_node_stays_broken() {
        let record = remediating(6);
        let mut kube = mock_with_record(record.clone());
        kube.expect_get_node()
            .returning(|_| Ok(Some(broken_node())));
        kube.expect_get_machine().returning(|_, _| {
            let mut machine = fixtures::machine(MACHINE, Some(NODE));
            machine.metadata.uid = Some("uid-replacement".to_string());
            Ok(Some(machine))
        });
        kube.expect_delete_recovery().times(1).returning(|_| Ok(()));
        let (ctx, events) = context(kube);

        let action = reconcile(Arc::new(record), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(events.reasons(), vec![reasons::NODE_RECOVERY_FAILED]);
    }

    #[tokio::test]
    async fn ensure_creates_a_record_once() {
        let mut kube = MockRecoveryClient::new();
        kube.expect_get_recovery().returning(|_| Ok(None));
        kube.expect_create_recovery()
            .withf(|record| record.spec.node_name == NODE)
            .times(1)
            .returning(|_| Ok(()));
        ensure_recovery_record(&kube, NODE).await.unwrap();

        let mut kube = MockRecoveryClient::new();
        kube.expect_get_recovery()
            .returning(|_| Ok(Some(fixtures::recovery(NODE))));
        ensure_recovery_record(&kube, NODE).await.unwrap();
    }
}
