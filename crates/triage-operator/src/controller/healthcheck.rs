//! Health-check controller: watches targeted machines and opens
//! remediation requests for the ones whose nodes stayed unhealthy past
//! their condition timeout.
//!
//! Each pass recomputes the full verdict list from the condition policy
//! and writes it to the check's status. Remediation is gated twice: a
//! machine with a request already in flight is skipped, and every new
//! request first spends a slot of the governing disruption budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use triage_common::conditions::{
    load_conditions, matching_conditions, remaining_wait, unhealthy_too_long, UnhealthyCondition,
};
use triage_common::crd::{
    Machine, MachineHealthCheck, MachineHealthCheckStatus, MachineRemediation,
    MachineRemediationSpec, RemediationStrategy, RemediationType, TargetedCondition,
    TargetedMachine,
};
use triage_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use triage_common::kube_utils::{
    annotation, ignore_not_found, patch_resource_status, split_namespaced_key,
};
use triage_common::selector::selector_matches;
use triage_common::{
    Error, ReconcileError, ANNOTATION_DISABLE_REMEDIATION, ANNOTATION_MACHINE, FIELD_MANAGER,
    TRIAGE_SYSTEM_NAMESPACE,
};

use crate::controller::budget::{consume_disruption, BudgetClientImpl};

/// Fallback resync; machines and the condition policy change without a
/// watch event reaching the check.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Retry cadence after a denied admission; budget slots free up as
/// disruption windows expire.
pub const ADMISSION_RETRY: Duration = Duration::from_secs(15);

/// Kubernetes access needed by the health-check controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthCheckClient: Send + Sync {
    /// Fresh view of a health check; `None` when it is gone.
    async fn get_health_check(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineHealthCheck>, Error>;

    /// All machines in a namespace; selector filtering happens in-process.
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error>;

    /// Get a node by name.
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

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

    /// Admit a voluntary disruption of the machine through its governing
    /// budget. `Err` is a denial.
    async fn admit_disruption(&self, machine: &Machine) -> Result<(), Error>;

    /// Condition rules in effect, falling back to the built-in defaults.
    async fn condition_policy(&self) -> Vec<UnhealthyCondition>;

    /// Patch the status of a health check.
    async fn patch_health_check_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineHealthCheckStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation.
pub struct HealthCheckClientImpl {
    client: Client,
    budgets: BudgetClientImpl,
    events: Arc<dyn EventPublisher>,
}

impl HealthCheckClientImpl {
    /// Wrap the given kube client; admission warnings go through `events`.
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            budgets: BudgetClientImpl::new(client.clone()),
            events,
            client,
        }
    }
}

#[async_trait]
impl HealthCheckClient for HealthCheckClientImpl {
    async fn get_health_check(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineHealthCheck>, Error> {
        let api: Api<MachineHealthCheck> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
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

    async fn admit_disruption(&self, machine: &Machine) -> Result<(), Error> {
        consume_disruption(&self.budgets, self.events.as_ref(), machine).await
    }

    async fn condition_policy(&self) -> Vec<UnhealthyCondition> {
        load_conditions(self.client.clone(), TRIAGE_SYSTEM_NAMESPACE).await
    }

    async fn patch_health_check_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineHealthCheckStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<MachineHealthCheck>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await
    }
}

/// Shared state for the health-check controller.
pub struct Context {
    kube: Arc<dyn HealthCheckClient>,
    events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Production context talking to the cluster.
    pub fn new(client: Client) -> Self {
        let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "triage-healthcheck-controller",
        ));
        Self {
            kube: Arc::new(HealthCheckClientImpl::new(client, events.clone())),
            events,
        }
    }

    /// Context with injected mock clients for unit tests.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn HealthCheckClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }
}

fn remediation_type(strategy: RemediationStrategy) -> RemediationType {
    match strategy {
        RemediationStrategy::Reboot => RemediationType::Reboot,
        RemediationStrategy::Recreate => RemediationType::Recreate,
    }
}

/// Requeue delay for the pass: the earliest remaining condition wait,
/// floored at one second, capped by the resync interval, and tightened
/// further when an admission was denied.
fn requeue_delay(next_wait: Option<Duration>, denied: bool) -> Duration {
    let mut delay = RESYNC_INTERVAL;
    if denied {
        delay = delay.min(ADMISSION_RETRY);
    }
    if let Some(wait) = next_wait {
        delay = delay.min(wait.max(Duration::from_secs(1)));
    }
    delay
}

/// Reconcile one health check: evaluate every targeted machine, open
/// remediation requests where due, and publish the verdict status.
#[instrument(skip(check, ctx), fields(check = %check.name_any()))]
pub async fn reconcile(
    check: Arc<MachineHealthCheck>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = check.name_any();
    let namespace = check.namespace().unwrap_or_default();
    // fresh read: the spec or the disable annotation may have changed
    let Some(check) = ctx.kube.get_health_check(&namespace, &name).await? else {
        debug!("health check gone");
        return Ok(Action::await_change());
    };

    if annotation(&check.metadata, ANNOTATION_DISABLE_REMEDIATION).is_some() {
        debug!("remediation disabled by annotation");
        return Ok(Action::await_change());
    }

    let mut machines = Vec::new();
    for machine in ctx.kube.list_machines(&namespace).await? {
        if selector_matches(&check.spec.selector, machine.labels())? {
            machines.push(machine);
        }
    }

    let rules = ctx.kube.condition_policy().await;
    let targeted_conditions: Vec<TargetedCondition> = rules
        .iter()
        .map(|rule| TargetedCondition {
            name: rule.name.clone(),
            status: rule.status.clone(),
        })
        .collect();

    let now = Utc::now();
    let strategy = check.strategy();
    let mut targeted_machines = Vec::new();
    let mut healthy = 0;
    let mut next_wait: Option<Duration> = None;
    let mut denied = false;

    for machine in &machines {
        let machine_name = machine.name_any();
        let node_name = machine.node_name().ok_or_else(|| {
            Error::validation(
                format!("Machine/{machine_name}"),
                "machine has no node reference",
            )
        })?;
        let node = ctx.kube.get_node(node_name).await?.ok_or_else(|| {
            Error::validation(
                format!("Machine/{machine_name}"),
                format!("node {node_name} does not exist"),
            )
        })?;

        let matched = matching_conditions(&node, &rules);
        if matched.is_empty() {
            healthy += 1;
            targeted_machines.push(TargetedMachine {
                name: machine_name,
                healthy: true,
                unhealthy_conditions: Vec::new(),
            });
            continue;
        }
        targeted_machines.push(TargetedMachine {
            name: machine_name.clone(),
            healthy: false,
            unhealthy_conditions: matched.iter().map(|(rule, _)| rule.name.clone()).collect(),
        });

        let mut too_long = false;
        for (rule, condition) in &matched {
            let Some(timeout) = rule.timeout() else {
                continue;
            };
            if unhealthy_too_long(condition, timeout, now) {
                too_long = true;
            } else if let Some(wait) = remaining_wait(condition, timeout, now) {
                next_wait = Some(next_wait.map_or(wait, |w| w.min(wait)));
            }
        }
        if !too_long {
            continue;
        }

        // one live request per machine: a running one wins, a finished
        // one is replaced so the new damage gets a fresh cycle
        match ctx.kube.get_remediation(&namespace, &machine_name).await? {
            Some(existing) if !existing.is_terminal() => {
                debug!(machine = %machine_name, "remediation already in flight");
                continue;
            }
            Some(_) => ctx.kube.delete_remediation(&namespace, &machine_name).await?,
            None => {}
        }

        if let Err(err) = ctx.kube.admit_disruption(machine).await {
            warn!(machine = %machine_name, error = %err, "disruption budget denied remediation");
            ctx.events
                .publish(
                    &machine.object_ref(&()),
                    EventType::Warning,
                    reasons::REMEDIATION_SKIPPED,
                    actions::CHECK_HEALTH,
                    Some(format!("disruption budget denied remediation: {err}")),
                )
                .await;
            denied = true;
            continue;
        }

        let request = MachineRemediation::new(
            &machine_name,
            MachineRemediationSpec {
                remediation_type: remediation_type(strategy),
                machine_name: machine_name.clone(),
            },
        );
        ctx.kube.create_remediation(&namespace, &request).await?;
        info!(machine = %machine_name, strategy = ?strategy, "opened remediation request");
        ctx.events
            .publish(
                &machine.object_ref(&()),
                EventType::Normal,
                reasons::REMEDIATION_CREATED,
                actions::CHECK_HEALTH,
                Some(format!(
                    "{strategy:?} remediation requested for machine {namespace}/{machine_name}"
                )),
            )
            .await;
    }

    let status = MachineHealthCheckStatus {
        targeted_machines,
        targeted_conditions,
        total_healthy_machines: healthy,
    };
    if check.status.as_ref() != Some(&status) {
        ctx.kube
            .patch_health_check_status(&namespace, &name, &status)
            .await?;
    }
    Ok(Action::requeue(requeue_delay(next_wait, denied)))
}

/// Watch mapper for nodes: fans out to every check in the backing
/// machine's namespace. Selector filtering happens in the reconciler,
/// which has the machine labels at hand.
pub fn checks_for_node(
    store: Store<MachineHealthCheck>,
) -> impl Fn(Node) -> Vec<ObjectRef<MachineHealthCheck>> {
    move |node: Node| {
        let Some(machine_key) = annotation(&node.metadata, ANNOTATION_MACHINE) else {
            return Vec::new();
        };
        let Ok((namespace, _)) = split_namespaced_key(machine_key) else {
            return Vec::new();
        };
        store
            .state()
            .iter()
            .filter(|check| check.namespace().as_deref() == Some(namespace.as_str()))
            .map(|check| ObjectRef::from_obj(check.as_ref()))
            .collect()
    }
}
