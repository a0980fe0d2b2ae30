//! Disruption-budget controller: the ledger that gates voluntary
//! machine disruptions.
//!
//! The reconciler recomputes the counters from scratch every pass: which
//! machines the selector governs, how many the fleet owners intend to
//! run, how many are healthy right now, and how many disruptions that
//! leaves. Consumers go through [`consume_disruption`], which decrements
//! `disruptionsAllowed` with a compare-and-swap on the status
//! subresource so two admissions cannot spend the same slot. Read paths
//! resolve the governing budget with [`budget_for_machine`], which stays
//! usable while overlapping budgets are being untangled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use triage_common::conditions::node_ready;
use triage_common::crd::{
    Machine, MachineDeployment, MachineDisruptionBudget, MachineDisruptionBudgetStatus, MachineSet,
};
use triage_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use triage_common::kube_utils::is_api_error_code;
use triage_common::selector::{selector_is_empty, selector_matches};
use triage_common::{Error, ReconcileError};

/// How long a consumed disruption pins its machine in the ledger before
/// the slot is handed back.
pub const DISRUPTION_WINDOW: Duration = Duration::from_secs(120);

/// Attempts for the status compare-and-swap before admission gives up.
pub const DECREMENT_ATTEMPTS: usize = 5;

/// Requeue interval; disruption windows expire without watch events.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Kubernetes access needed by the budget controller and admission.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BudgetClient: Send + Sync {
    /// Fresh view of a budget; `None` when it is gone.
    async fn get_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDisruptionBudget>, Error>;

    /// All budgets in a namespace.
    async fn list_budgets(&self, namespace: &str) -> Result<Vec<MachineDisruptionBudget>, Error>;

    /// All machines in a namespace; selector filtering happens in-process.
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error>;

    /// Get a node by name.
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Get a machine set by namespace and name.
    async fn get_machine_set(&self, namespace: &str, name: &str)
        -> Result<Option<MachineSet>, Error>;

    /// Get a machine deployment by namespace and name.
    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>, Error>;

    /// Replace the budget status keyed on the object's resourceVersion.
    /// Concurrent writers get a 409 and must re-read.
    async fn replace_budget_status(&self, budget: &MachineDisruptionBudget) -> Result<(), Error>;
}

/// Real Kubernetes client implementation.
pub struct BudgetClientImpl {
    client: Client,
}

impl BudgetClientImpl {
    /// Wrap the given kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BudgetClient for BudgetClientImpl {
    async fn get_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDisruptionBudget>, Error> {
        let api: Api<MachineDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_budgets(&self, namespace: &str) -> Result<Vec<MachineDisruptionBudget>, Error> {
        let api: Api<MachineDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_machine_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineSet>, Error> {
        let api: Api<MachineSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>, Error> {
        let api: Api<MachineDeployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_budget_status(&self, budget: &MachineDisruptionBudget) -> Result<(), Error> {
        let namespace = budget.namespace().unwrap_or_default();
        let api: Api<MachineDisruptionBudget> = Api::namespaced(self.client.clone(), &namespace);
        api.replace_status(
            &budget.name_any(),
            &PostParams::default(),
            serde_json::to_vec(budget)?,
        )
        .await?;
        Ok(())
    }
}

/// Shared state for the budget controller.
pub struct Context {
    kube: Arc<dyn BudgetClient>,
    events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Production context talking to the cluster.
    pub fn new(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "triage-budget-controller",
        ));
        Self {
            kube: Arc::new(BudgetClientImpl::new(client)),
            events,
        }
    }

    /// Context with injected mock clients for unit tests.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn BudgetClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }
}

/// Whether the budget's selector governs a machine with these labels.
/// An absent or empty selector governs nothing, so a blank budget can
/// never take a whole cluster hostage.
pub fn governs(
    budget: &MachineDisruptionBudget,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    match budget.spec.selector.as_ref() {
        None => Ok(false),
        Some(selector) if selector_is_empty(selector) => Ok(false),
        Some(selector) => selector_matches(selector, labels),
    }
}

/// Healthy machines the budget requires, from whichever bound is set.
/// The arithmetic is literal: `maxUnavailable` larger than the fleet
/// yields a negative floor, which simply means everything may go.
fn desired_healthy(budget: &MachineDisruptionBudget, total: i32) -> Result<i32, Error> {
    match (budget.spec.min_available, budget.spec.max_unavailable) {
        (Some(min), None) => Ok(min),
        (None, Some(max)) => Ok(total - max),
        _ => Err(Error::validation(
            format!("MachineDisruptionBudget/{}", budget.name_any()),
            "exactly one of minAvailable and maxUnavailable must be set",
        )),
    }
}

/// Drop ledger entries whose window expired or whose machine left the
/// fleet or is terminating; their slots flow back into
/// `disruptionsAllowed`. Also returns the time until the earliest kept
/// entry expires, which is when the counters need recomputing next.
fn refresh_disrupted(
    disrupted: &BTreeMap<String, Time>,
    machines: &[Machine],
    now: DateTime<Utc>,
) -> (BTreeMap<String, Time>, Option<Duration>) {
    let live: BTreeSet<String> = machines
        .iter()
        .filter(|m| m.metadata.deletion_timestamp.is_none())
        .map(|m| m.name_any())
        .collect();
    let mut kept = BTreeMap::new();
    let mut next_recheck: Option<Duration> = None;
    for (name, since) in disrupted {
        // whole seconds: wire timestamps carry nothing finer
        let held = Duration::from_secs(
            now.signed_duration_since(since.0).num_seconds().max(0) as u64,
        );
        if held >= DISRUPTION_WINDOW || !live.contains(name) {
            continue;
        }
        let remaining = DISRUPTION_WINDOW - held;
        next_recheck = Some(next_recheck.map_or(remaining, |r| r.min(remaining)));
        kept.insert(name.clone(), since.clone());
    }
    (kept, next_recheck)
}

fn controller_owner<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == kind)
}

/// The replica-owning object above a machine: its deployment when the
/// owning set has one, otherwise the set itself.
async fn fleet_owner(
    kube: &dyn BudgetClient,
    namespace: &str,
    machine: &Machine,
) -> Result<Option<(String, i32)>, Error> {
    let Some(owner) = controller_owner(&machine.metadata, "MachineSet") else {
        return Ok(None);
    };
    let set = kube
        .get_machine_set(namespace, &owner.name)
        .await?
        .ok_or_else(|| {
            Error::validation(
                format!("Machine/{}", machine.name_any()),
                format!("owning machine set {} not found", owner.name),
            )
        })?;
    if let Some(deployment_owner) = controller_owner(&set.metadata, "MachineDeployment") {
        let deployment = kube
            .get_machine_deployment(namespace, &deployment_owner.name)
            .await?
            .ok_or_else(|| {
                Error::validation(
                    format!("MachineSet/{}", set.name_any()),
                    format!(
                        "owning machine deployment {} not found",
                        deployment_owner.name
                    ),
                )
            })?;
        return Ok(Some((
            deployment_owner.uid.clone(),
            deployment.spec.replicas.unwrap_or(1),
        )));
    }
    Ok(Some((owner.uid.clone(), set.spec.replicas.unwrap_or(1))))
}

/// Fleet size the owners intend: each distinct owner contributes its
/// replica count once, ownerless machines count themselves.
async fn expected_total(
    kube: &dyn BudgetClient,
    namespace: &str,
    machines: &[Machine],
) -> Result<i32, Error> {
    let mut total = 0;
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for machine in machines {
        match fleet_owner(kube, namespace, machine).await? {
            Some((owner_uid, replicas)) => {
                if seen.insert(owner_uid) {
                    total += replicas;
                }
            }
            None => total += 1,
        }
    }
    Ok(total)
}

fn zeroed_status(budget: &MachineDisruptionBudget) -> MachineDisruptionBudgetStatus {
    MachineDisruptionBudgetStatus {
        observed_generation: budget.metadata.generation,
        ..Default::default()
    }
}

/// Write the computed status unless it already matches the fresh view.
async fn write_status(
    ctx: &Context,
    fresh: &MachineDisruptionBudget,
    status: MachineDisruptionBudgetStatus,
) -> Result<(), Error> {
    if fresh.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let mut updated = fresh.clone();
    updated.status = Some(status);
    ctx.kube.replace_budget_status(&updated).await
}

/// Reconcile one budget's counters.
#[instrument(skip(budget, ctx), fields(budget = %budget.name_any()))]
pub async fn reconcile(
    budget: Arc<MachineDisruptionBudget>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = budget.name_any();
    let namespace = budget.namespace().unwrap_or_default();
    // fresh read: admission mutates the status between watch events
    let Some(budget) = ctx.kube.get_budget(&namespace, &name).await? else {
        debug!("budget gone");
        return Ok(Action::await_change());
    };

    let selector = match budget.spec.selector.as_ref() {
        Some(selector) if !selector_is_empty(selector) => selector,
        _ => {
            debug!("budget selector governs no machines");
            write_status(&ctx, &budget, zeroed_status(&budget)).await?;
            return Ok(Action::await_change());
        }
    };

    let mut machines = Vec::new();
    for machine in ctx.kube.list_machines(&namespace).await? {
        match selector_matches(selector, machine.labels()) {
            Ok(true) => machines.push(machine),
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "budget selector is invalid");
                ctx.events
                    .publish(
                        &budget.object_ref(&()),
                        EventType::Warning,
                        reasons::NO_MACHINES,
                        actions::RECONCILE_BUDGET,
                        Some(format!("selector is invalid: {err}")),
                    )
                    .await;
                write_status(&ctx, &budget, zeroed_status(&budget)).await?;
                return Ok(Action::await_change());
            }
        }
    }
    if machines.is_empty() {
        ctx.events
            .publish(
                &budget.object_ref(&()),
                EventType::Warning,
                reasons::NO_MACHINES,
                actions::RECONCILE_BUDGET,
                Some("no machines match the budget selector".to_string()),
            )
            .await;
    }

    let now = Utc::now();
    let previous = budget.status.clone().unwrap_or_default();
    let (disrupted, next_recheck) =
        refresh_disrupted(&previous.disrupted_machines, &machines, now);
    if !disrupted.is_empty() {
        ctx.events
            .publish(
                &budget.object_ref(&()),
                EventType::Warning,
                reasons::DISRUPTED_MACHINES,
                actions::RECONCILE_BUDGET,
                Some(format!(
                    "machines still inside the disruption window: {}",
                    disrupted
                        .keys()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
            )
            .await;
    }

    let total = expected_total(ctx.kube.as_ref(), &namespace, &machines).await?;
    let desired = desired_healthy(&budget, total)?;

    let mut healthy = 0;
    for machine in &machines {
        if machine.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let ready = match machine.node_name() {
            Some(node) => ctx
                .kube
                .get_node(node)
                .await?
                .as_ref()
                .is_some_and(node_ready),
            None => false,
        };
        if ready && !disrupted.contains_key(&machine.name_any()) {
            healthy += 1;
        }
    }

    let status = MachineDisruptionBudgetStatus {
        total,
        desired_healthy: desired,
        current_healthy: healthy,
        disruptions_allowed: (healthy - desired).max(0),
        disrupted_machines: disrupted,
        observed_generation: budget.metadata.generation,
    };
    write_status(&ctx, &budget, status).await?;
    // kept ledger entries hand their slot back at a known moment; wake
    // up then instead of waiting out the resync
    Ok(Action::requeue(next_recheck.unwrap_or(RESYNC_INTERVAL)))
}

/// Admit a voluntary disruption of `machine`, spending one slot of the
/// governing budget.
///
/// `Ok` means admitted (or ungoverned). Every `Err` is a denial: the
/// budget is exhausted, ambiguous, stale, or could not be updated.
pub async fn consume_disruption(
    kube: &dyn BudgetClient,
    events: &dyn EventPublisher,
    machine: &Machine,
) -> Result<(), Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let machine_name = machine.name_any();

    let mut governing = Vec::new();
    for budget in kube.list_budgets(&namespace).await? {
        if governs(&budget, machine.labels())? {
            governing.push(budget);
        }
    }
    let target = match governing.len() {
        0 => return Ok(()),
        1 => &governing[0],
        _ => {
            events
                .publish(
                    &machine.object_ref(&()),
                    EventType::Warning,
                    reasons::AMBIGUOUS_BUDGETS,
                    actions::REMEDIATE,
                    Some(format!(
                        "machine {machine_name} matches more than one disruption budget"
                    )),
                )
                .await;
            return Err(Error::validation(
                format!("Machine/{machine_name}"),
                "machine matches more than one disruption budget",
            ));
        }
    };
    let budget_name = target.name_any();

    for _ in 0..DECREMENT_ATTEMPTS {
        let Some(fresh) = kube.get_budget(&namespace, &budget_name).await? else {
            return Err(Error::validation(
                format!("MachineDisruptionBudget/{budget_name}"),
                "budget disappeared during admission",
            ));
        };
        if !fresh.status_is_current() {
            return Err(Error::internal(
                "disruption admission",
                "budget status is not computed for the current spec",
            ));
        }
        if fresh.disruptions_allowed() <= 0 {
            return Err(Error::validation(
                format!("MachineDisruptionBudget/{budget_name}"),
                "no disruptions allowed",
            ));
        }

        let mut updated = fresh.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.disruptions_allowed -= 1;
        status
            .disrupted_machines
            .insert(machine_name.clone(), Time(Utc::now()));
        match kube.replace_budget_status(&updated).await {
            Ok(()) => return Ok(()),
            Err(err) if is_api_error_code(&err, 409) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(Error::internal(
        "disruption admission",
        "budget decrement kept conflicting",
    ))
}

/// Resolve the budget governing `machine` for read paths.
///
/// Overlapping budgets are a configuration problem the cluster operator
/// has to untangle; until then the first match in listing order wins
/// and a warning event flags the machine, so lookups stay deterministic
/// where the write path in [`consume_disruption`] refuses to choose.
pub async fn budget_for_machine(
    kube: &dyn BudgetClient,
    events: &dyn EventPublisher,
    machine: &Machine,
) -> Result<Option<MachineDisruptionBudget>, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let mut governing = Vec::new();
    for budget in kube.list_budgets(&namespace).await? {
        if governs(&budget, machine.labels())? {
            governing.push(budget);
        }
    }
    if governing.len() > 1 {
        warn!(
            machine = %machine.name_any(),
            budgets = governing.len(),
            "machine matches more than one disruption budget"
        );
        events
            .publish(
                &machine.object_ref(&()),
                EventType::Warning,
                reasons::AMBIGUOUS_BUDGETS,
                actions::RECONCILE_BUDGET,
                Some(format!(
                    "machine {} matches {} disruption budgets; using {}",
                    machine.name_any(),
                    governing.len(),
                    governing[0].name_any()
                )),
            )
            .await;
    }
    Ok(governing.into_iter().next())
}

/// Watch mapper for machines: requeues every same-namespace budget that
/// governs the machine's labels.
pub fn budgets_for_machine(
    store: Store<MachineDisruptionBudget>,
) -> impl Fn(Machine) -> Vec<ObjectRef<MachineDisruptionBudget>> {
    move |machine: Machine| {
        let namespace = machine.namespace().unwrap_or_default();
        store
            .state()
            .iter()
            .filter(|budget| budget.namespace().as_deref() == Some(namespace.as_str()))
            .filter(|budget| governs(budget, machine.labels()).unwrap_or(false))
            .map(|budget| ObjectRef::from_obj(budget.as_ref()))
            .collect()
    }
}
