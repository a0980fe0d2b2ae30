//! Controller runner - builds controller futures for each vertical slice
//!
//! Each `build_*` function returns a Vec of boxed futures that can be
//! composed by the caller. This keeps controller construction pure and
//! separate from leader election and CRD installation in main.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use triage_common::crd::{
    Machine, MachineDisruptionBudget, MachineHealthCheck, MachineRemediation, NodeRecovery,
};
use triage_common::reconcile::default_error_policy;
use triage_common::TRIAGE_SYSTEM_NAMESPACE;

use crate::controller::{budget, healthcheck, marker, recovery, remediation};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the remediation request controllers: the dispatcher that drives
/// each request through its protocol, and the reboot-marker watcher that
/// opens requests from node annotations.
pub fn build_remediation_controllers(
    client: Client,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let dispatch_ctx = Arc::new(remediation::Context::new(client.clone()));
    let requests: Api<MachineRemediation> = Api::all(client.clone());
    let dispatch_ctrl = Controller::new(
        requests,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(remediation::reconcile, default_error_policy, dispatch_ctx)
    .for_each(log_reconcile_result("MachineRemediation"));

    let marker_ctx = Arc::new(marker::Context::new(client.clone()));
    let nodes: Api<Node> = Api::all(client);
    let marker_ctrl = Controller::new(
        nodes,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(marker::reconcile, default_error_policy, marker_ctx)
    .for_each(log_reconcile_result("RebootMarker"));

    tracing::info!("- MachineRemediation controller");
    tracing::info!("- RebootMarker controller");

    vec![Box::pin(dispatch_ctrl), Box::pin(marker_ctrl)]
}

/// Build the node-recovery controller. The node watch opens a recovery
/// record for every broken node and maps it into the record's queue key.
pub fn build_recovery_controllers(
    client: Client,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(recovery::Context::new(client.clone()));
    let records: Api<NodeRecovery> = Api::namespaced(client.clone(), TRIAGE_SYSTEM_NAMESPACE);
    let nodes: Api<Node> = Api::all(client.clone());

    let recovery_ctrl = Controller::new(
        records,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        nodes,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        recovery::discover_broken_nodes(client),
    )
    .shutdown_on_signal()
    .run(recovery::reconcile, default_error_policy, ctx)
    .for_each(log_reconcile_result("NodeRecovery"));

    tracing::info!("- NodeRecovery controller");

    vec![Box::pin(recovery_ctrl)]
}

/// Build the health controllers: the disruption-budget ledger and the
/// machine health check that consumes it. Both re-queue off secondary
/// watches (machines and nodes) through their primary stores.
pub fn build_health_controllers(
    client: Client,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let budget_ctx = Arc::new(budget::Context::new(client.clone()));
    let budgets: Api<MachineDisruptionBudget> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client.clone());
    let budget_controller = Controller::new(
        budgets,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let budget_store = budget_controller.store();
    let budget_ctrl = budget_controller
        .watches(
            machines,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            budget::budgets_for_machine(budget_store),
        )
        .shutdown_on_signal()
        .run(budget::reconcile, default_error_policy, budget_ctx)
        .for_each(log_reconcile_result("MachineDisruptionBudget"));

    let check_ctx = Arc::new(healthcheck::Context::new(client.clone()));
    let checks: Api<MachineHealthCheck> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);
    let check_controller = Controller::new(
        checks,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let check_store = check_controller.store();
    let check_ctrl = check_controller
        .watches(
            nodes,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            healthcheck::checks_for_node(check_store),
        )
        .shutdown_on_signal()
        .run(healthcheck::reconcile, default_error_policy, check_ctx)
        .for_each(log_reconcile_result("MachineHealthCheck"));

    tracing::info!("- MachineDisruptionBudget controller");
    tracing::info!("- MachineHealthCheck controller");

    vec![Box::pin(budget_ctrl), Box::pin(check_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
