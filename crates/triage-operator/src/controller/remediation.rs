//! Remediation dispatch: routes each request to its protocol.
//!
//! The reconciler owns nothing but the routing. The protocols in
//! [`crate::remediator`] re-read the request themselves, so a stale
//! dispatched view can never push the state machine backwards.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use triage_common::crd::{MachineRemediation, RemediationType};
use triage_common::ReconcileError;

use crate::remediator::{BareMetalRemediator, Remediator};

/// Requeue interval while a protocol is running. Power transitions do not
/// surface as watch events, so the state machine is driven by polling.
pub const STEP_REQUEUE: Duration = Duration::from_secs(10);

/// Shared state for the remediation controller.
pub struct Context {
    remediator: Arc<dyn Remediator>,
}

impl Context {
    /// Production context backed by the bare-metal remediator.
    pub fn new(client: Client) -> Self {
        Self {
            remediator: Arc::new(BareMetalRemediator::new(client)),
        }
    }

    /// Context with an injected mock remediator for unit tests.
    #[cfg(test)]
    pub fn for_testing(remediator: Arc<dyn Remediator>) -> Self {
        Self { remediator }
    }
}

/// Reconcile a single remediation request.
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn reconcile(
    request: Arc<MachineRemediation>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if request.metadata.deletion_timestamp.is_some() {
        debug!("request is being deleted");
        return Ok(Action::await_change());
    }
    // cleanup runs before the terminal status lands, so a terminal view
    // has nothing left to do
    if request.is_terminal() {
        debug!("request already terminal");
        return Ok(Action::await_change());
    }

    match request.spec.remediation_type {
        RemediationType::Reboot => ctx.remediator.reboot(&request).await?,
        RemediationType::Recreate => ctx.remediator.recreate(&request).await?,
    }
    Ok(Action::requeue(STEP_REQUEUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::remediator::MockRemediator;
    use triage_common::crd::RemediationState;
    use triage_common::Error;

    #[tokio::test]
    async fn reboot_requests_go_to_the_reboot_protocol() {
        let request = fixtures::remediation("worker-0", RemediationType::Reboot, None);
        let mut remediator = MockRemediator::new();
        remediator
            .expect_reboot()
            .withf(|r| r.spec.machine_name == "worker-0")
            .times(1)
            .returning(|_| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(remediator)));

        let action = reconcile(Arc::new(request), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(STEP_REQUEUE));
    }

    #[tokio::test]
    async fn recreate_requests_go_to_the_recreate_protocol() {
        let request = fixtures::remediation("worker-0", RemediationType::Recreate, None);
        let mut remediator = MockRemediator::new();
        remediator.expect_recreate().times(1).returning(|_| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(remediator)));

        let action = reconcile(Arc::new(request), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(STEP_REQUEUE));
    }

    #[tokio::test]
    async fn deleting_requests_are_left_alone() {
        let request = fixtures::deleting(fixtures::remediation(
            "worker-0",
            RemediationType::Reboot,
            None,
        ));
        // no protocol expectations: stepping a terminating request would panic
        let remediator = MockRemediator::new();
        let ctx = Arc::new(Context::for_testing(Arc::new(remediator)));

        let action = reconcile(Arc::new(request), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn terminal_requests_are_left_alone() {
        let request = fixtures::remediation(
            "worker-0",
            RemediationType::Reboot,
            Some(RemediationState::Succeeded),
        );
        let remediator = MockRemediator::new();
        let ctx = Arc::new(Context::for_testing(Arc::new(remediator)));

        let action = reconcile(Arc::new(request), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn protocol_failures_surface_as_reconcile_errors() {
        let request = fixtures::remediation("worker-0", RemediationType::Reboot, None);
        let mut remediator = MockRemediator::new();
        remediator
            .expect_reboot()
            .returning(|_| Err(Error::internal("power management", "unreachable")));
        let ctx = Arc::new(Context::for_testing(Arc::new(remediator)));

        let result = reconcile(Arc::new(request), ctx).await;
        assert!(matches!(result, Err(ReconcileError::Internal(_))));
    }
}
