//! Triage Operator - Kubernetes node-health detection and remediation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use triage_common::crd::{
    MachineDisruptionBudget, MachineHealthCheck, MachineRemediation, NodeRecovery,
};
use triage_common::kube_utils::{create_client, ensure_namespace};
use triage_common::leader_election::LeaderElector;
use triage_common::{FIELD_MANAGER, LEADER_ELECTION_LEASE, TRIAGE_SYSTEM_NAMESPACE};
use triage_operator::controller_runner::{
    build_health_controllers, build_recovery_controllers, build_remediation_controllers,
};

/// Triage - Kubernetes operator for node-health detection and remediation
#[derive(Parser, Debug)]
#[command(name = "triage", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig file; in-cluster config when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

fn owned_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        MachineRemediation::crd(),
        NodeRecovery::crd(),
        MachineDisruptionBudget::crd(),
        MachineHealthCheck::crd(),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for all owned resources
        for crd in owned_crds() {
            let doc = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---");
            print!("{doc}");
        }
        return Ok(());
    }

    run_operator(cli.kubeconfig.as_deref()).await
}

/// Ensure all triage CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in owned_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All triage CRDs installed/updated");
    Ok(())
}

/// Identity written into the leader lease. The pod name (HOSTNAME) is
/// unique per replica; the pid keeps local runs apart.
fn leader_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "triage-operator".to_string());
    format!("{host}-{}", std::process::id())
}

/// Run the operator: install CRDs, win the leader lease, then drive all
/// controllers until shutdown or leadership loss.
async fn run_operator(kubeconfig: Option<&Path>) -> anyhow::Result<()> {
    tracing::info!("Triage operator starting...");

    let client = create_client(kubeconfig)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRDs on startup
    ensure_crds_installed(&client).await?;

    // Recovery records, the condition policy, and the leader lease live here
    ensure_namespace(&client, TRIAGE_SYSTEM_NAMESPACE, FIELD_MANAGER)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to ensure namespace: {}", e))?;

    // Only the leader runs controllers; standby replicas block here
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_ELECTION_LEASE,
        TRIAGE_SYSTEM_NAMESPACE,
        &leader_identity(),
    ));
    let mut leadership = elector
        .acquire()
        .await
        .map_err(|e| anyhow::anyhow!("Leader election failed: {}", e))?;

    tracing::info!("Starting controllers:");
    let mut controllers = build_remediation_controllers(client.clone());
    controllers.extend(build_recovery_controllers(client.clone()));
    controllers.extend(build_health_controllers(client));

    // Run all controllers concurrently until they drain on a shutdown
    // signal, or drop them the moment leadership is gone
    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers completed");
        }
        _ = leadership.lost() => {
            tracing::warn!("Leadership lost, shutting down");
        }
    }

    if let Err(e) = leadership.release_leadership().await {
        tracing::warn!(error = %e, "Failed to release leadership lease");
    }

    tracing::info!("Triage operator shutting down");
    Ok(())
}
