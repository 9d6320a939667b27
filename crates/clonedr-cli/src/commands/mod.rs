//! CLI commands

use std::path::Path;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clonedr_cluster::Clients;
use clonedr_common::kube_utils::create_client;
use clonedr_common::ErrorList;
use clonedr_dr::{StagedAction, WorkerBuildOptions};

use crate::Result;

pub mod backup;
pub mod plan_worker;
pub mod restore;

use plan_worker::PlanWorker;

/// Flags shared by every action command
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Namespace of the cluster, issuers and DR volume
    #[arg(long, short = 'n', env = "CLONEDR_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Issuer that signs server certificates
    #[arg(long)]
    pub serving_issuer: String,

    /// Issuer that signs client certificates
    #[arg(long)]
    pub client_issuer: String,

    /// PersistentVolumeClaim holding dumps
    #[arg(long)]
    pub dr_volume: String,

    /// Gate client certificates behind approver-policy policies
    #[arg(long)]
    pub approval_policy: bool,

    /// Seconds to wait for the external worker before continuing; without
    /// it, Ctrl-C confirms the worker finished
    #[arg(long, value_name = "SECONDS")]
    pub hold: Option<u64>,
}

impl TargetArgs {
    pub fn hold(&self) -> Option<Duration> {
        self.hold.map(Duration::from_secs)
    }
}

pub(crate) async fn connect(kubeconfig: Option<&Path>) -> Result<Clients> {
    let client = create_client(kubeconfig).await?;
    Ok(Clients::from_kube(client))
}

/// Token cancelled on the first Ctrl-C
pub(crate) fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received");
            token.cancel();
        }
    });
    cancel
}

/// Drive a configured action through validate, setup, execute and cleanup
///
/// Cleanup always runs once setup succeeded, even when execute fails or the
/// run was cancelled. When both fail, the cleanup failure is reported first.
pub(crate) async fn drive(
    action: &mut dyn StagedAction,
    cancel: &CancellationToken,
    hold: Option<Duration>,
) -> Result<()> {
    let kind = action.kind();

    action.validate(cancel).await?;
    info!(action = kind, "Dependencies ready");

    let mut build_options = WorkerBuildOptions::default();
    action.setup(cancel, &mut build_options).await?;

    let worker = PlanWorker::new(kind, build_options, hold);
    let executed = action.execute(cancel, &worker).await;
    let cleaned = action.cleanup().await;

    match (executed, cleaned) {
        (Ok(()), Ok(())) => {}
        (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e.into()),
        (Err(executed), Err(cleaned)) => {
            ErrorList::from(vec![cleaned, executed]).into_result(format!("{} failed", kind))?;
        }
    }

    info!(action = kind, "Done");
    Ok(())
}
