//! `clonedr restore`: restore a dump into an existing cluster

use std::path::Path;

use clap::Args;
use tracing::info;

use clonedr_dr::{RestoreAction, RestoreOptions, StagedAction};

use crate::commands::{cancel_on_interrupt, connect, drive, TargetArgs};
use crate::config::CliConfig;
use crate::Result;

/// Restore a dump from the DR volume
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Cluster to restore into
    #[arg(long, short = 'c')]
    pub cluster: String,

    /// Cluster whose dump to restore (default: the target cluster)
    #[arg(long)]
    pub from: Option<String>,

    #[command(flatten)]
    pub target: TargetArgs,
}

/// Run the restore command
pub async fn run(args: RestoreArgs, config: &CliConfig, kubeconfig: Option<&Path>) -> Result<()> {
    let clients = connect(kubeconfig).await?;
    let options = RestoreOptions {
        user_cert: config.user_cert_options(args.target.approval_policy),
        mount_base: config.mount_base(),
        cleanup_timeout: config.cleanup_timeout(),
        dump_source: args.from.clone(),
    };

    let mut action = RestoreAction::new();
    action.configure(
        clients,
        &args.target.namespace,
        &args.cluster,
        &args.target.serving_issuer,
        &args.target.client_issuer,
        &args.target.dr_volume,
        options,
    )?;
    if let Some(id) = action.id() {
        info!(action_id = %id, cluster = %args.cluster, "Starting restore");
    }

    let cancel = cancel_on_interrupt();
    drive(&mut action, &cancel, args.target.hold()).await?;

    println!("Restore into '{}' complete.", args.cluster);
    Ok(())
}
