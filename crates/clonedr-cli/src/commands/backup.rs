//! `clonedr backup`: dump a cluster through a disposable clone

use std::path::Path;

use clap::Args;
use tracing::info;

use clonedr_dr::{BackupAction, BackupOptions, StagedAction};

use crate::commands::{cancel_on_interrupt, connect, drive, TargetArgs};
use crate::config::CliConfig;
use crate::Result;

/// Back up a cluster's databases to the DR volume
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Cluster to back up
    #[arg(long, short = 'c')]
    pub cluster: String,

    /// Base name for the clone (default: "<cluster>-clone"); the action id is appended
    #[arg(long)]
    pub clone_name: Option<String>,

    #[command(flatten)]
    pub target: TargetArgs,
}

impl BackupArgs {
    pub fn clone_base(&self) -> String {
        self.clone_name
            .clone()
            .unwrap_or_else(|| format!("{}-clone", self.cluster))
    }
}

/// Run the backup command
pub async fn run(args: BackupArgs, config: &CliConfig, kubeconfig: Option<&Path>) -> Result<()> {
    let clients = connect(kubeconfig).await?;
    let options = BackupOptions {
        clone: config.clone_options(args.target.approval_policy)?,
        mount_base: config.mount_base(),
        cleanup_timeout: config.cleanup_timeout(),
    };

    let mut action = BackupAction::new();
    action.configure(
        clients,
        &args.target.namespace,
        &args.cluster,
        &args.clone_base(),
        &args.target.serving_issuer,
        &args.target.client_issuer,
        &args.target.dr_volume,
        options,
    )?;
    if let Some(id) = action.id() {
        info!(action_id = %id, cluster = %args.cluster, "Starting backup");
    }

    let cancel = cancel_on_interrupt();
    drive(&mut action, &cancel, args.target.hold()).await?;

    println!("Backup of '{}' complete.", args.cluster);
    Ok(())
}
