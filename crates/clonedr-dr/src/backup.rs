//! Back up a database from an isolated clone of its cluster
//!
//! Setup clones the source cluster (so the dump never touches production)
//! and declares three volumes for the worker: the DR volume the dump is
//! written to, the clone's serving certificate (public half only) to verify
//! the server, and the `postgres` client certificate to authenticate.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use clonedr_cluster::resources::cert_manager::SECRET_KEY_CERT;
use clonedr_cluster::resources::cnpg::{
    DEFAULT_APPLICATION_DATABASE, POSTGRES_PORT, ROLE_POSTGRES,
};
use clonedr_cluster::resources::IssuerRef;
use clonedr_cluster::{
    clone_cluster, Clients, CloneClusterOptions, ClonedCluster, MAX_CLONE_NAME_LENGTH,
};
use clonedr_common::cleanup::CLONE_CLEANUP_FLOOR;
use clonedr_common::names::limited_name;
use clonedr_common::{check_cancelled, CleanupTask, Error};

use crate::action::{validate_dependencies, ActionId, Dependencies, Lifecycle, Phase, StagedAction};
use crate::credentials::PostgresCredentials;
use crate::volumes::{
    mount_path, volume_name, KeyToPath, WorkerBuildOptions, WorkerVolume, DEFAULT_MOUNT_BASE,
};
use crate::worker::{dump_file_path, RemoteWorker};

const ACTION_KIND: &str = "backup";

/// Options for [`BackupAction`]
#[derive(Clone, Debug)]
pub struct BackupOptions {
    /// How the clone is built
    pub clone: CloneClusterOptions,
    /// Directory the worker mounts volumes under
    pub mount_base: String,
    /// Bound for tearing the clone down; raised to the clone cleanup floor
    pub cleanup_timeout: Duration,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            clone: CloneClusterOptions::default(),
            mount_base: DEFAULT_MOUNT_BASE.to_string(),
            cleanup_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct BackupParams {
    clients: Clients,
    namespace: String,
    source_cluster: String,
    new_cluster_base: String,
    serving_issuer: String,
    client_issuer: String,
    dr_volume_claim: String,
    options: BackupOptions,
}

#[derive(Clone, Debug)]
struct BackupMounts {
    dr: String,
    serving_cert: String,
    client_cert: String,
}

/// Dump every database of a cluster, via a disposable clone, to the DR volume
#[derive(Debug)]
pub struct BackupAction {
    lifecycle: Lifecycle,
    params: Option<BackupParams>,
    clone: Option<ClonedCluster>,
    mounts: Option<BackupMounts>,
}

impl Default for BackupAction {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupAction {
    /// An unconfigured action
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(ACTION_KIND),
            params: None,
            clone: None,
            mounts: None,
        }
    }

    /// Store parameters and generate the action identifier; only once
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        clients: Clients,
        namespace: &str,
        source_cluster: &str,
        new_cluster_base: &str,
        serving_issuer: &str,
        client_issuer: &str,
        dr_volume_claim: &str,
        options: BackupOptions,
    ) -> Result<(), Error> {
        self.lifecycle.configure()?;
        self.params = Some(BackupParams {
            clients,
            namespace: namespace.to_string(),
            source_cluster: source_cluster.to_string(),
            new_cluster_base: new_cluster_base.to_string(),
            serving_issuer: serving_issuer.to_string(),
            client_issuer: client_issuer.to_string(),
            dr_volume_claim: dr_volume_claim.to_string(),
            options,
        });
        Ok(())
    }

    fn params(&self) -> Result<&BackupParams, Error> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::sequence(ACTION_KIND, "action is not configured"))
    }

    /// Cluster being backed up, once configured
    pub fn source_cluster(&self) -> Option<&str> {
        self.params.as_ref().map(|p| p.source_cluster.as_str())
    }

    /// The clone, between setup and a successful cleanup
    pub fn cloned_cluster(&self) -> Option<&ClonedCluster> {
        self.clone.as_ref()
    }

    /// Where the dump is written inside the worker, once set up
    pub fn dump_file(&self) -> Option<String> {
        let params = self.params.as_ref()?;
        let mounts = self.mounts.as_ref()?;
        Some(dump_file_path(&mounts.dr, &params.source_cluster))
    }
}

/// Volumes for the worker; fails only if the clone is missing a secret
fn backup_volumes(
    cloned: &ClonedCluster,
    params: &BackupParams,
    id: &ActionId,
) -> Result<(BackupMounts, Vec<WorkerVolume>), Error> {
    let base = &params.options.mount_base;
    let mounts = BackupMounts {
        dr: mount_path(base, id, "dr"),
        serving_cert: mount_path(base, id, "serving-cert"),
        client_cert: mount_path(base, id, "client-cert"),
    };

    let serving_secret = cloned
        .serving_cert()
        .map(|c| c.secret_name().to_string())
        .ok_or_else(|| {
            Error::internal_with_context(ACTION_KIND, "clone has no serving certificate")
        })?;
    let client_secret = cloned
        .postgres_user_cert()
        .and_then(|c| c.secret_name())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::internal_with_context(ACTION_KIND, "clone has no postgres certificate")
        })?;

    let volumes = vec![
        WorkerVolume::claim(volume_name("dr", id), &mounts.dr, &params.dr_volume_claim),
        WorkerVolume::secret(
            volume_name("serving-cert", id),
            &mounts.serving_cert,
            serving_secret,
            vec![KeyToPath::same(SECRET_KEY_CERT)],
        ),
        WorkerVolume::secret(
            volume_name("client-cert", id),
            &mounts.client_cert,
            client_secret,
            Vec::new(),
        ),
    ];
    Ok((mounts, volumes))
}

#[async_trait]
impl StagedAction for BackupAction {
    fn kind(&self) -> &'static str {
        self.lifecycle.kind()
    }

    fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    fn id(&self) -> Option<&ActionId> {
        self.lifecycle.id()
    }

    async fn validate(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        self.lifecycle
            .require("validate", &[Phase::Configured, Phase::Validated])?;
        let params = self.params()?;
        validate_dependencies(
            &params.clients,
            cancel,
            &Dependencies {
                namespace: &params.namespace,
                cluster: &params.source_cluster,
                serving_issuer: &params.serving_issuer,
                client_issuer: &params.client_issuer,
                volume_claim: &params.dr_volume_claim,
            },
        )
        .await?;
        self.lifecycle.advance(Phase::Validated);
        Ok(())
    }

    #[instrument(skip_all, fields(action = ACTION_KIND))]
    async fn setup(
        &mut self,
        cancel: &CancellationToken,
        build_options: &mut WorkerBuildOptions,
    ) -> Result<(), Error> {
        self.lifecycle.require("set up", &[Phase::Validated])?;
        let id = self.lifecycle.require_id()?.clone();
        let params = self.params()?;

        let clone_name = limited_name(&params.new_cluster_base, id.as_str(), MAX_CLONE_NAME_LENGTH);
        let mut cloned = clone_cluster(
            &params.clients,
            cancel,
            &params.namespace,
            &params.source_cluster,
            &clone_name,
            &IssuerRef::issuer(&params.serving_issuer),
            &IssuerRef::issuer(&params.client_issuer),
            &params.options.clone,
        )
        .await?;

        let (mounts, volumes) = match backup_volumes(&cloned, params, &id) {
            Ok(declared) => declared,
            Err(e) => {
                let target = &mut cloned;
                return Err(CleanupTask::new(move || async move { target.delete().await })
                    .with_message(format!("failed to clean up clone {}", clone_name))
                    .with_timeout(params.options.cleanup_timeout)
                    .with_floor(CLONE_CLEANUP_FLOOR)
                    .unwind(e)
                    .await);
            }
        };

        for volume in volumes {
            build_options.add_volume(volume);
        }
        info!(action_id = %id, clone = %clone_name, "Backup action set up");
        self.clone = Some(cloned);
        self.mounts = Some(mounts);
        self.lifecycle.advance(Phase::Setup);
        Ok(())
    }

    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        worker: &dyn RemoteWorker,
    ) -> Result<(), Error> {
        self.lifecycle.require("execute", &[Phase::Setup])?;
        let params = self.params()?;
        let (Some(cloned), Some(mounts)) = (self.clone.as_ref(), self.mounts.as_ref()) else {
            return Err(Error::internal_with_context(ACTION_KIND, "set up without a clone"));
        };

        let credentials = PostgresCredentials::new(
            cloned.read_write_host(),
            POSTGRES_PORT,
            ROLE_POSTGRES,
            cloned
                .database_name()
                .unwrap_or(DEFAULT_APPLICATION_DATABASE),
        )
        .with_client_certificate(&mounts.client_cert)
        .with_root_certificate(format!("{}/{}", mounts.serving_cert, SECRET_KEY_CERT));
        let output_file = dump_file_path(&mounts.dr, &params.source_cluster);

        check_cancelled(cancel, "starting dump")?;
        worker.dump_all(cancel, &credentials, &output_file).await?;

        info!(output_file = %output_file, "Backup dump complete");
        self.lifecycle.advance(Phase::Executed);
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), Error> {
        if !self.lifecycle.needs_cleanup() {
            return Ok(());
        }
        let timeout = self.params()?.options.cleanup_timeout;
        let Some(cloned) = self.clone.as_mut() else {
            return Ok(());
        };

        let message = format!("failed to clean up clone {}", cloned.name());
        CleanupTask::new(move || async move { cloned.delete().await })
            .with_message(message)
            .with_timeout(timeout)
            .with_floor(CLONE_CLEANUP_FLOOR)
            .run()
            .await?;

        self.clone = None;
        Ok(())
    }
}
