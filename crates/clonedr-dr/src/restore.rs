//! Restore a dump from the DR volume into an existing cluster
//!
//! Setup issues a `postgres` client certificate for the target cluster and
//! declares the DR volume, the target's server CA (only `ca.crt`) and the
//! client certificate as worker volumes.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use clonedr_cluster::resources::cert_manager::SECRET_KEY_CA;
use clonedr_cluster::resources::cnpg::{POSTGRES_PORT, ROLE_POSTGRES};
use clonedr_cluster::resources::{Cluster, IssuerRef};
use clonedr_cluster::{Clients, ClusterUserCert, ClusterUserCertOptions};
use clonedr_common::cleanup::CERTIFICATE_CLEANUP_FLOOR;
use clonedr_common::names::{limited_name, MAX_NAME_LENGTH};
use clonedr_common::{check_cancelled, CleanupTask, Error};

use crate::action::{validate_dependencies, ActionId, Dependencies, Lifecycle, Phase, StagedAction};
use crate::credentials::PostgresCredentials;
use crate::volumes::{
    mount_path, volume_name, KeyToPath, WorkerBuildOptions, WorkerVolume, DEFAULT_MOUNT_BASE,
};
use crate::worker::{dump_file_path, RemoteWorker};

const ACTION_KIND: &str = "restore";

/// Longest scope name whose user certificate name keeps its role suffix
const MAX_SCOPE_LENGTH: usize = MAX_NAME_LENGTH - "-postgres-user".len();

/// Options for [`RestoreAction`]
#[derive(Clone, Debug)]
pub struct RestoreOptions {
    /// How the `postgres` user certificate is issued
    pub user_cert: ClusterUserCertOptions,
    /// Directory the worker mounts volumes under
    pub mount_base: String,
    /// Bound for deleting the user certificate; raised to the certificate floor
    pub cleanup_timeout: Duration,
    /// Cluster whose dump is restored; defaults to the target cluster
    pub dump_source: Option<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            user_cert: ClusterUserCertOptions::default(),
            mount_base: DEFAULT_MOUNT_BASE.to_string(),
            cleanup_timeout: Duration::ZERO,
            dump_source: None,
        }
    }
}

#[derive(Debug)]
struct RestoreParams {
    clients: Clients,
    namespace: String,
    target_cluster: String,
    serving_issuer: String,
    client_issuer: String,
    dr_volume_claim: String,
    options: RestoreOptions,
}

impl RestoreParams {
    fn dump_source(&self) -> &str {
        self.options
            .dump_source
            .as_deref()
            .unwrap_or(&self.target_cluster)
    }
}

#[derive(Clone, Debug)]
struct RestoreMounts {
    dr: String,
    server_ca: String,
    client_cert: String,
}

/// Restore a dump into an existing cluster
#[derive(Debug)]
pub struct RestoreAction {
    lifecycle: Lifecycle,
    params: Option<RestoreParams>,
    target: Option<Cluster>,
    user_cert: Option<ClusterUserCert>,
    mounts: Option<RestoreMounts>,
}

impl Default for RestoreAction {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreAction {
    /// An unconfigured action
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(ACTION_KIND),
            params: None,
            target: None,
            user_cert: None,
            mounts: None,
        }
    }

    /// Store parameters and generate the action identifier; only once
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        clients: Clients,
        namespace: &str,
        target_cluster: &str,
        serving_issuer: &str,
        client_issuer: &str,
        dr_volume_claim: &str,
        options: RestoreOptions,
    ) -> Result<(), Error> {
        self.lifecycle.configure()?;
        self.params = Some(RestoreParams {
            clients,
            namespace: namespace.to_string(),
            target_cluster: target_cluster.to_string(),
            serving_issuer: serving_issuer.to_string(),
            client_issuer: client_issuer.to_string(),
            dr_volume_claim: dr_volume_claim.to_string(),
            options,
        });
        Ok(())
    }

    fn params(&self) -> Result<&RestoreParams, Error> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::sequence(ACTION_KIND, "action is not configured"))
    }

    /// Cluster restored into, once configured
    pub fn target_cluster(&self) -> Option<&str> {
        self.params.as_ref().map(|p| p.target_cluster.as_str())
    }

    /// The issued user certificate, between setup and a successful cleanup
    pub fn user_cert(&self) -> Option<&ClusterUserCert> {
        self.user_cert.as_ref()
    }

    /// Dump file read inside the worker, once set up
    pub fn dump_file(&self) -> Option<String> {
        let params = self.params.as_ref()?;
        let mounts = self.mounts.as_ref()?;
        Some(dump_file_path(&mounts.dr, params.dump_source()))
    }
}

fn restore_volumes(
    target: &Cluster,
    user_cert: &ClusterUserCert,
    params: &RestoreParams,
    id: &ActionId,
) -> Result<(RestoreMounts, Vec<WorkerVolume>), Error> {
    let base = &params.options.mount_base;
    let mounts = RestoreMounts {
        dr: mount_path(base, id, "dr"),
        server_ca: mount_path(base, id, "server-ca"),
        client_cert: mount_path(base, id, "client-cert"),
    };
    let client_secret = user_cert
        .secret_name()
        .ok_or_else(|| {
            Error::internal_with_context(ACTION_KIND, "user certificate has no secret")
        })?;

    let volumes = vec![
        WorkerVolume::claim(volume_name("dr", id), &mounts.dr, &params.dr_volume_claim),
        WorkerVolume::secret(
            volume_name("server-ca", id),
            &mounts.server_ca,
            target.server_ca_secret(),
            vec![KeyToPath::same(SECRET_KEY_CA)],
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
impl StagedAction for RestoreAction {
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
        let target = validate_dependencies(
            &params.clients,
            cancel,
            &Dependencies {
                namespace: &params.namespace,
                cluster: &params.target_cluster,
                serving_issuer: &params.serving_issuer,
                client_issuer: &params.client_issuer,
                volume_claim: &params.dr_volume_claim,
            },
        )
        .await?;
        self.target = Some(target);
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
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| {
                Error::internal_with_context(ACTION_KIND, "validated without a target")
            })?;

        let scope = limited_name(&params.target_cluster, id.as_str(), MAX_SCOPE_LENGTH);
        let mut user_cert = ClusterUserCert::provision(
            &params.clients,
            cancel,
            &params.namespace,
            ROLE_POSTGRES,
            &IssuerRef::issuer(&params.client_issuer),
            &scope,
            &params.options.user_cert,
        )
        .await?;

        let (mounts, volumes) = match restore_volumes(target, &user_cert, params, &id) {
            Ok(declared) => declared,
            Err(e) => {
                let cert = &mut user_cert;
                return Err(CleanupTask::new(move || async move { cert.delete().await })
                    .with_message("failed to clean up restore user certificate")
                    .with_timeout(params.options.cleanup_timeout)
                    .with_floor(CERTIFICATE_CLEANUP_FLOOR)
                    .unwind(e)
                    .await);
            }
        };

        for volume in volumes {
            build_options.add_volume(volume);
        }
        info!(action_id = %id, target = %params.target_cluster, "Restore action set up");
        self.user_cert = Some(user_cert);
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
        let (Some(target), Some(mounts)) = (self.target.as_ref(), self.mounts.as_ref()) else {
            return Err(Error::internal_with_context(ACTION_KIND, "set up without a target"));
        };

        let credentials = PostgresCredentials::new(
            target.read_write_host(),
            POSTGRES_PORT,
            ROLE_POSTGRES,
            target.database_name(),
        )
        .with_client_certificate(&mounts.client_cert)
        .with_root_certificate(format!("{}/{}", mounts.server_ca, SECRET_KEY_CA));
        let input_file = dump_file_path(&mounts.dr, params.dump_source());

        check_cancelled(cancel, "starting restore")?;
        worker.restore(cancel, &credentials, &input_file).await?;

        info!(input_file = %input_file, "Restore complete");
        self.lifecycle.advance(Phase::Executed);
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), Error> {
        if !self.lifecycle.needs_cleanup() {
            return Ok(());
        }
        let timeout = self.params()?.options.cleanup_timeout;
        let Some(user_cert) = self.user_cert.as_mut() else {
            return Ok(());
        };

        CleanupTask::new(move || async move { user_cert.delete().await })
            .with_message("failed to clean up restore user certificate")
            .with_timeout(timeout)
            .with_floor(CERTIFICATE_CLEANUP_FLOOR)
            .run()
            .await?;

        self.user_cert = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use clonedr_cluster::{
        MockApprovalPolicyClient, MockCertManagerClient, MockCnpgClient, MockVolumeClient,
    };

    use crate::worker::MockRemoteWorker;

    fn clients(clusters: MockCnpgClient) -> Clients {
        Clients {
            certificates: Arc::new(MockCertManagerClient::new()),
            policies: Arc::new(MockApprovalPolicyClient::new()),
            clusters: Arc::new(clusters),
            volumes: Arc::new(MockVolumeClient::new()),
        }
    }

    fn configured(clusters: MockCnpgClient) -> RestoreAction {
        let mut action = RestoreAction::new();
        action
            .configure(
                clients(clusters),
                "db",
                "pg",
                "serving-issuer",
                "client-issuer",
                "dr-claim",
                RestoreOptions::default(),
            )
            .expect("first configure succeeds");
        action
    }

    /// Story: a restore cannot be set up or executed before validation,
    /// and nothing remote is touched.
    #[tokio::test]
    async fn story_setup_and_execute_require_validation() {
        let cancel = CancellationToken::new();
        let mut build = WorkerBuildOptions::default();
        let worker = MockRemoteWorker::new();
        let mut action = configured(MockCnpgClient::new());

        let err = action
            .setup(&cancel, &mut build)
            .await
            .expect_err("not validated");
        assert!(err.to_string().contains("only configured"));
        assert!(matches!(
            action.execute(&cancel, &worker).await,
            Err(Error::Sequence { .. })
        ));
        assert!(build.volumes.is_empty());
        assert_eq!(action.phase(), Phase::Configured);
    }

    /// Story: a target cluster that is not ready fails validation and the
    /// action stays configured so validation can be retried.
    #[tokio::test]
    async fn story_unready_target_fails_validation() {
        let mut clusters = MockCnpgClient::new();
        clusters
            .expect_get_cluster()
            .times(1)
            .returning(|_, name| {
                let mut cluster = Cluster::new(
                    clonedr_common::kube_utils::ObjectMeta::new(name, "db"),
                    Default::default(),
                );
                cluster.status = Some(Default::default());
                Ok(cluster)
            });
        let mut action = configured(clusters);

        let err = action
            .validate(&CancellationToken::new())
            .await
            .expect_err("cluster not ready");
        assert!(matches!(err, Error::NotReady { .. }));
        assert_eq!(action.phase(), Phase::Configured);
    }

    #[tokio::test]
    async fn test_cancelled_validation_makes_no_calls() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut action = configured(MockCnpgClient::new());

        let err = action.validate(&cancel).await.expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[test]
    fn test_dump_source_defaults_to_target() {
        let mut action = configured(MockCnpgClient::new());
        assert_eq!(action.params().map(RestoreParams::dump_source).ok(), Some("pg"));

        action = RestoreAction::new();
        action
            .configure(
                clients(MockCnpgClient::new()),
                "db",
                "pg",
                "s",
                "c",
                "v",
                RestoreOptions {
                    dump_source: Some("pg-old".to_string()),
                    ..Default::default()
                },
            )
            .expect("configure");
        assert_eq!(action.params().map(RestoreParams::dump_source).ok(), Some("pg-old"));
    }

    #[test]
    fn test_scope_leaves_room_for_role_suffix() {
        let id = ActionId::generate();
        let scope = limited_name(&"x".repeat(80), id.as_str(), MAX_SCOPE_LENGTH);
        let cert = clonedr_cluster::user_cert::user_certificate_name(&scope, ROLE_POSTGRES);
        assert!(cert.len() <= MAX_NAME_LENGTH);
        assert!(cert.contains(id.as_str()));
        assert!(cert.ends_with("-postgres-user"));
    }
}
