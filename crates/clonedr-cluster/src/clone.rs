//! Disposable clones of CloudNativePG clusters
//!
//! [`clone_cluster`] builds, strictly in order:
//!
//! 1. reads the source cluster (storage size, class, database, owner)
//! 2. a backup of the source, awaited until complete
//! 3. a serving certificate for every service name of the clone
//! 4. a client CA certificate and an issuer backed by it
//! 5. `postgres` and `streaming_replica` client certificates from that issuer
//! 6. the clone itself, recovered from the backup and wired to the above
//!
//! and finally deletes the backup. Every object is recorded on the
//! [`ClonedCluster`] handle the moment it exists; if any step fails
//! (including the final backup deletion) the handle is torn down in reverse
//! order under a detached deadline and nothing is returned.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use clonedr_common::cleanup::CLONE_CLEANUP_FLOOR;
use clonedr_common::kube_utils::{ObjectMeta, LABEL_CLONE_OF};
use clonedr_common::names::{limited_name, MAX_CLUSTER_NAME_LENGTH, MAX_NAME_LENGTH};
use clonedr_common::quantity::StorageSize;
use clonedr_common::{check_cancelled, CleanupTask, Error, ErrorList, WaitOptions};

use crate::client::Clients;
use crate::resources::cnpg::{
    BootstrapRecovery, CertificatesConfiguration, ClusterBootstrap, ClusterSpec,
    LocalObjectReference, PostgresConfiguration, StorageConfiguration,
    BACKUP_METHOD_VOLUME_SNAPSHOT, ROLE_POSTGRES, ROLE_STREAMING_REPLICA, SERVICE_SUFFIXES,
};
use crate::resources::{Backup, Certificate, Cluster, Issuer, IssuerRef};
use crate::user_cert::{ClusterUserCert, ClusterUserCertOptions};

/// Field the source storage size is read from, for error reporting
const STORAGE_SIZE_FIELD: &str = "spec.storage.size";

/// Longest clone name whose derived object names keep their full suffix
pub const MAX_CLONE_NAME_LENGTH: usize = MAX_NAME_LENGTH - "-streaming-replica-user".len();

const _: () = assert!(MAX_CLONE_NAME_LENGTH <= MAX_CLUSTER_NAME_LENGTH);

/// pg_hba rule requiring certificate authentication over TLS
const PG_HBA_CERT_ONLY: &str = "hostssl all all all cert";

/// Options for [`clone_cluster`]
#[derive(Clone, Debug)]
pub struct CloneClusterOptions {
    /// Wait for the backup to complete
    pub backup_wait: WaitOptions,
    /// Wait for each certificate
    pub certificate_wait: WaitOptions,
    /// Wait for the client CA issuer
    pub issuer_wait: WaitOptions,
    /// Wait for the clone to become ready
    pub cluster_wait: WaitOptions,
    /// Cleanup bound; raised to the clone cleanup floor when lower
    pub cleanup_timeout: Duration,
    /// Gate client certificates behind approver-policy policies
    pub enable_approval_policy: bool,
    /// Lifetime of every certificate issued for the clone
    pub certificate_duration: Option<String>,
    /// CNPG backup method
    pub backup_method: String,
    /// Instances in the clone
    pub instances: i32,
    /// Lower bound for the clone's storage size
    pub minimum_storage_size: Option<StorageSize>,
    /// Cluster DNS domain (e.g., "cluster.local"), adds fully qualified serving names
    pub cluster_domain: Option<String>,
    /// Extra labels for every object created
    pub labels: BTreeMap<String, String>,
}

impl Default for CloneClusterOptions {
    fn default() -> Self {
        Self {
            backup_wait: WaitOptions::default(),
            certificate_wait: WaitOptions::default(),
            issuer_wait: WaitOptions::default(),
            cluster_wait: WaitOptions::default(),
            cleanup_timeout: Duration::ZERO,
            enable_approval_policy: false,
            certificate_duration: Some("24h".to_string()),
            backup_method: BACKUP_METHOD_VOLUME_SNAPSHOT.to_string(),
            instances: 1,
            minimum_storage_size: None,
            cluster_domain: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Every service host name a CNPG cluster named `cluster` can be reached by
pub fn serving_dns_names(cluster: &str, namespace: &str, domain: Option<&str>) -> Vec<String> {
    let mut names = Vec::new();
    for suffix in SERVICE_SUFFIXES {
        let service = format!("{}-{}", cluster, suffix);
        names.push(service.clone());
        names.push(format!("{}.{}", service, namespace));
        names.push(format!("{}.{}.svc", service, namespace));
        if let Some(domain) = domain {
            names.push(format!("{}.{}.svc.{}", service, namespace, domain));
        }
    }
    names
}

/// A cloned cluster and everything created to support it
///
/// Fields are only ever set in creation order. [`ClonedCluster::delete`]
/// removes whatever is set, in reverse.
pub struct ClonedCluster {
    clients: Clients,
    namespace: String,
    name: String,
    source: String,
    backup: Option<Backup>,
    serving_cert: Option<Certificate>,
    client_ca_cert: Option<Certificate>,
    client_ca_issuer: Option<Issuer>,
    postgres_user_cert: Option<ClusterUserCert>,
    streaming_replica_user_cert: Option<ClusterUserCert>,
    cluster: Option<Cluster>,
}

impl std::fmt::Debug for ClonedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonedCluster")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("source", &self.source)
            .field("backup", &self.backup.is_some())
            .field("serving_cert", &self.serving_cert.is_some())
            .field("client_ca_cert", &self.client_ca_cert.is_some())
            .field("client_ca_issuer", &self.client_ca_issuer.is_some())
            .field("postgres_user_cert", &self.postgres_user_cert)
            .field("streaming_replica_user_cert", &self.streaming_replica_user_cert)
            .field("cluster", &self.cluster.is_some())
            .finish()
    }
}

/// Clone `existing_cluster_name` into a new cluster named `new_cluster_name`
///
/// `new_cluster_name` must already carry whatever makes it unique and be at
/// most [`MAX_CLONE_NAME_LENGTH`] long.
#[allow(clippy::too_many_arguments)]
#[instrument(
    skip(clients, cancel, serving_issuer, client_issuer, options),
    fields(serving_issuer = %serving_issuer.name, client_issuer = %client_issuer.name)
)]
pub async fn clone_cluster(
    clients: &Clients,
    cancel: &CancellationToken,
    namespace: &str,
    existing_cluster_name: &str,
    new_cluster_name: &str,
    serving_issuer: &IssuerRef,
    client_issuer: &IssuerRef,
    options: &CloneClusterOptions,
) -> Result<ClonedCluster, Error> {
    if new_cluster_name.len() > MAX_CLONE_NAME_LENGTH {
        return Err(Error::validation(format!(
            "cluster name {} is longer than {} characters",
            new_cluster_name, MAX_CLONE_NAME_LENGTH
        )));
    }

    let mut cloned = ClonedCluster {
        clients: clients.clone(),
        namespace: namespace.to_string(),
        name: new_cluster_name.to_string(),
        source: existing_cluster_name.to_string(),
        backup: None,
        serving_cert: None,
        client_ca_cert: None,
        client_ca_issuer: None,
        postgres_user_cert: None,
        streaming_replica_user_cert: None,
        cluster: None,
    };

    match cloned
        .build(cancel, serving_issuer, client_issuer, options)
        .await
    {
        Ok(()) => {
            info!(namespace = %namespace, cluster = %new_cluster_name, "Cluster clone ready");
            Ok(cloned)
        }
        Err(e) => {
            warn!(
                namespace = %namespace,
                cluster = %new_cluster_name,
                error = %e,
                "Cluster clone failed, rolling back"
            );
            let target = &mut cloned;
            Err(CleanupTask::new(move || async move { target.delete().await })
                .with_message(format!("failed to roll back clone {}", new_cluster_name))
                .with_timeout(options.cleanup_timeout)
                .with_floor(CLONE_CLEANUP_FLOOR)
                .unwind(e)
                .await)
        }
    }
}

impl ClonedCluster {
    async fn build(
        &mut self,
        cancel: &CancellationToken,
        serving_issuer: &IssuerRef,
        client_issuer: &IssuerRef,
        options: &CloneClusterOptions,
    ) -> Result<(), Error> {
        let clients = self.clients.clone();
        let ns = self.namespace.clone();

        // Step 1: source cluster
        check_cancelled(cancel, "reading source cluster")?;
        let source = clients.clusters.get_cluster(&ns, &self.source).await?;
        let storage_size = clone_storage_size(&source, options.minimum_storage_size.as_ref())?;

        // Step 2: backup
        check_cancelled(cancel, "creating backup")?;
        let backup_name = limited_name(&self.name, "backup", MAX_NAME_LENGTH);
        let backup = Backup::of_cluster(
            self.metadata(&backup_name, options),
            &self.source,
            &options.backup_method,
        );
        self.backup = Some(clients.clusters.create_backup(&backup).await?);
        self.backup = Some(
            clients
                .clusters
                .wait_for_ready_backup(cancel, &ns, &backup_name, options.backup_wait)
                .await?,
        );

        // Step 3: serving certificate
        check_cancelled(cancel, "creating serving certificate")?;
        let serving_name = limited_name(&self.name, "serving-cert", MAX_NAME_LENGTH);
        let serving = Certificate::serving(
            self.metadata(&serving_name, options),
            serving_issuer.clone(),
            format!("{}-rw", self.name),
            serving_dns_names(&self.name, &ns, options.cluster_domain.as_deref()),
            options.certificate_duration.clone(),
        );
        self.serving_cert = Some(clients.certificates.create_certificate(&serving).await?);
        self.serving_cert = Some(
            clients
                .certificates
                .wait_for_ready_certificate(cancel, &ns, &serving_name, options.certificate_wait)
                .await?,
        );

        // Step 4: client CA and its issuer
        check_cancelled(cancel, "creating client CA")?;
        let ca_name = limited_name(&self.name, "client-ca", MAX_NAME_LENGTH);
        let ca = Certificate::certificate_authority(
            self.metadata(&ca_name, options),
            client_issuer.clone(),
            format!("{} client CA", self.name),
            options.certificate_duration.clone(),
        );
        self.client_ca_cert = Some(clients.certificates.create_certificate(&ca).await?);
        let ca = clients
            .certificates
            .wait_for_ready_certificate(cancel, &ns, &ca_name, options.certificate_wait)
            .await?;
        let ca_secret = ca.secret_name().to_string();
        self.client_ca_cert = Some(ca);

        check_cancelled(cancel, "creating client CA issuer")?;
        let issuer_name = limited_name(&self.name, "client-ca-issuer", MAX_NAME_LENGTH);
        let issuer = Issuer::ca(self.metadata(&issuer_name, options), &ca_secret);
        self.client_ca_issuer = Some(clients.certificates.create_issuer(&issuer).await?);
        let issuer = clients
            .certificates
            .wait_for_ready_issuer(cancel, &ns, &issuer_name, options.issuer_wait)
            .await?;
        let user_issuer = issuer.to_ref();
        self.client_ca_issuer = Some(issuer);

        // Step 5: client certificates
        let user_options = ClusterUserCertOptions {
            wait: options.certificate_wait,
            cleanup_timeout: options.cleanup_timeout,
            enable_approval_policy: options.enable_approval_policy,
            duration: options.certificate_duration.clone(),
            labels: self.labels(options),
        };
        self.postgres_user_cert = Some(
            ClusterUserCert::provision(
                &clients,
                cancel,
                &ns,
                ROLE_POSTGRES,
                &user_issuer,
                &self.name,
                &user_options,
            )
            .await?,
        );
        let replica = ClusterUserCert::provision(
            &clients,
            cancel,
            &ns,
            ROLE_STREAMING_REPLICA,
            &user_issuer,
            &self.name,
            &user_options,
        )
        .await?;
        let replica_secret = replica
            .secret_name()
            .map(str::to_string)
            .ok_or_else(|| Error::internal("streaming_replica certificate has no secret"))?;
        self.streaming_replica_user_cert = Some(replica);

        // Step 6: the clone
        check_cancelled(cancel, "creating cluster")?;
        let serving_secret = self
            .serving_cert
            .as_ref()
            .map(|c| c.secret_name().to_string())
            .ok_or_else(|| Error::internal("serving certificate missing"))?;
        let spec = ClusterSpec {
            instances: Some(options.instances),
            image_name: source.spec.image_name.clone(),
            storage: Some(StorageConfiguration {
                size: Some(storage_size.as_str().to_string()),
                storage_class: source.storage_class().map(str::to_string),
            }),
            bootstrap: Some(ClusterBootstrap {
                initdb: None,
                recovery: Some(BootstrapRecovery {
                    backup: Some(LocalObjectReference { name: backup_name }),
                    database: Some(source.database_name().to_string()),
                    owner: Some(source.owner_name().to_string()),
                }),
            }),
            certificates: Some(CertificatesConfiguration {
                server_tls_secret: Some(serving_secret.clone()),
                server_ca_secret: Some(serving_secret),
                client_ca_secret: Some(ca_secret),
                replication_tls_secret: Some(replica_secret),
            }),
            postgresql: Some(PostgresConfiguration {
                pg_hba: vec![PG_HBA_CERT_ONLY.to_string()],
            }),
        };
        let cluster = Cluster::new(self.metadata(&self.name, options), spec);
        self.cluster = Some(clients.clusters.create_cluster(&cluster).await?);
        self.cluster = Some(
            clients
                .clusters
                .wait_for_ready_cluster(cancel, &ns, &self.name, options.cluster_wait)
                .await?,
        );

        // The clone no longer needs the backup; a leftover backup fails the clone
        self.delete_backup().await
    }

    fn labels(&self, options: &CloneClusterOptions) -> BTreeMap<String, String> {
        let mut labels = options.labels.clone();
        labels.insert(LABEL_CLONE_OF.to_string(), self.source.clone());
        labels
    }

    fn metadata(&self, name: &str, options: &CloneClusterOptions) -> ObjectMeta {
        let mut meta = ObjectMeta::new(name, &self.namespace);
        meta.labels.extend(self.labels(options));
        meta
    }

    async fn delete_backup(&mut self) -> Result<(), Error> {
        if let Some(name) = self.backup.as_ref().map(|b| b.metadata.name.clone()) {
            self.clients
                .clusters
                .delete_backup(&self.namespace, &name)
                .await?;
            self.backup = None;
        }
        Ok(())
    }

    /// Delete everything that was created, newest first
    ///
    /// Every recorded object gets a deletion attempt regardless of earlier
    /// failures; the returned aggregate holds one entry per failed object.
    /// Deleted objects are forgotten, so a retry only repeats what failed.
    #[instrument(skip(self), fields(namespace = %self.namespace, cluster = %self.name))]
    pub async fn delete(&mut self) -> Result<(), Error> {
        let mut errors = ErrorList::new();
        let ns = self.namespace.clone();
        let clients = self.clients.clone();

        if let Some(name) = self.cluster.as_ref().map(|c| c.metadata.name.clone()) {
            match clients.clusters.delete_cluster(&ns, &name).await {
                Ok(()) => self.cluster = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(cert) = self.streaming_replica_user_cert.as_mut() {
            match cert.delete().await {
                Ok(()) => self.streaming_replica_user_cert = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(cert) = self.postgres_user_cert.as_mut() {
            match cert.delete().await {
                Ok(()) => self.postgres_user_cert = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(name) = self.client_ca_issuer.as_ref().map(|i| i.metadata.name.clone()) {
            match clients.certificates.delete_issuer(&ns, &name).await {
                Ok(()) => self.client_ca_issuer = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(name) = self.client_ca_cert.as_ref().map(|c| c.metadata.name.clone()) {
            match clients.certificates.delete_certificate(&ns, &name).await {
                Ok(()) => self.client_ca_cert = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(name) = self.serving_cert.as_ref().map(|c| c.metadata.name.clone()) {
            match clients.certificates.delete_certificate(&ns, &name).await {
                Ok(()) => self.serving_cert = None,
                Err(e) => errors.push(e),
            }
        }

        errors.record(self.delete_backup().await);

        if errors.is_empty() {
            info!("Cluster clone deleted");
        }
        errors.into_result(format!("failed to delete clone {}", self.name))
    }

    /// Namespace of the clone
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the clone
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the cluster this is a clone of
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The clone, once created
    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    /// The backup, while it still exists
    pub fn backup(&self) -> Option<&Backup> {
        self.backup.as_ref()
    }

    /// The serving certificate
    pub fn serving_cert(&self) -> Option<&Certificate> {
        self.serving_cert.as_ref()
    }

    /// The client CA certificate
    pub fn client_ca_cert(&self) -> Option<&Certificate> {
        self.client_ca_cert.as_ref()
    }

    /// The issuer backed by the client CA
    pub fn client_ca_issuer(&self) -> Option<&Issuer> {
        self.client_ca_issuer.as_ref()
    }

    /// Client certificate for the `postgres` role
    pub fn postgres_user_cert(&self) -> Option<&ClusterUserCert> {
        self.postgres_user_cert.as_ref()
    }

    /// Client certificate for the `streaming_replica` role
    pub fn streaming_replica_user_cert(&self) -> Option<&ClusterUserCert> {
        self.streaming_replica_user_cert.as_ref()
    }

    /// Database name inherited from the source cluster
    pub fn database_name(&self) -> Option<&str> {
        self.cluster.as_ref().map(Cluster::database_name)
    }

    /// Read-write service host of the clone
    pub fn read_write_host(&self) -> String {
        format!("{}-rw.{}.svc", self.name, self.namespace)
    }
}

/// Storage size for the clone: the source's, raised to `minimum` when smaller
fn clone_storage_size(
    source: &Cluster,
    minimum: Option<&StorageSize>,
) -> Result<StorageSize, Error> {
    let raw = source.storage_size().ok_or_else(|| {
        Error::config(
            STORAGE_SIZE_FIELD,
            "",
            format!("cluster {} has no storage size", source.name()),
        )
    })?;
    let size = StorageSize::parse(STORAGE_SIZE_FIELD, raw)?;
    Ok(match minimum {
        Some(minimum) if *minimum > size => minimum.clone(),
        _ => size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::client::{
        MockApprovalPolicyClient, MockCertManagerClient, MockCnpgClient, MockVolumeClient,
    };
    use crate::resources::cnpg::{BackupStatus, BACKUP_PHASE_COMPLETED};

    const CLONE: &str = "pg-clone-1a2b3c4d";
    const BACKUP: &str = "pg-clone-1a2b3c4d-backup";
    const SERVING: &str = "pg-clone-1a2b3c4d-serving-cert";
    const CLIENT_CA: &str = "pg-clone-1a2b3c4d-client-ca";
    const ISSUER: &str = "pg-clone-1a2b3c4d-client-ca-issuer";
    const POSTGRES_USER: &str = "pg-clone-1a2b3c4d-postgres-user";
    const REPLICA_USER: &str = "pg-clone-1a2b3c4d-streaming-replica-user";

    /// Records every control-plane call and fails those matching a prefix
    ///
    /// A call matching an interrupting prefix cancels `cancel` as it runs.
    #[derive(Clone, Default)]
    struct ControlPlaneLog {
        calls: Arc<Mutex<Vec<String>>>,
        failing: Arc<Mutex<Vec<String>>>,
        interrupting: Arc<Mutex<Vec<(String, bool)>>>,
        source_size: Arc<Mutex<Option<String>>>,
        cancel: CancellationToken,
    }

    impl ControlPlaneLog {
        fn new() -> Self {
            let log = Self::default();
            *log.source_size.lock().unwrap() = Some("10Gi".to_string());
            log
        }

        fn fail(&self, prefix: &str) {
            self.failing.lock().unwrap().push(prefix.to_string());
        }

        /// Cancel the token during `prefix`; the call itself then fails
        /// with `Cancelled` when `aborts` is set and succeeds otherwise
        fn interrupt(&self, prefix: &str, aborts: bool) {
            self.interrupting
                .lock()
                .unwrap()
                .push((prefix.to_string(), aborts));
        }

        fn call(&self, entry: String) -> Result<(), Error> {
            self.calls.lock().unwrap().push(entry.clone());
            let interrupted = self
                .interrupting
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| entry.starts_with(p.as_str()))
                .map(|(_, aborts)| *aborts);
            if let Some(aborts) = interrupted {
                self.cancel.cancel();
                if aborts {
                    return Err(Error::cancelled(format!("waiting in {}", entry)));
                }
            }
            if self
                .failing
                .lock()
                .unwrap()
                .iter()
                .any(|p| entry.starts_with(p.as_str()))
            {
                Err(Error::internal(format!("injected failure: {}", entry)))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, entry: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == entry).count()
        }

        fn deletes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with("delete_"))
                .collect()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn source_cluster(&self) -> Cluster {
            let mut spec = ClusterSpec {
                instances: Some(3),
                storage: Some(StorageConfiguration {
                    size: self.source_size.lock().unwrap().clone(),
                    storage_class: Some("fast".to_string()),
                }),
                ..Default::default()
            };
            spec.bootstrap = Some(ClusterBootstrap {
                initdb: Some(crate::resources::cnpg::BootstrapInitDb {
                    database: Some("orders".to_string()),
                    owner: Some("orders_app".to_string()),
                }),
                recovery: None,
            });
            Cluster::new(ObjectMeta::new("pg", "db"), spec)
        }

        fn clients(&self) -> Clients {
            let mut certs = MockCertManagerClient::new();
            let log = self.clone();
            certs.expect_create_certificate().returning(move |c| {
                log.call(format!("create_certificate:{}", c.metadata.name))?;
                Ok(c.clone())
            });
            let log = self.clone();
            certs
                .expect_wait_for_ready_certificate()
                .returning(move |_, ns, name, _| {
                    log.call(format!("wait_certificate:{}", name))?;
                    Ok(Certificate::client(
                        ObjectMeta::new(name, ns),
                        IssuerRef::issuer("any"),
                        "any",
                        None,
                    ))
                });
            let log = self.clone();
            certs.expect_delete_certificate().returning(move |_, name| {
                log.call(format!("delete_certificate:{}", name))
            });
            let log = self.clone();
            certs.expect_create_issuer().returning(move |i| {
                log.call(format!("create_issuer:{}", i.metadata.name))?;
                Ok(i.clone())
            });
            let log = self.clone();
            certs
                .expect_wait_for_ready_issuer()
                .returning(move |_, ns, name, _| {
                    log.call(format!("wait_issuer:{}", name))?;
                    Ok(Issuer::ca(ObjectMeta::new(name, ns), CLIENT_CA))
                });
            let log = self.clone();
            certs
                .expect_delete_issuer()
                .returning(move |_, name| log.call(format!("delete_issuer:{}", name)));

            let mut clusters = MockCnpgClient::new();
            let log = self.clone();
            clusters.expect_get_cluster().returning(move |_, name| {
                log.call(format!("get_cluster:{}", name))?;
                Ok(log.source_cluster())
            });
            let log = self.clone();
            clusters.expect_create_backup().returning(move |b| {
                log.call(format!("create_backup:{}", b.metadata.name))?;
                Ok(b.clone())
            });
            let log = self.clone();
            clusters
                .expect_wait_for_ready_backup()
                .returning(move |_, ns, name, _| {
                    log.call(format!("wait_backup:{}", name))?;
                    let mut backup = Backup::of_cluster(
                        ObjectMeta::new(name, ns),
                        "pg",
                        BACKUP_METHOD_VOLUME_SNAPSHOT,
                    );
                    backup.status = Some(BackupStatus {
                        phase: Some(BACKUP_PHASE_COMPLETED.to_string()),
                        error: None,
                    });
                    Ok(backup)
                });
            let log = self.clone();
            clusters
                .expect_delete_backup()
                .returning(move |_, name| log.call(format!("delete_backup:{}", name)));
            let log = self.clone();
            clusters.expect_create_cluster().returning(move |c| {
                log.call(format!("create_cluster:{}", c.metadata.name))?;
                Ok(c.clone())
            });
            let log = self.clone();
            clusters
                .expect_wait_for_ready_cluster()
                .returning(move |_, ns, name, _| {
                    log.call(format!("wait_cluster:{}", name))?;
                    Ok(Cluster::new(ObjectMeta::new(name, ns), ClusterSpec::default()))
                });
            let log = self.clone();
            clusters
                .expect_delete_cluster()
                .returning(move |_, name| log.call(format!("delete_cluster:{}", name)));

            Clients {
                certificates: Arc::new(certs),
                policies: Arc::new(MockApprovalPolicyClient::new()),
                clusters: Arc::new(clusters),
                volumes: Arc::new(MockVolumeClient::new()),
            }
        }
    }

    async fn run_clone(log: &ControlPlaneLog) -> Result<ClonedCluster, Error> {
        clone_cluster(
            &log.clients(),
            &log.cancel,
            "db",
            "pg",
            CLONE,
            &IssuerRef::issuer("serving-issuer"),
            &IssuerRef::issuer("client-issuer"),
            &CloneClusterOptions::default(),
        )
        .await
    }

    fn entry(op: &str, name: &str) -> String {
        format!("{}:{}", op, name)
    }

    /// Story: a successful clone creates everything in order and removes the
    /// backup once the clone is ready.
    #[tokio::test]
    async fn story_clone_creates_in_order_and_drops_backup() {
        let log = ControlPlaneLog::new();
        let cloned = run_clone(&log).await.expect("clone should succeed");

        assert_eq!(
            log.calls(),
            vec![
                entry("get_cluster", "pg"),
                entry("create_backup", BACKUP),
                entry("wait_backup", BACKUP),
                entry("create_certificate", SERVING),
                entry("wait_certificate", SERVING),
                entry("create_certificate", CLIENT_CA),
                entry("wait_certificate", CLIENT_CA),
                entry("create_issuer", ISSUER),
                entry("wait_issuer", ISSUER),
                entry("create_certificate", POSTGRES_USER),
                entry("wait_certificate", POSTGRES_USER),
                entry("create_certificate", REPLICA_USER),
                entry("wait_certificate", REPLICA_USER),
                entry("create_cluster", CLONE),
                entry("wait_cluster", CLONE),
                entry("delete_backup", BACKUP),
            ]
        );
        assert!(cloned.backup().is_none());
        assert!(cloned.cluster().is_some());
        assert_eq!(cloned.read_write_host(), "pg-clone-1a2b3c4d-rw.db.svc");
        assert_eq!(
            cloned
                .postgres_user_cert()
                .and_then(ClusterUserCert::secret_name),
            Some(POSTGRES_USER)
        );
    }

    /// Story: a failure at any step deletes each earlier object exactly once,
    /// newest first, and returns no clone.
    #[tokio::test]
    async fn story_failure_at_each_step_rolls_back_what_exists() {
        let cases: Vec<(String, Vec<String>)> = vec![
            (entry("get_cluster", "pg"), vec![]),
            (entry("create_backup", BACKUP), vec![]),
            (
                entry("wait_backup", BACKUP),
                vec![entry("delete_backup", BACKUP)],
            ),
            (
                entry("create_certificate", SERVING),
                vec![entry("delete_backup", BACKUP)],
            ),
            (
                entry("wait_certificate", SERVING),
                vec![
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("create_certificate", CLIENT_CA),
                vec![
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("wait_certificate", CLIENT_CA),
                vec![
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("create_issuer", ISSUER),
                vec![
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("wait_issuer", ISSUER),
                vec![
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("create_certificate", POSTGRES_USER),
                vec![
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("wait_certificate", POSTGRES_USER),
                vec![
                    entry("delete_certificate", POSTGRES_USER),
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("create_certificate", REPLICA_USER),
                vec![
                    entry("delete_certificate", POSTGRES_USER),
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("wait_certificate", REPLICA_USER),
                vec![
                    entry("delete_certificate", REPLICA_USER),
                    entry("delete_certificate", POSTGRES_USER),
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("create_cluster", CLONE),
                vec![
                    entry("delete_certificate", REPLICA_USER),
                    entry("delete_certificate", POSTGRES_USER),
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
            (
                entry("wait_cluster", CLONE),
                vec![
                    entry("delete_cluster", CLONE),
                    entry("delete_certificate", REPLICA_USER),
                    entry("delete_certificate", POSTGRES_USER),
                    entry("delete_issuer", ISSUER),
                    entry("delete_certificate", CLIENT_CA),
                    entry("delete_certificate", SERVING),
                    entry("delete_backup", BACKUP),
                ],
            ),
        ];

        for (failing, expected_deletes) in cases {
            let log = ControlPlaneLog::new();
            log.fail(&failing);

            let err = run_clone(&log)
                .await
                .expect_err(&format!("clone should fail at {}", failing));
            assert!(
                err.to_string().contains(&failing),
                "error for {} should carry the original failure: {}",
                failing,
                err
            );
            assert_eq!(
                log.deletes(),
                expected_deletes,
                "unexpected rollback after failing {}",
                failing
            );
            for delete in &expected_deletes {
                assert_eq!(log.count(delete), 1, "{} after failing {}", delete, failing);
            }
        }
    }

    /// Story: cancelling while the clone itself is being awaited still tears
    /// down every recorded object, newest first, and reports the cancellation.
    #[tokio::test]
    async fn story_cancel_during_cluster_wait_still_rolls_back_everything() {
        let log = ControlPlaneLog::new();
        log.interrupt(&entry("wait_cluster", CLONE), true);

        let err = run_clone(&log)
            .await
            .expect_err("cancelled clone should fail");

        assert!(log.cancel.is_cancelled());
        assert!(matches!(err, Error::Cancelled { .. }), "got {:?}", err);
        assert_eq!(
            log.deletes(),
            vec![
                entry("delete_cluster", CLONE),
                entry("delete_certificate", REPLICA_USER),
                entry("delete_certificate", POSTGRES_USER),
                entry("delete_issuer", ISSUER),
                entry("delete_certificate", CLIENT_CA),
                entry("delete_certificate", SERVING),
                entry("delete_backup", BACKUP),
            ]
        );
    }

    /// Story: cancellation that lands between steps stops before the next
    /// mutation and removes what the earlier steps created.
    #[tokio::test]
    async fn story_cancel_between_steps_creates_nothing_further() {
        let log = ControlPlaneLog::new();
        log.interrupt(&entry("wait_certificate", SERVING), false);

        let err = run_clone(&log)
            .await
            .expect_err("cancelled clone should fail");

        assert!(matches!(err, Error::Cancelled { .. }), "got {:?}", err);
        assert_eq!(log.count(&entry("create_certificate", CLIENT_CA)), 0);
        assert_eq!(
            log.deletes(),
            vec![
                entry("delete_certificate", SERVING),
                entry("delete_backup", BACKUP),
            ]
        );
    }

    /// Story: failing to delete the backup after an otherwise successful
    /// clone rolls the whole clone back, retrying the backup last.
    #[tokio::test]
    async fn story_backup_deletion_failure_rolls_back_clone() {
        let log = ControlPlaneLog::new();
        log.fail(&entry("delete_backup", BACKUP));

        let err = run_clone(&log)
            .await
            .expect_err("leftover backup should fail the clone");

        assert_eq!(
            log.deletes(),
            vec![
                entry("delete_backup", BACKUP),
                entry("delete_cluster", CLONE),
                entry("delete_certificate", REPLICA_USER),
                entry("delete_certificate", POSTGRES_USER),
                entry("delete_issuer", ISSUER),
                entry("delete_certificate", CLIENT_CA),
                entry("delete_certificate", SERVING),
                entry("delete_backup", BACKUP),
            ]
        );
        // The rollback could not delete the backup either
        assert!(matches!(err, Error::Cleanup { .. }));
        assert_eq!(err.sub_errors().map(ErrorList::len), Some(2));
    }

    /// Story: when every delete fails, each object's failure is reported
    /// separately.
    #[tokio::test]
    async fn story_all_deletes_failing_reports_six_errors() {
        let log = ControlPlaneLog::new();
        let mut cloned = run_clone(&log).await.expect("clone should succeed");
        log.clear();
        log.fail("delete_");

        let err = cloned.delete().await.expect_err("every delete fails");

        assert_eq!(err.sub_errors().map(ErrorList::len), Some(6));
        assert_eq!(log.deletes().len(), 6);
        assert!(cloned.cluster().is_some());
    }

    #[tokio::test]
    async fn test_delete_of_partial_clone_only_touches_what_exists() {
        let log = ControlPlaneLog::new();
        let mut cloned = ClonedCluster {
            clients: log.clients(),
            namespace: "db".to_string(),
            name: CLONE.to_string(),
            source: "pg".to_string(),
            backup: Some(Backup::of_cluster(
                ObjectMeta::new(BACKUP, "db"),
                "pg",
                BACKUP_METHOD_VOLUME_SNAPSHOT,
            )),
            serving_cert: Some(Certificate::client(
                ObjectMeta::new(SERVING, "db"),
                IssuerRef::issuer("serving-issuer"),
                "x",
                None,
            )),
            client_ca_cert: None,
            client_ca_issuer: None,
            postgres_user_cert: None,
            streaming_replica_user_cert: None,
            cluster: None,
        };

        cloned.delete().await.expect("partial delete should succeed");
        assert_eq!(
            log.deletes(),
            vec![
                entry("delete_certificate", SERVING),
                entry("delete_backup", BACKUP)
            ]
        );

        log.clear();
        cloned.delete().await.expect("second delete is a no-op");
        assert!(log.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_source_size_is_fatal_and_creates_nothing() {
        let log = ControlPlaneLog::new();
        *log.source_size.lock().unwrap() = Some("lots".to_string());

        let err = run_clone(&log).await.expect_err("bad size should fail");
        assert!(!err.is_retryable());

        match err {
            Error::Config { field, value, .. } => {
                assert_eq!(field, STORAGE_SIZE_FIELD);
                assert_eq!(value, "lots");
            }
            other => panic!("expected config error, got {:?}", other),
        }
        assert_eq!(log.calls(), vec![entry("get_cluster", "pg")]);
    }

    #[tokio::test]
    async fn test_clone_name_over_limit_is_rejected() {
        let log = ControlPlaneLog::new();
        let long = "c".repeat(MAX_CLONE_NAME_LENGTH + 1);
        let err = clone_cluster(
            &log.clients(),
            &CancellationToken::new(),
            "db",
            "pg",
            &long,
            &IssuerRef::issuer("serving-issuer"),
            &IssuerRef::issuer("client-issuer"),
            &CloneClusterOptions::default(),
        )
        .await
        .expect_err("name too long");
        assert!(matches!(err, Error::Validation { .. }));
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_serving_dns_names() {
        let names = serving_dns_names("pg-clone", "db", None);
        assert_eq!(names.len(), 9);
        assert!(names.contains(&"pg-clone-rw".to_string()));
        assert!(names.contains(&"pg-clone-ro.db".to_string()));
        assert!(names.contains(&"pg-clone-r.db.svc".to_string()));

        let names = serving_dns_names("pg-clone", "db", Some("cluster.local"));
        assert_eq!(names.len(), 12);
        assert!(names.contains(&"pg-clone-rw.db.svc.cluster.local".to_string()));
    }

    #[test]
    fn test_clone_storage_size_respects_minimum() {
        let log = ControlPlaneLog::new();
        let source = log.source_cluster();

        let size = clone_storage_size(&source, None).expect("size parses");
        assert_eq!(size.as_str(), "10Gi");

        let minimum = StorageSize::parse("minimum", "50Gi").expect("minimum parses");
        let size = clone_storage_size(&source, Some(&minimum)).expect("size parses");
        assert_eq!(size.as_str(), "50Gi");

        let minimum = StorageSize::parse("minimum", "1Gi").expect("minimum parses");
        let size = clone_storage_size(&source, Some(&minimum)).expect("size parses");
        assert_eq!(size.as_str(), "10Gi");
    }

    #[test]
    fn test_missing_source_size_is_config_error() {
        let log = ControlPlaneLog::new();
        *log.source_size.lock().unwrap() = None;
        let err = clone_storage_size(&log.source_cluster(), None).expect_err("no size");
        assert!(matches!(err, Error::Config { .. }));
    }
}
