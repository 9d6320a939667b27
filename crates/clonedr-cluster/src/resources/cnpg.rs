//! CloudNativePG Backup and Cluster resources

use serde::{Deserialize, Serialize};

use clonedr_common::kube_utils::{
    has_condition, Condition, HasApiResource, ObjectMeta, CONDITION_READY,
};
use clonedr_common::Readiness;

/// Backup phase once the backup finished
pub const BACKUP_PHASE_COMPLETED: &str = "completed";
/// Backup phase when the backup failed
pub const BACKUP_PHASE_FAILED: &str = "failed";

/// Cluster phase string CNPG reports when every instance is healthy
pub const CLUSTER_PHASE_HEALTHY: &str = "Cluster in healthy state";

/// Default database and owner CNPG creates with `initdb`
pub const DEFAULT_APPLICATION_DATABASE: &str = "app";

/// Backup method using CSI volume snapshots
pub const BACKUP_METHOD_VOLUME_SNAPSHOT: &str = "volumeSnapshot";
/// Backup method using the barman object store
pub const BACKUP_METHOD_BARMAN: &str = "barmanObjectStore";

/// Superuser role
pub const ROLE_POSTGRES: &str = "postgres";
/// Role replicas authenticate as
pub const ROLE_STREAMING_REPLICA: &str = "streaming_replica";

/// Port every CNPG instance listens on
pub const POSTGRES_PORT: u16 = 5432;

/// Service suffixes CNPG creates for each cluster
pub const SERVICE_SUFFIXES: [&str; 3] = ["rw", "r", "ro"];

// =============================================================================
// Backup
// =============================================================================

/// CloudNativePG Backup resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// API version (postgresql.cnpg.io/v1)
    #[serde(default = "Backup::default_api_version")]
    pub api_version: String,
    /// Resource kind (Backup)
    #[serde(default = "Backup::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Backup specification
    pub spec: BackupSpec,
    /// Status reported by CNPG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStatus>,
}

impl HasApiResource for Backup {
    const API_VERSION: &'static str = "postgresql.cnpg.io/v1";
    const KIND: &'static str = "Backup";
}

impl_api_defaults!(Backup);

impl Backup {
    /// An online backup of `cluster` using `method`
    pub fn of_cluster(
        metadata: ObjectMeta,
        cluster: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec: BackupSpec {
                cluster: LocalObjectReference { name: cluster.into() },
                method: Some(method.into()),
                online: Some(true),
            },
            status: None,
        }
    }

    /// Phase reported by CNPG, if any
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }
}

/// Backup spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Cluster to back up
    pub cluster: LocalObjectReference,
    /// Backup method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Whether to back up without stopping the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

/// Backup status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Backup phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Error reported on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness of a Backup
pub fn backup_readiness(backup: &Backup) -> Readiness {
    match backup.phase() {
        Some(BACKUP_PHASE_COMPLETED) => Readiness::Ready,
        Some(BACKUP_PHASE_FAILED) => Readiness::Failed(
            backup
                .status
                .as_ref()
                .and_then(|s| s.error.clone())
                .unwrap_or_else(|| "backup failed".to_string()),
        ),
        _ => Readiness::Pending,
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// CloudNativePG Cluster resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// API version (postgresql.cnpg.io/v1)
    #[serde(default = "Cluster::default_api_version")]
    pub api_version: String,
    /// Resource kind (Cluster)
    #[serde(default = "Cluster::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Cluster specification
    pub spec: ClusterSpec,
    /// Status reported by CNPG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

impl HasApiResource for Cluster {
    const API_VERSION: &'static str = "postgresql.cnpg.io/v1";
    const KIND: &'static str = "Cluster";
}

impl_api_defaults!(Cluster);

impl Cluster {
    /// Create a new Cluster
    pub fn new(metadata: ObjectMeta, spec: ClusterSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
            status: None,
        }
    }

    /// Name of the cluster
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Application database created at bootstrap
    pub fn database_name(&self) -> &str {
        self.spec
            .bootstrap
            .as_ref()
            .and_then(ClusterBootstrap::database)
            .unwrap_or(DEFAULT_APPLICATION_DATABASE)
    }

    /// Owner of the application database
    pub fn owner_name(&self) -> &str {
        self.spec
            .bootstrap
            .as_ref()
            .and_then(ClusterBootstrap::owner)
            .unwrap_or(DEFAULT_APPLICATION_DATABASE)
    }

    /// Raw storage size from the spec
    pub fn storage_size(&self) -> Option<&str> {
        self.spec.storage.as_ref().and_then(|s| s.size.as_deref())
    }

    /// Storage class from the spec
    pub fn storage_class(&self) -> Option<&str> {
        self.spec
            .storage
            .as_ref()
            .and_then(|s| s.storage_class.as_deref())
    }

    /// Secret holding the CA that signed the server certificate
    ///
    /// Prefers what CNPG reports, then the spec, then CNPG's generated default.
    pub fn server_ca_secret(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.certificates.as_ref())
            .and_then(|c| c.server_ca_secret.clone())
            .or_else(|| {
                self.spec
                    .certificates
                    .as_ref()
                    .and_then(|c| c.server_ca_secret.clone())
            })
            .unwrap_or_else(|| format!("{}-ca", self.metadata.name))
    }

    /// Read-write service host inside the cluster network
    pub fn read_write_host(&self) -> String {
        format!(
            "{}-rw.{}.svc",
            self.metadata.name,
            self.metadata.namespace_or_empty()
        )
    }

    /// Status conditions, empty if none reported yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Cluster spec (only the fields clonedr reads or writes)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i32>,
    /// Postgres image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// Data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfiguration>,
    /// How the cluster is initialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<ClusterBootstrap>,
    /// TLS material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesConfiguration>,
    /// Postgres configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<PostgresConfiguration>,
}

/// Storage configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfiguration {
    /// Volume size (Kubernetes quantity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Bootstrap configuration; exactly one method is set
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBootstrap {
    /// Fresh initialization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initdb: Option<BootstrapInitDb>,
    /// Recovery from a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<BootstrapRecovery>,
}

impl ClusterBootstrap {
    fn database(&self) -> Option<&str> {
        self.initdb
            .as_ref()
            .and_then(|i| i.database.as_deref())
            .or_else(|| self.recovery.as_ref().and_then(|r| r.database.as_deref()))
    }

    fn owner(&self) -> Option<&str> {
        self.initdb
            .as_ref()
            .and_then(|i| i.owner.as_deref())
            .or_else(|| self.recovery.as_ref().and_then(|r| r.owner.as_deref()))
    }
}

/// `initdb` bootstrap
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapInitDb {
    /// Application database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Owner of the application database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// `recovery` bootstrap
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRecovery {
    /// Backup to recover from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<LocalObjectReference>,
    /// Application database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Owner of the application database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// User-provided TLS secrets
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesConfiguration {
    /// Server key pair
    #[serde(rename = "serverTLSSecret", default, skip_serializing_if = "Option::is_none")]
    pub server_tls_secret: Option<String>,
    /// CA that signed the server certificate
    #[serde(rename = "serverCASecret", default, skip_serializing_if = "Option::is_none")]
    pub server_ca_secret: Option<String>,
    /// CA that client certificates must chain to
    #[serde(rename = "clientCASecret", default, skip_serializing_if = "Option::is_none")]
    pub client_ca_secret: Option<String>,
    /// Key pair of the streaming_replica user
    #[serde(
        rename = "replicationTLSSecret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub replication_tls_secret: Option<String>,
}

/// Postgres configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PostgresConfiguration {
    /// Extra pg_hba.conf lines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pg_hba: Vec<String>,
}

/// Cluster status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Human-readable phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Instances that exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i32>,
    /// Instances that are ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_instances: Option<i32>,
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// TLS secrets in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesConfiguration>,
}

/// Readiness of a Cluster; CNPG keeps retrying, so never a terminal failure
pub fn cluster_readiness(cluster: &Cluster) -> Readiness {
    if has_condition(cluster.conditions(), CONDITION_READY) {
        return Readiness::Ready;
    }
    let Some(status) = cluster.status.as_ref() else {
        return Readiness::Pending;
    };
    let desired = cluster.spec.instances.unwrap_or(1);
    let healthy = status.phase.as_deref() == Some(CLUSTER_PHASE_HEALTHY);
    if healthy && status.ready_instances == Some(desired) {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonedr_common::kube_utils::STATUS_TRUE;

    fn source_cluster() -> Cluster {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "postgresql.cnpg.io/v1",
            "kind": "Cluster",
            "metadata": {"name": "pg", "namespace": "db"},
            "spec": {
                "instances": 3,
                "storage": {"size": "20Gi", "storageClass": "fast"},
                "bootstrap": {"initdb": {"database": "orders", "owner": "orders_app"}}
            },
            "status": {
                "phase": "Cluster in healthy state",
                "instances": 3,
                "readyInstances": 3,
                "certificates": {"serverCASecret": "pg-server-ca"}
            }
        }))
        .expect("cluster deserializes")
    }

    #[test]
    fn test_cluster_accessors() {
        let cluster = source_cluster();
        assert_eq!(cluster.database_name(), "orders");
        assert_eq!(cluster.owner_name(), "orders_app");
        assert_eq!(cluster.storage_size(), Some("20Gi"));
        assert_eq!(cluster.storage_class(), Some("fast"));
        assert_eq!(cluster.server_ca_secret(), "pg-server-ca");
        assert_eq!(cluster.read_write_host(), "pg-rw.db.svc");
    }

    #[test]
    fn test_cluster_defaults_without_bootstrap() {
        let cluster = Cluster::new(ObjectMeta::new("bare", "db"), ClusterSpec::default());
        assert_eq!(cluster.database_name(), DEFAULT_APPLICATION_DATABASE);
        assert_eq!(cluster.owner_name(), DEFAULT_APPLICATION_DATABASE);
        assert_eq!(cluster.server_ca_secret(), "bare-ca");
        assert_eq!(cluster.storage_size(), None);
    }

    #[test]
    fn test_cluster_readiness() {
        let mut cluster = source_cluster();
        assert_eq!(cluster_readiness(&cluster), Readiness::Ready);

        if let Some(status) = cluster.status.as_mut() {
            status.ready_instances = Some(2);
        }
        assert_eq!(cluster_readiness(&cluster), Readiness::Pending);

        if let Some(status) = cluster.status.as_mut() {
            status.conditions.push(Condition {
                type_: CONDITION_READY.to_string(),
                status: STATUS_TRUE.to_string(),
                ..Default::default()
            });
        }
        assert_eq!(cluster_readiness(&cluster), Readiness::Ready);

        cluster.status = None;
        assert_eq!(cluster_readiness(&cluster), Readiness::Pending);
    }

    #[test]
    fn test_backup_readiness() {
        let mut backup = Backup::of_cluster(
            ObjectMeta::new("pg-1a2b3c4d-backup", "db"),
            "pg",
            BACKUP_METHOD_VOLUME_SNAPSHOT,
        );
        assert_eq!(backup_readiness(&backup), Readiness::Pending);

        backup.status = Some(BackupStatus {
            phase: Some("running".to_string()),
            error: None,
        });
        assert_eq!(backup_readiness(&backup), Readiness::Pending);

        backup.status = Some(BackupStatus {
            phase: Some(BACKUP_PHASE_COMPLETED.to_string()),
            error: None,
        });
        assert_eq!(backup_readiness(&backup), Readiness::Ready);

        backup.status = Some(BackupStatus {
            phase: Some(BACKUP_PHASE_FAILED.to_string()),
            error: Some("snapshot class missing".to_string()),
        });
        assert_eq!(
            backup_readiness(&backup),
            Readiness::Failed("snapshot class missing".to_string())
        );
    }

    #[test]
    fn test_certificates_serialize_with_cnpg_field_names() {
        let certs = CertificatesConfiguration {
            server_tls_secret: Some("a".to_string()),
            server_ca_secret: Some("b".to_string()),
            client_ca_secret: Some("c".to_string()),
            replication_tls_secret: Some("d".to_string()),
        };
        let json = serde_json::to_value(&certs).expect("certificates serialize");
        assert_eq!(json["serverTLSSecret"], "a");
        assert_eq!(json["serverCASecret"], "b");
        assert_eq!(json["clientCASecret"], "c");
        assert_eq!(json["replicationTLSSecret"], "d");
    }
}
