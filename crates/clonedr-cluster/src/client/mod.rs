//! Control-plane client traits
//!
//! The orchestrators only talk to the control plane through these traits so
//! tests can substitute mocks. [`KubeControlPlane`] implements all of them
//! against a live API server.

mod control_plane;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tokio_util::sync::CancellationToken;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use clonedr_common::{Error, WaitOptions};

use crate::resources::{Backup, Certificate, CertificateRequestPolicy, Cluster, Issuer};

pub use control_plane::KubeControlPlane;

/// cert-manager Certificate and Issuer operations
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CertManagerClient: Send + Sync {
    /// Create a certificate, returning the stored object
    async fn create_certificate(&self, certificate: &Certificate) -> Result<Certificate, Error>;

    /// Fetch a certificate
    async fn get_certificate(&self, namespace: &str, name: &str) -> Result<Certificate, Error>;

    /// Wait until a certificate is ready or its issuance failed
    async fn wait_for_ready_certificate(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Certificate, Error>;

    /// Ask cert-manager to issue the certificate again
    async fn reissue_certificate(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a certificate; a missing certificate is not an error
    async fn delete_certificate(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create an issuer, returning the stored object
    async fn create_issuer(&self, issuer: &Issuer) -> Result<Issuer, Error>;

    /// Fetch an issuer
    async fn get_issuer(&self, namespace: &str, name: &str) -> Result<Issuer, Error>;

    /// Wait until an issuer is ready
    async fn wait_for_ready_issuer(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Issuer, Error>;

    /// Delete an issuer; a missing issuer is not an error
    async fn delete_issuer(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// approver-policy operations
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ApprovalPolicyClient: Send + Sync {
    /// Create a policy that approves requests for exactly `certificate`
    async fn create_policy_for_certificate(
        &self,
        policy_name: &str,
        certificate: &Certificate,
    ) -> Result<CertificateRequestPolicy, Error>;

    /// Delete a policy; a missing policy is not an error
    async fn delete_policy(&self, name: &str) -> Result<(), Error>;
}

/// CloudNativePG Backup and Cluster operations
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CnpgClient: Send + Sync {
    /// Create a backup, returning the stored object
    async fn create_backup(&self, backup: &Backup) -> Result<Backup, Error>;

    /// Wait until a backup completed or failed
    async fn wait_for_ready_backup(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Backup, Error>;

    /// Delete a backup; a missing backup is not an error
    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a cluster, returning the stored object
    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Wait until every instance of a cluster is ready
    async fn wait_for_ready_cluster(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Cluster, Error>;

    /// Fetch a cluster
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Cluster, Error>;

    /// Delete a cluster; a missing cluster is not an error
    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Persistent volume operations
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Fetch a persistent volume claim
    async fn get_volume(&self, namespace: &str, name: &str)
        -> Result<PersistentVolumeClaim, Error>;
}

/// Every collaborator the orchestrators need, injected together
#[derive(Clone)]
pub struct Clients {
    /// Certificates and issuers
    pub certificates: Arc<dyn CertManagerClient>,
    /// Approval policies
    pub policies: Arc<dyn ApprovalPolicyClient>,
    /// Backups and clusters
    pub clusters: Arc<dyn CnpgClient>,
    /// Persistent volumes
    pub volumes: Arc<dyn VolumeClient>,
}

impl Clients {
    /// All collaborators backed by one kube client
    pub fn from_kube(client: kube::Client) -> Self {
        let control_plane = Arc::new(KubeControlPlane::new(client));
        Self {
            certificates: control_plane.clone(),
            policies: control_plane.clone(),
            clusters: control_plane.clone(),
            volumes: control_plane,
        }
    }
}

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clients").finish_non_exhaustive()
    }
}
