//! Disposable CloudNativePG cluster clones
//!
//! - **resources**: typed cert-manager, approver-policy and CNPG resources
//! - **client**: control-plane traits and their kube-rs implementation
//! - **user_cert**: client certificates for a single database role
//! - **clone**: the clone orchestrator and its rollback

#![warn(missing_docs)]

pub mod client;
pub mod clone;
pub mod resources;
pub mod user_cert;

pub use client::{
    ApprovalPolicyClient, CertManagerClient, Clients, CnpgClient, KubeControlPlane, VolumeClient,
};
pub use clone::{
    clone_cluster, serving_dns_names, CloneClusterOptions, ClonedCluster, MAX_CLONE_NAME_LENGTH,
};
pub use user_cert::{ClusterUserCert, ClusterUserCertOptions};

#[cfg(any(test, feature = "testing"))]
pub use client::{
    MockApprovalPolicyClient, MockCertManagerClient, MockCnpgClient, MockVolumeClient,
};
