//! Typed control-plane resources
//!
//! - **cert_manager**: cert-manager `Certificate` and `Issuer`
//! - **approver_policy**: approver-policy `CertificateRequestPolicy`
//! - **cnpg**: CloudNativePG `Backup` and `Cluster`
//!
//! All resource types implement `HasApiResource` for consistent API version
//! handling and carry only the fields clonedr reads or writes.

/// Implement default_api_version() and default_kind() for types implementing
/// HasApiResource, for use as serde defaults.
macro_rules! impl_api_defaults {
    ($type:ty) => {
        impl $type {
            fn default_api_version() -> String {
                <Self as clonedr_common::kube_utils::HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as clonedr_common::kube_utils::HasApiResource>::KIND.to_string()
            }
        }
    };
}

pub mod approver_policy;
pub mod cert_manager;
pub mod cnpg;

pub use approver_policy::CertificateRequestPolicy;
pub use cert_manager::{Certificate, Issuer, IssuerRef};
pub use cnpg::{Backup, Cluster};
