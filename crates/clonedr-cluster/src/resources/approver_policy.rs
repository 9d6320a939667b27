//! approver-policy CertificateRequestPolicy
//!
//! A policy that approves requests for exactly one certificate: the common
//! name, usages and issuer must match, and only requests from the
//! certificate's namespace are selected.

use serde::{Deserialize, Serialize};

use clonedr_common::kube_utils::{HasApiResource, ObjectMeta};

use super::cert_manager::{Certificate, IssuerRef};

/// approver-policy CertificateRequestPolicy (cluster-scoped)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestPolicy {
    /// API version (policy.cert-manager.io/v1alpha1)
    #[serde(default = "CertificateRequestPolicy::default_api_version")]
    pub api_version: String,
    /// Resource kind (CertificateRequestPolicy)
    #[serde(default = "CertificateRequestPolicy::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Policy specification
    pub spec: CertificateRequestPolicySpec,
}

impl HasApiResource for CertificateRequestPolicy {
    const API_VERSION: &'static str = "policy.cert-manager.io/v1alpha1";
    const KIND: &'static str = "CertificateRequestPolicy";
}

impl_api_defaults!(CertificateRequestPolicy);

impl CertificateRequestPolicy {
    /// Create a new policy
    pub fn new(metadata: ObjectMeta, spec: CertificateRequestPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }

    /// A policy allowing only requests that match `cert`
    pub fn for_certificate(name: impl Into<String>, cert: &Certificate) -> Self {
        let mut metadata = ObjectMeta::cluster_scoped(name);
        for (key, value) in &cert.metadata.labels {
            metadata.labels.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let spec = CertificateRequestPolicySpec {
            allowed: AllowedAttributes {
                common_name: cert.spec.common_name.as_ref().map(|cn| AllowedString {
                    value: Some(cn.clone()),
                    required: Some(true),
                }),
                dns_names: (!cert.spec.dns_names.is_empty()).then(|| AllowedStringSlice {
                    values: cert.spec.dns_names.clone(),
                    required: Some(true),
                }),
                usages: cert.spec.usages.clone(),
                is_ca: Some(cert.spec.is_ca.unwrap_or(false)),
            },
            selector: PolicySelector {
                issuer_ref: Some(cert.spec.issuer_ref.clone()),
                namespace: cert.metadata.namespace.as_ref().map(|ns| NamespaceSelector {
                    match_names: vec![ns.clone()],
                }),
            },
        };

        Self::new(metadata, spec)
    }
}

/// CertificateRequestPolicy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestPolicySpec {
    /// Attributes a request may carry
    pub allowed: AllowedAttributes,
    /// Which requests this policy evaluates
    pub selector: PolicySelector,
}

/// Attributes a request is allowed to carry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedAttributes {
    /// Allowed common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<AllowedString>,
    /// Allowed DNS names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_names: Option<AllowedStringSlice>,
    /// Allowed key usages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
    /// Whether a CA may be requested
    #[serde(default, rename = "isCA", skip_serializing_if = "Option::is_none")]
    pub is_ca: Option<bool>,
}

/// A single allowed string value
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedString {
    /// Value (wildcards are interpreted by approver-policy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Whether the request must carry the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// A set of allowed string values
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedStringSlice {
    /// Values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    /// Whether the request must carry the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// Request selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelector {
    /// Issuer the request must target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_ref: Option<IssuerRef>,
    /// Namespaces the request must come from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceSelector>,
}

/// Namespace selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Namespace names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
}
