//! cert-manager Certificate and Issuer resources

use serde::{Deserialize, Serialize};

use clonedr_common::kube_utils::{
    describe_condition, find_condition, has_condition, Condition, HasApiResource, ObjectMeta,
    CONDITION_READY, STATUS_FALSE,
};
use clonedr_common::Readiness;

/// cert-manager API group
pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";

/// Condition cert-manager sets while (re)issuing a certificate
pub const CONDITION_ISSUING: &str = "Issuing";

/// Reason cert-manager uses for a failed issuance
pub const REASON_FAILED: &str = "Failed";

/// Reason recorded when clonedr forces re-issuance
pub const REASON_MANUALLY_TRIGGERED: &str = "ManuallyTriggered";

/// Key usage for TLS servers
pub const USAGE_SERVER_AUTH: &str = "server auth";
/// Key usage for TLS clients
pub const USAGE_CLIENT_AUTH: &str = "client auth";
/// Key usage for signing certificates
pub const USAGE_CERT_SIGN: &str = "cert sign";
/// Key usage for signing revocation lists
pub const USAGE_CRL_SIGN: &str = "crl sign";
/// Key usage for digital signatures
pub const USAGE_DIGITAL_SIGNATURE: &str = "digital signature";

/// Secret key holding the certificate
pub const SECRET_KEY_CERT: &str = "tls.crt";
/// Secret key holding the private key
pub const SECRET_KEY_PRIVATE_KEY: &str = "tls.key";
/// Secret key holding the issuing CA certificate
pub const SECRET_KEY_CA: &str = "ca.crt";

// =============================================================================
// IssuerRef
// =============================================================================

/// Reference to the issuer that signs a certificate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// "Issuer" or "ClusterIssuer"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// API group of the issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl IssuerRef {
    /// Reference a namespaced cert-manager Issuer
    pub fn issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Some(Issuer::KIND.to_string()),
            group: Some(CERT_MANAGER_GROUP.to_string()),
        }
    }

    /// Reference a cert-manager ClusterIssuer
    pub fn cluster_issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Some("ClusterIssuer".to_string()),
            group: Some(CERT_MANAGER_GROUP.to_string()),
        }
    }

    /// Kind, defaulting to "Issuer" as cert-manager does
    pub fn kind_or_default(&self) -> &str {
        self.kind.as_deref().unwrap_or(Issuer::KIND)
    }

    /// Whether this references a namespaced Issuer
    pub fn is_namespaced(&self) -> bool {
        self.kind_or_default() == Issuer::KIND
    }
}

// =============================================================================
// Certificate
// =============================================================================

/// cert-manager Certificate resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// API version (cert-manager.io/v1)
    #[serde(default = "Certificate::default_api_version")]
    pub api_version: String,
    /// Resource kind (Certificate)
    #[serde(default = "Certificate::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Certificate specification
    pub spec: CertificateSpec,
    /// Status reported by cert-manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CertificateStatus>,
}

impl HasApiResource for Certificate {
    const API_VERSION: &'static str = "cert-manager.io/v1";
    const KIND: &'static str = "Certificate";
}

impl_api_defaults!(Certificate);

impl Certificate {
    /// Create a new Certificate
    pub fn new(metadata: ObjectMeta, spec: CertificateSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
            status: None,
        }
    }

    /// A server certificate valid for the given DNS names
    pub fn serving(
        metadata: ObjectMeta,
        issuer_ref: IssuerRef,
        common_name: impl Into<String>,
        dns_names: Vec<String>,
        duration: Option<String>,
    ) -> Self {
        let secret_name = metadata.name.clone();
        Self::new(
            metadata,
            CertificateSpec {
                secret_name,
                common_name: Some(common_name.into()),
                dns_names,
                duration,
                usages: vec![
                    USAGE_SERVER_AUTH.to_string(),
                    USAGE_DIGITAL_SIGNATURE.to_string(),
                ],
                private_key: Some(CertificatePrivateKey::default()),
                issuer_ref,
                ..Default::default()
            },
        )
    }

    /// A certificate authority with empty excluded name constraints
    pub fn certificate_authority(
        metadata: ObjectMeta,
        issuer_ref: IssuerRef,
        common_name: impl Into<String>,
        duration: Option<String>,
    ) -> Self {
        let secret_name = metadata.name.clone();
        Self::new(
            metadata,
            CertificateSpec {
                secret_name,
                common_name: Some(common_name.into()),
                duration,
                is_ca: Some(true),
                usages: vec![USAGE_CERT_SIGN.to_string(), USAGE_CRL_SIGN.to_string()],
                private_key: Some(CertificatePrivateKey::default()),
                issuer_ref,
                name_constraints: Some(NameConstraints {
                    critical: Some(true),
                    permitted: None,
                    excluded: Some(NameConstraintItem::default()),
                }),
                ..Default::default()
            },
        )
    }

    /// A client certificate authenticating `common_name`
    pub fn client(
        metadata: ObjectMeta,
        issuer_ref: IssuerRef,
        common_name: impl Into<String>,
        duration: Option<String>,
    ) -> Self {
        let secret_name = metadata.name.clone();
        Self::new(
            metadata,
            CertificateSpec {
                secret_name,
                common_name: Some(common_name.into()),
                duration,
                usages: vec![USAGE_CLIENT_AUTH.to_string()],
                private_key: Some(CertificatePrivateKey::default()),
                issuer_ref,
                ..Default::default()
            },
        )
    }

    /// Name of the Secret cert-manager writes the key pair into
    pub fn secret_name(&self) -> &str {
        &self.spec.secret_name
    }

    /// Status conditions, empty if none reported yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Certificate spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Secret the key pair is stored in
    pub secret_name: String,
    /// Subject common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// Subject alternative DNS names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    /// Requested lifetime (e.g., "24h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// How long before expiry to renew
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<String>,
    /// Whether this is a CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_ca: Option<bool>,
    /// Key usages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
    /// Private key settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<CertificatePrivateKey>,
    /// Issuer that signs this certificate
    pub issuer_ref: IssuerRef,
    /// X.509 name constraints (CA certificates only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_constraints: Option<NameConstraints>,
}

impl Default for IssuerRef {
    fn default() -> Self {
        Self::issuer("")
    }
}

/// Private key settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePrivateKey {
    /// Key algorithm (RSA, ECDSA, Ed25519)
    pub algorithm: String,
    /// Key size in bits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Whether re-issuance generates a new key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_policy: Option<String>,
}

impl Default for CertificatePrivateKey {
    fn default() -> Self {
        Self {
            algorithm: "ECDSA".to_string(),
            size: Some(256),
            rotation_policy: Some("Always".to_string()),
        }
    }
}

/// X.509 name constraints
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NameConstraints {
    /// Whether the extension is critical
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
    /// Permitted subtrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permitted: Option<NameConstraintItem>,
    /// Excluded subtrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded: Option<NameConstraintItem>,
}

/// One side of a name constraint
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NameConstraintItem {
    /// DNS domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_domains: Vec<String>,
    /// IP CIDR ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_ranges: Vec<String>,
    /// Email addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_addresses: Vec<String>,
    /// URI domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uri_domains: Vec<String>,
}

/// Certificate status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Expiry of the current certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    /// Revision of the current certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    /// Consecutive failed issuance attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_issuance_attempts: Option<i64>,
}

/// Readiness of a Certificate
///
/// Ready once `Ready=True`. An `Issuing=False` condition with reason
/// `Failed` means the last issuance was rejected (e.g., denied by an
/// approval policy) and cert-manager will not retry until its backoff
/// expires, so it is reported as a terminal failure.
pub fn certificate_readiness(cert: &Certificate) -> Readiness {
    let conditions = cert.conditions();
    if has_condition(conditions, CONDITION_READY) {
        return Readiness::Ready;
    }
    if let Some(issuing) = find_condition(conditions, CONDITION_ISSUING) {
        if issuing.status == STATUS_FALSE && issuing.reason.as_deref() == Some(REASON_FAILED) {
            return Readiness::Failed(
                issuing
                    .message
                    .clone()
                    .unwrap_or_else(|| "certificate issuance failed".to_string()),
            );
        }
    }
    Readiness::Pending
}

// =============================================================================
// Issuer
// =============================================================================

/// cert-manager Issuer resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issuer {
    /// API version (cert-manager.io/v1)
    #[serde(default = "Issuer::default_api_version")]
    pub api_version: String,
    /// Resource kind (Issuer)
    #[serde(default = "Issuer::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Issuer specification
    pub spec: IssuerSpec,
    /// Status reported by cert-manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<IssuerStatus>,
}

impl HasApiResource for Issuer {
    const API_VERSION: &'static str = "cert-manager.io/v1";
    const KIND: &'static str = "Issuer";
}

impl_api_defaults!(Issuer);

impl Issuer {
    /// An issuer that signs with the CA key pair stored in `secret_name`
    pub fn ca(metadata: ObjectMeta, secret_name: impl Into<String>) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec: IssuerSpec {
                ca: Some(CaIssuer {
                    secret_name: secret_name.into(),
                }),
            },
            status: None,
        }
    }

    /// Reference to this issuer for use in a certificate
    pub fn to_ref(&self) -> IssuerRef {
        IssuerRef::issuer(self.metadata.name.clone())
    }

    /// Status conditions, empty if none reported yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Issuer spec (only the CA issuer type is used)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    /// CA issuer configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaIssuer>,
}

/// CA issuer configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    /// Secret holding the CA key pair
    pub secret_name: String,
}

/// Issuer status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Readiness of an Issuer; issuers never report terminal failure
pub fn issuer_readiness(issuer: &Issuer) -> Readiness {
    if has_condition(issuer.conditions(), CONDITION_READY) {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

/// Why an issuer is not ready, for validation errors
pub fn issuer_not_ready_reason(issuer: &Issuer) -> String {
    describe_condition(issuer.conditions(), CONDITION_READY)
}
