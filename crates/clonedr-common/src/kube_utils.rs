//! Shared Kubernetes utilities using kube-rs
//!
//! Typed resource helpers shared by every control-plane binding: canonical
//! metadata, compile-time API version/kind, standard status conditions,
//! conversion to and from `DynamicObject`, and client construction.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Standard Kubernetes name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label on everything clonedr creates
pub const LABEL_MANAGED_BY_CLONEDR: &str = "clonedr";
/// Label naming the cluster a resource was created to clone
pub const LABEL_CLONE_OF: &str = "clonedr.io/clone-of";

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";
/// The "False" status value for conditions
pub const STATUS_FALSE: &str = "False";

// =============================================================================
// ObjectMeta
// =============================================================================

/// Metadata for resources clonedr creates.
///
/// Automatically adds the clonedr management labels on construction.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace (absent for cluster-scoped resources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create namespaced metadata with standard clonedr labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut meta = Self::cluster_scoped(name);
        meta.namespace = Some(namespace.into());
        meta
    }

    /// Create cluster-scoped metadata with standard clonedr labels
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_string(), name.clone());
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_CLONEDR.to_string(),
        );
        Self {
            name,
            namespace: None,
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Namespace, or the empty string for cluster-scoped resources
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implement this for resource types to derive their `ApiResource` from
/// their internal constants, ensuring consistency between serialization and
/// API calls.
pub trait HasApiResource {
    /// Full API version (e.g., "cert-manager.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "Certificate")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else if lower.ends_with('s') {
        format!("{}es", lower)
    } else {
        format!("{}s", lower)
    }
}

/// Convert a typed resource to a `DynamicObject` for the dynamic API
pub fn to_dynamic<T>(resource: &T) -> Result<DynamicObject, Error>
where
    T: Serialize + HasApiResource,
{
    let value = serde_json::to_value(resource)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

/// Convert a `DynamicObject` returned by the API server into a typed resource
pub fn from_dynamic<T>(obj: DynamicObject) -> Result<T, Error>
where
    T: DeserializeOwned + HasApiResource,
{
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

// =============================================================================
// Conditions
// =============================================================================

/// A standard status condition as used by cert-manager and CloudNativePG
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g., "Ready", "Issuing")
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Find a condition by type
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

/// Check if a condition of the given type has status "True"
pub fn has_condition(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type)
        .map(|c| c.status == STATUS_TRUE)
        .unwrap_or(false)
}

/// Human-readable summary of a condition for "not ready" errors
pub fn describe_condition(conditions: &[Condition], condition_type: &str) -> String {
    match find_condition(conditions, condition_type) {
        Some(c) => format!(
            "{}={} ({})",
            c.type_,
            c.status,
            c.message.as_deref().or(c.reason.as_deref()).unwrap_or("no message")
        ),
        None => format!("no {} condition", condition_type),
    }
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
