//! Volume declarations handed to the worker launcher
//!
//! Actions append to a caller-owned [`WorkerBuildOptions`] during setup; the
//! launcher turns it into pod volumes and mounts.

use k8s_openapi::api::core::v1::{
    KeyToPath as K8sKeyToPath, PersistentVolumeClaimVolumeSource, SecretVolumeSource, Volume,
    VolumeMount,
};
use serde::Serialize;

use crate::action::ActionId;

/// Default directory under which every action mounts its volumes
pub const DEFAULT_MOUNT_BASE: &str = "/var/lib/clonedr";

/// File mode for mounted secret keys (owner read only, as libpq requires for keys)
const SECRET_FILE_MODE: i32 = 0o400;

/// Mount path for `purpose`, scoped to one action
pub fn mount_path(base: &str, id: &ActionId, purpose: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), id, purpose)
}

/// Volume name for `purpose`, scoped to one action
pub fn volume_name(purpose: &str, id: &ActionId) -> String {
    format!("{}-{}", purpose, id)
}

/// Everything the worker launcher needs from the actions
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkerBuildOptions {
    /// Volumes to attach, in declaration order
    pub volumes: Vec<WorkerVolume>,
}

impl WorkerBuildOptions {
    /// Declare a volume
    pub fn add_volume(&mut self, volume: WorkerVolume) {
        self.volumes.push(volume);
    }

    /// Pod volumes
    pub fn k8s_volumes(&self) -> Vec<Volume> {
        self.volumes.iter().map(WorkerVolume::to_volume).collect()
    }

    /// Container mounts
    pub fn k8s_volume_mounts(&self) -> Vec<VolumeMount> {
        self.volumes
            .iter()
            .flat_map(WorkerVolume::to_volume_mounts)
            .collect()
    }
}

/// One volume and where it is mounted in the worker
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerVolume {
    /// Volume name, unique within the worker
    pub name: String,
    /// Paths the volume is mounted at
    pub mount_paths: Vec<String>,
    /// Where the data comes from
    pub source: VolumeSource,
}

impl WorkerVolume {
    /// A persistent volume claim mounted read-write at `mount_path`
    pub fn claim(
        name: impl Into<String>,
        mount_path: impl Into<String>,
        claim: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mount_paths: vec![mount_path.into()],
            source: VolumeSource::PersistentVolumeClaim {
                claim_name: claim.into(),
            },
        }
    }

    /// A secret mounted read-only at `mount_path`, optionally limited to `items`
    pub fn secret(
        name: impl Into<String>,
        mount_path: impl Into<String>,
        secret: impl Into<String>,
        items: Vec<KeyToPath>,
    ) -> Self {
        Self {
            name: name.into(),
            mount_paths: vec![mount_path.into()],
            source: VolumeSource::Secret {
                secret_name: secret.into(),
                items,
            },
        }
    }

    /// First mount path
    pub fn mount_path(&self) -> Option<&str> {
        self.mount_paths.first().map(String::as_str)
    }

    fn to_volume(&self) -> Volume {
        let mut volume = Volume {
            name: self.name.clone(),
            ..Default::default()
        };
        match &self.source {
            VolumeSource::PersistentVolumeClaim { claim_name } => {
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.clone(),
                    read_only: Some(false),
                });
            }
            VolumeSource::Secret { secret_name, items } => {
                volume.secret = Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    items: (!items.is_empty()).then(|| {
                        items
                            .iter()
                            .map(|item| K8sKeyToPath {
                                key: item.key.clone(),
                                path: item.path.clone(),
                                mode: None,
                            })
                            .collect()
                    }),
                    default_mode: Some(SECRET_FILE_MODE),
                    optional: Some(false),
                });
            }
        }
        volume
    }

    fn to_volume_mounts(&self) -> Vec<VolumeMount> {
        let read_only = matches!(self.source, VolumeSource::Secret { .. });
        self.mount_paths
            .iter()
            .map(|path| VolumeMount {
                name: self.name.clone(),
                mount_path: path.clone(),
                read_only: Some(read_only),
                ..Default::default()
            })
            .collect()
    }
}

/// Source of a worker volume
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// A persistent volume claim
    #[serde(rename_all = "camelCase")]
    PersistentVolumeClaim {
        /// Claim name
        claim_name: String,
    },
    /// A secret; every key is projected when `items` is empty
    #[serde(rename_all = "camelCase")]
    Secret {
        /// Secret name
        secret_name: String,
        /// Keys to project and the file each lands in
        #[serde(skip_serializing_if = "Vec::is_empty")]
        items: Vec<KeyToPath>,
    },
}

/// Projects one secret key to a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyToPath {
    /// Secret key
    pub key: String,
    /// Relative file path
    pub path: String,
}

impl KeyToPath {
    /// Project `key` to a file of the same name
    pub fn same(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            path: key.clone(),
            key,
        }
    }
}
