//! Optional YAML configuration file
//!
//! Every section and field is optional; command-line flags override what
//! the file sets. Durations are whole seconds, and `0` (the default) means
//! "use the built-in default" everywhere.
//!
//! ```yaml
//! waits:
//!   certificateSeconds: 120
//!   clusterSeconds: 1800
//! cleanup:
//!   timeoutSeconds: 900
//! clone:
//!   approvalPolicy: true
//!   clusterDomain: cluster.local
//! worker:
//!   mountBase: /var/lib/clonedr
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use clonedr_cluster::{CloneClusterOptions, ClusterUserCertOptions};
use clonedr_common::quantity::StorageSize;
use clonedr_common::WaitOptions;
use clonedr_dr::volumes::DEFAULT_MOUNT_BASE;

use crate::{Error, Result};

/// Parsed configuration file
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CliConfig {
    pub waits: WaitsConfig,
    pub cleanup: CleanupConfig,
    pub clone: CloneConfig,
    pub worker: WorkerConfig,
}

/// Per-kind maximum waits
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WaitsConfig {
    pub certificate_seconds: u64,
    pub issuer_seconds: u64,
    pub backup_seconds: u64,
    pub cluster_seconds: u64,
    pub poll_interval_seconds: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CleanupConfig {
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CloneConfig {
    pub approval_policy: bool,
    pub instances: Option<i32>,
    pub cluster_domain: Option<String>,
    pub minimum_storage_size: Option<String>,
    pub certificate_duration: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    pub mount_base: Option<String>,
}

impl CliConfig {
    /// Read `path`, or return the defaults when no file was given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)?;
        let config = Self::parse(&raw)
            .map_err(|e| Error::invalid_config(path.display().to_string(), e.to_string()))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Parse YAML; an empty document is the default configuration
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup.timeout_seconds)
    }

    pub fn mount_base(&self) -> String {
        self.worker
            .mount_base
            .clone()
            .unwrap_or_else(|| DEFAULT_MOUNT_BASE.to_string())
    }

    fn wait(&self, seconds: u64) -> WaitOptions {
        let mut options = WaitOptions::with_max_wait(Duration::from_secs(seconds));
        if self.waits.poll_interval_seconds > 0 {
            options.poll_interval = Duration::from_secs(self.waits.poll_interval_seconds);
        }
        options
    }

    /// Clone options; `approval_policy` overrides the file when the flag is set
    pub fn clone_options(&self, approval_policy: bool) -> Result<CloneClusterOptions> {
        let defaults = CloneClusterOptions::default();
        let minimum_storage_size = self
            .clone
            .minimum_storage_size
            .as_deref()
            .map(|raw| StorageSize::parse("clone.minimumStorageSize", raw))
            .transpose()?;

        Ok(CloneClusterOptions {
            backup_wait: self.wait(self.waits.backup_seconds),
            certificate_wait: self.wait(self.waits.certificate_seconds),
            issuer_wait: self.wait(self.waits.issuer_seconds),
            cluster_wait: self.wait(self.waits.cluster_seconds),
            cleanup_timeout: self.cleanup_timeout(),
            enable_approval_policy: approval_policy || self.clone.approval_policy,
            certificate_duration: self
                .clone
                .certificate_duration
                .clone()
                .or(defaults.certificate_duration),
            instances: self.clone.instances.unwrap_or(defaults.instances),
            minimum_storage_size,
            cluster_domain: self.clone.cluster_domain.clone(),
            ..defaults
        })
    }

    /// Options for a standalone user certificate
    pub fn user_cert_options(&self, approval_policy: bool) -> ClusterUserCertOptions {
        ClusterUserCertOptions {
            wait: self.wait(self.waits.certificate_seconds),
            cleanup_timeout: self.cleanup_timeout(),
            enable_approval_policy: approval_policy || self.clone.approval_policy,
            duration: self.clone.certificate_duration.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(CliConfig::parse("").expect("empty parses"), CliConfig::default());
        assert_eq!(CliConfig::parse("{}").expect("{} parses"), CliConfig::default());
    }

    #[test]
    fn test_sections_are_read() {
        let config = CliConfig::parse(
            r#"
waits:
  certificateSeconds: 120
  pollIntervalSeconds: 5
cleanup:
  timeoutSeconds: 900
clone:
  approvalPolicy: true
  instances: 2
  clusterDomain: cluster.local
  minimumStorageSize: 20Gi
worker:
  mountBase: /data
"#,
        )
        .expect("valid config");

        assert_eq!(config.cleanup_timeout(), Duration::from_secs(900));
        assert_eq!(config.mount_base(), "/data");

        let options = config.clone_options(false).expect("valid clone options");
        assert!(options.enable_approval_policy);
        assert_eq!(options.instances, 2);
        assert_eq!(options.cluster_domain.as_deref(), Some("cluster.local"));
        assert_eq!(options.certificate_wait.max_wait, Duration::from_secs(120));
        assert_eq!(options.certificate_wait.poll_interval, Duration::from_secs(5));
        assert_eq!(options.backup_wait.max_wait, Duration::ZERO);
        assert_eq!(
            options.minimum_storage_size.as_ref().map(StorageSize::as_str),
            Some("20Gi")
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(CliConfig::parse("waits:\n  certificate: 10\n").is_err());
        assert!(CliConfig::parse("extra: true\n").is_err());
    }

    #[test]
    fn test_bad_minimum_storage_size_names_the_field() {
        let config =
            CliConfig::parse("clone:\n  minimumStorageSize: lots\n").expect("parses as a string");
        let err = config.clone_options(false).expect_err("not a quantity");
        assert!(err.to_string().contains("clone.minimumStorageSize"));
    }

    #[test]
    fn test_defaults_keep_built_in_behavior() {
        let config = CliConfig::default();
        assert_eq!(config.mount_base(), DEFAULT_MOUNT_BASE);

        let options = config.clone_options(true).expect("defaults are valid");
        assert!(options.enable_approval_policy);
        assert_eq!(
            options.certificate_duration,
            CloneClusterOptions::default().certificate_duration
        );

        let user = config.user_cert_options(false);
        assert!(!user.enable_approval_policy);
        assert_eq!(user.wait.max_wait, Duration::ZERO);
    }
}
