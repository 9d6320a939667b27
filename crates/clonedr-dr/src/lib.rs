//! Staged disaster-recovery actions for CloudNativePG clusters
//!
//! Every action is driven through configure, validate, setup, execute and
//! cleanup. Setup declares the volumes the remote worker needs; execute hands
//! the worker typed connection parameters.

#![warn(missing_docs)]

pub mod action;
pub mod backup;
pub mod credentials;
pub mod restore;
pub mod volumes;
pub mod worker;

pub use action::{ActionId, Phase, StagedAction};
pub use backup::{BackupAction, BackupOptions};
pub use credentials::{PgEnvVar, PostgresCredentials};
pub use restore::{RestoreAction, RestoreOptions};
pub use volumes::{KeyToPath, VolumeSource, WorkerBuildOptions, WorkerVolume};
pub use worker::{dump_file_path, RemoteWorker};

#[cfg(any(test, feature = "testing"))]
pub use worker::MockRemoteWorker;
