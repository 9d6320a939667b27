//! The remote worker that runs dumps and restores

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use clonedr_common::Error;

use crate::credentials::PostgresCredentials;

/// Extension of dump files written to the DR volume
pub const DUMP_FILE_EXTENSION: &str = "dump";

/// Path of the dump of `cluster` inside the DR volume mounted at `dr_mount`
pub fn dump_file_path(dr_mount: &str, cluster: &str) -> String {
    format!(
        "{}/{}.{}",
        dr_mount.trim_end_matches('/'),
        cluster,
        DUMP_FILE_EXTENSION
    )
}

/// Runs database work inside a worker launched with the declared volumes
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait RemoteWorker: Send + Sync {
    /// Dump every database reachable with `credentials` into `output_file`
    async fn dump_all(
        &self,
        cancel: &CancellationToken,
        credentials: &PostgresCredentials,
        output_file: &str,
    ) -> Result<(), Error>;

    /// Restore `input_file` into the server reachable with `credentials`
    async fn restore(
        &self,
        cancel: &CancellationToken,
        credentials: &PostgresCredentials,
        input_file: &str,
    ) -> Result<(), Error>;
}
