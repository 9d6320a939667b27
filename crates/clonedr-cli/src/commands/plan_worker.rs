//! A [`RemoteWorker`] that prints what the worker should run
//!
//! The dump/restore process itself is launched outside clonedr. The plan
//! carries everything needed to launch it: volumes, mounts, the `PG*`
//! environment, the operation and its file.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use clonedr_common::Error;
use clonedr_dr::{PostgresCredentials, RemoteWorker, WorkerBuildOptions};

/// Everything the external worker needs for one operation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPlan {
    pub action: String,
    pub operation: String,
    pub file: String,
    pub env: Vec<EnvVar>,
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
}

/// Prints the plan, then waits for the operator
pub struct PlanWorker {
    action: &'static str,
    build_options: WorkerBuildOptions,
    hold: Option<Duration>,
}

impl PlanWorker {
    pub fn new(
        action: &'static str,
        build_options: WorkerBuildOptions,
        hold: Option<Duration>,
    ) -> Self {
        Self {
            action,
            build_options,
            hold,
        }
    }

    pub fn plan(
        &self,
        operation: &str,
        credentials: &PostgresCredentials,
        file: &str,
    ) -> WorkerPlan {
        WorkerPlan {
            action: self.action.to_string(),
            operation: operation.to_string(),
            file: file.to_string(),
            env: credentials.to_env_vars(),
            volumes: self.build_options.k8s_volumes(),
            volume_mounts: self.build_options.k8s_volume_mounts(),
        }
    }

    async fn publish(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        credentials: &PostgresCredentials,
        file: &str,
    ) -> Result<(), Error> {
        let plan = self.plan(operation, credentials, file);
        let rendered = serde_yaml::to_string(&plan)
            .map_err(|e| Error::serialization(format!("failed to render worker plan: {}", e)))?;
        println!("---\n{}", rendered);

        match self.hold {
            Some(hold) => {
                info!(hold = ?hold, "Holding for the external worker");
                tokio::select! {
                    _ = tokio::time::sleep(hold) => Ok(()),
                    _ = cancel.cancelled() => {
                        Err(Error::cancelled(format!("waiting for {}", operation)))
                    }
                }
            }
            None => {
                info!("Press Ctrl-C once the external worker has finished");
                cancel.cancelled().await;
                info!(operation = %operation, "Worker completion confirmed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RemoteWorker for PlanWorker {
    async fn dump_all(
        &self,
        cancel: &CancellationToken,
        credentials: &PostgresCredentials,
        output_file: &str,
    ) -> Result<(), Error> {
        self.publish(cancel, "dump_all", credentials, output_file).await
    }

    async fn restore(
        &self,
        cancel: &CancellationToken,
        credentials: &PostgresCredentials,
        input_file: &str,
    ) -> Result<(), Error> {
        self.publish(cancel, "restore", credentials, input_file).await
    }
}
