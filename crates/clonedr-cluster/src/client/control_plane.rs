//! kube-rs implementation of the control-plane traits
//!
//! Typed resources are converted to `DynamicObject` and sent through the
//! dynamic API. Readiness waits refetch on every watch event for the named
//! object, and poll on an interval when the watch is quiet or broken.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use clonedr_common::kube_utils::{
    from_dynamic, to_dynamic, Condition, HasApiResource, STATUS_TRUE,
};
use clonedr_common::wait::{
    DEFAULT_BACKUP_WAIT, DEFAULT_CERTIFICATE_WAIT, DEFAULT_CLUSTER_WAIT, DEFAULT_ISSUER_WAIT,
};
use clonedr_common::{Error, Readiness, ReadinessWait, WaitOptions, FIELD_MANAGER};

use super::{ApprovalPolicyClient, CertManagerClient, CnpgClient, VolumeClient};
use crate::resources::cert_manager::{
    certificate_readiness, issuer_readiness, CONDITION_ISSUING, REASON_MANUALLY_TRIGGERED,
};
use crate::resources::cnpg::{backup_readiness, cluster_readiness};
use crate::resources::{Backup, Certificate, CertificateRequestPolicy, Cluster, Issuer};

/// Control-plane client backed by a live API server
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    /// Create a new control-plane client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<T: HasApiResource>(&self, namespace: &str) -> Api<DynamicObject> {
        let ar = T::api_resource();
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    async fn create<T>(&self, namespace: &str, name: &str, resource: &T) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned + HasApiResource,
    {
        let obj = to_dynamic(resource)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = self
            .api::<T>(namespace)
            .create(&params, &obj)
            .await
            .map_err(|e| Error::remote("create", T::KIND, namespace, name, e.into()))?;
        info!(kind = T::KIND, namespace = %namespace, name = %name, "Created");
        from_dynamic(created)
    }

    async fn get<T>(&self, namespace: &str, name: &str) -> Result<T, Error>
    where
        T: DeserializeOwned + HasApiResource,
    {
        let obj = self
            .api::<T>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::remote("get", T::KIND, namespace, name, e.into()))?;
        from_dynamic(obj)
    }

    async fn delete<T: HasApiResource>(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<T>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(kind = T::KIND, namespace = %namespace, name = %name, "Deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(kind = T::KIND, namespace = %namespace, name = %name, "Already gone");
                Ok(())
            }
            Err(e) => Err(Error::remote("delete", T::KIND, namespace, name, e.into())),
        }
    }

    async fn wait_for<T>(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
        default_max_wait: Duration,
        predicate: fn(&T) -> Readiness,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned + HasApiResource,
    {
        let api = self.api::<T>(namespace);
        ReadinessWait::new(T::KIND, namespace, name)
            .options(options)
            .default_max_wait(default_max_wait)
            .changes(watch_changes(api.clone(), name))
            .wait(cancel, || fetch_opt::<T>(api.clone(), name.to_string()), predicate)
            .await
    }
}

async fn fetch_opt<T>(api: Api<DynamicObject>, name: String) -> Result<Option<T>, Error>
where
    T: DeserializeOwned + HasApiResource,
{
    match api.get_opt(&name).await? {
        Some(obj) => from_dynamic(obj).map(Some),
        None => Ok(None),
    }
}

/// One item per watch event on the named object; watch errors are retried
/// with backoff and otherwise ignored, since polling covers the gap
fn watch_changes(api: Api<DynamicObject>, name: &str) -> BoxStream<'static, ()> {
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| async move { event.ok().map(|_| ()) })
        .boxed()
}

/// Params for a JSON merge patch under the clonedr field manager
fn merge_patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Replace (or add) the `Issuing` condition with a manually triggered one
fn with_issuing_triggered(mut conditions: Vec<Condition>, now: String) -> Vec<Condition> {
    conditions.retain(|c| c.type_ != CONDITION_ISSUING);
    conditions.push(Condition {
        type_: CONDITION_ISSUING.to_string(),
        status: STATUS_TRUE.to_string(),
        reason: Some(REASON_MANUALLY_TRIGGERED.to_string()),
        message: Some("Certificate re-issuance manually triggered".to_string()),
        last_transition_time: Some(now),
        observed_generation: None,
    });
    conditions
}

#[async_trait]
impl CertManagerClient for KubeControlPlane {
    async fn create_certificate(&self, certificate: &Certificate) -> Result<Certificate, Error> {
        self.create(
            certificate.metadata.namespace_or_empty(),
            &certificate.metadata.name,
            certificate,
        )
        .await
    }

    async fn get_certificate(&self, namespace: &str, name: &str) -> Result<Certificate, Error> {
        self.get(namespace, name).await
    }

    async fn wait_for_ready_certificate(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Certificate, Error> {
        self.wait_for(
            cancel,
            namespace,
            name,
            options,
            DEFAULT_CERTIFICATE_WAIT,
            certificate_readiness,
        )
        .await
    }

    async fn reissue_certificate(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let current: Certificate = self.get(namespace, name).await?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let conditions = with_issuing_triggered(current.conditions().to_vec(), now);
        let patch = serde_json::json!({ "status": { "conditions": conditions } });

        self.api::<Certificate>(namespace)
            .patch_status(
                name,
                &merge_patch_params(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::remote("reissue", Certificate::KIND, namespace, name, e.into()))?;
        info!(namespace = %namespace, name = %name, "Triggered certificate re-issuance");
        Ok(())
    }

    async fn delete_certificate(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<Certificate>(namespace, name).await
    }

    async fn create_issuer(&self, issuer: &Issuer) -> Result<Issuer, Error> {
        self.create(
            issuer.metadata.namespace_or_empty(),
            &issuer.metadata.name,
            issuer,
        )
        .await
    }

    async fn get_issuer(&self, namespace: &str, name: &str) -> Result<Issuer, Error> {
        self.get(namespace, name).await
    }

    async fn wait_for_ready_issuer(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Issuer, Error> {
        self.wait_for(
            cancel,
            namespace,
            name,
            options,
            DEFAULT_ISSUER_WAIT,
            issuer_readiness,
        )
        .await
    }

    async fn delete_issuer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<Issuer>(namespace, name).await
    }
}

#[async_trait]
impl ApprovalPolicyClient for KubeControlPlane {
    async fn create_policy_for_certificate(
        &self,
        policy_name: &str,
        certificate: &Certificate,
    ) -> Result<CertificateRequestPolicy, Error> {
        let policy = CertificateRequestPolicy::for_certificate(policy_name, certificate);
        self.create("", policy_name, &policy).await
    }

    async fn delete_policy(&self, name: &str) -> Result<(), Error> {
        self.delete::<CertificateRequestPolicy>("", name).await
    }
}

#[async_trait]
impl CnpgClient for KubeControlPlane {
    async fn create_backup(&self, backup: &Backup) -> Result<Backup, Error> {
        self.create(
            backup.metadata.namespace_or_empty(),
            &backup.metadata.name,
            backup,
        )
        .await
    }

    async fn wait_for_ready_backup(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Backup, Error> {
        self.wait_for(
            cancel,
            namespace,
            name,
            options,
            DEFAULT_BACKUP_WAIT,
            backup_readiness,
        )
        .await
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<Backup>(namespace, name).await
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        self.create(
            cluster.metadata.namespace_or_empty(),
            &cluster.metadata.name,
            cluster,
        )
        .await
    }

    async fn wait_for_ready_cluster(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        options: WaitOptions,
    ) -> Result<Cluster, Error> {
        self.wait_for(
            cancel,
            namespace,
            name,
            options,
            DEFAULT_CLUSTER_WAIT,
            cluster_readiness,
        )
        .await
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Cluster, Error> {
        self.get(namespace, name).await
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<Cluster>(namespace, name).await
    }
}

#[async_trait]
impl VolumeClient for KubeControlPlane {
    async fn get_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| {
            Error::remote("get", "PersistentVolumeClaim", namespace, name, e.into())
        })
    }
}
