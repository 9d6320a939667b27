//! Leaf client certificates for database roles
//!
//! A [`ClusterUserCert`] owns one certificate and, when approval policies
//! are enabled, the policy that lets cert-manager approve it. Every object is
//! recorded on the handle as soon as it exists, so a failure later in
//! [`ClusterUserCert::provision`] can remove it again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use clonedr_common::cleanup::CERTIFICATE_CLEANUP_FLOOR;
use clonedr_common::kube_utils::ObjectMeta;
use clonedr_common::names::{limited_name, MAX_NAME_LENGTH};
use clonedr_common::{check_cancelled, CleanupTask, Error, ErrorList, WaitOptions};

use crate::client::{ApprovalPolicyClient, CertManagerClient, Clients};
use crate::resources::{Certificate, CertificateRequestPolicy, IssuerRef};

/// Options for issuing a user certificate
#[derive(Clone, Debug, Default)]
pub struct ClusterUserCertOptions {
    /// How long to wait for the certificate to become ready
    pub wait: WaitOptions,
    /// Cleanup bound; raised to the certificate cleanup floor when lower
    pub cleanup_timeout: Duration,
    /// Create an approver-policy policy for the certificate and reissue it
    pub enable_approval_policy: bool,
    /// Requested certificate lifetime
    pub duration: Option<String>,
    /// Extra labels for every object created
    pub labels: BTreeMap<String, String>,
}

/// Name of the certificate issued for `role` within `cluster_scope_name`
pub fn user_certificate_name(cluster_scope_name: &str, role: &str) -> String {
    limited_name(cluster_scope_name, &format!("{}-user", role), MAX_NAME_LENGTH)
}

/// Name of the approval policy for `certificate_name`
pub fn policy_name(certificate_name: &str) -> String {
    limited_name(certificate_name, "policy", MAX_NAME_LENGTH)
}

/// A client certificate for one database role
pub struct ClusterUserCert {
    certificates: Arc<dyn CertManagerClient>,
    policies: Arc<dyn ApprovalPolicyClient>,
    namespace: String,
    role: String,
    certificate: Option<Certificate>,
    policy: Option<CertificateRequestPolicy>,
}

impl std::fmt::Debug for ClusterUserCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterUserCert")
            .field("namespace", &self.namespace)
            .field("role", &self.role)
            .field("certificate", &self.certificate_name())
            .field("policy", &self.policy.as_ref().map(|p| &p.metadata.name))
            .finish()
    }
}

impl ClusterUserCert {
    /// Issue a certificate for `role`, signed by `issuer`
    ///
    /// Creates the certificate, then (when enabled) the approval policy and a
    /// forced re-issue, since the first request is denied until the policy
    /// exists. On any failure everything created so far is deleted under a
    /// detached deadline before the error is returned.
    #[instrument(
        skip(clients, cancel, issuer, options),
        fields(issuer = %issuer.name)
    )]
    pub async fn provision(
        clients: &Clients,
        cancel: &CancellationToken,
        namespace: &str,
        role: &str,
        issuer: &IssuerRef,
        cluster_scope_name: &str,
        options: &ClusterUserCertOptions,
    ) -> Result<Self, Error> {
        let mut user_cert = Self {
            certificates: clients.certificates.clone(),
            policies: clients.policies.clone(),
            namespace: namespace.to_string(),
            role: role.to_string(),
            certificate: None,
            policy: None,
        };

        match user_cert
            .issue(cancel, issuer, cluster_scope_name, options)
            .await
        {
            Ok(()) => Ok(user_cert),
            Err(e) => {
                let target = &mut user_cert;
                Err(CleanupTask::new(move || async move { target.delete().await })
                    .with_message(format!("failed to clean up {} user certificate", role))
                    .with_timeout(options.cleanup_timeout)
                    .with_floor(CERTIFICATE_CLEANUP_FLOOR)
                    .unwind(e)
                    .await)
            }
        }
    }

    async fn issue(
        &mut self,
        cancel: &CancellationToken,
        issuer: &IssuerRef,
        cluster_scope_name: &str,
        options: &ClusterUserCertOptions,
    ) -> Result<(), Error> {
        let name = user_certificate_name(cluster_scope_name, &self.role);

        check_cancelled(cancel, "creating user certificate")?;
        let mut metadata = ObjectMeta::new(&name, &self.namespace);
        metadata.labels.extend(options.labels.clone());
        let desired = Certificate::client(
            metadata,
            issuer.clone(),
            self.role.clone(),
            options.duration.clone(),
        );
        let created = self.certificates.create_certificate(&desired).await?;
        self.certificate = Some(created.clone());

        if options.enable_approval_policy {
            check_cancelled(cancel, "creating approval policy")?;
            let policy = self
                .policies
                .create_policy_for_certificate(&policy_name(&name), &created)
                .await?;
            self.policy = Some(policy);

            check_cancelled(cancel, "reissuing user certificate")?;
            self.certificates
                .reissue_certificate(&self.namespace, &name)
                .await?;
        }

        let ready = self
            .certificates
            .wait_for_ready_certificate(cancel, &self.namespace, &name, options.wait)
            .await?;
        self.certificate = Some(ready);

        info!(
            namespace = %self.namespace,
            name = %name,
            role = %self.role,
            "User certificate ready"
        );
        Ok(())
    }

    /// Delete the policy (if any) then the certificate (if any)
    ///
    /// Both deletions are attempted; every failure is reported. Deleted
    /// objects are forgotten, so calling this again only retries what failed.
    pub async fn delete(&mut self) -> Result<(), Error> {
        let mut errors = ErrorList::new();

        if let Some(name) = self.policy.as_ref().map(|p| p.metadata.name.clone()) {
            match self.policies.delete_policy(&name).await {
                Ok(()) => self.policy = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(name) = self.certificate_name().map(str::to_string) {
            match self
                .certificates
                .delete_certificate(&self.namespace, &name)
                .await
            {
                Ok(()) => self.certificate = None,
                Err(e) => errors.push(e),
            }
        }

        errors.into_result(format!("failed to delete {} user certificate", self.role))
    }

    /// The database role the certificate authenticates
    pub fn role(&self) -> &str {
        &self.role
    }

    /// The certificate, once created
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// The approval policy, when one was created
    pub fn policy(&self) -> Option<&CertificateRequestPolicy> {
        self.policy.as_ref()
    }

    /// Name of the certificate, once created
    pub fn certificate_name(&self) -> Option<&str> {
        self.certificate.as_ref().map(|c| c.metadata.name.as_str())
    }

    /// Secret holding the certificate's key pair, once created
    pub fn secret_name(&self) -> Option<&str> {
        self.certificate.as_ref().map(Certificate::secret_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        MockApprovalPolicyClient, MockCertManagerClient, MockCnpgClient, MockVolumeClient,
    };
    use mockall::Sequence;

    fn clients(certs: MockCertManagerClient, policies: MockApprovalPolicyClient) -> Clients {
        Clients {
            certificates: Arc::new(certs),
            policies: Arc::new(policies),
            clusters: Arc::new(MockCnpgClient::new()),
            volumes: Arc::new(MockVolumeClient::new()),
        }
    }

    fn issuer() -> IssuerRef {
        IssuerRef::issuer("pg-1a2b3c4d-client-ca-issuer")
    }

    fn expect_created(certs: &mut MockCertManagerClient) {
        certs
            .expect_create_certificate()
            .times(1)
            .returning(|cert| Ok(cert.clone()));
    }

    fn timeout_error() -> Error {
        Error::Timeout {
            kind: "Certificate".to_string(),
            namespace: "db".to_string(),
            name: "pg-1a2b3c4d-postgres-user".to_string(),
            waited: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(
            user_certificate_name("pg-1a2b3c4d", "streaming_replica"),
            "pg-1a2b3c4d-streaming-replica-user"
        );
        assert_eq!(
            policy_name("pg-1a2b3c4d-postgres-user"),
            "pg-1a2b3c4d-postgres-user-policy"
        );
        let long = "a".repeat(80);
        let name = user_certificate_name(&long, "postgres");
        assert!(name.len() <= MAX_NAME_LENGTH);
        assert!(name.ends_with("-postgres-user"));
    }

    /// Story: without approval policies the certificate is created and
    /// awaited, nothing else.
    #[tokio::test]
    async fn story_issue_without_policy() {
        let mut certs = MockCertManagerClient::new();
        expect_created(&mut certs);
        certs
            .expect_wait_for_ready_certificate()
            .withf(|_, ns, name, _| ns == "db" && name == "pg-1a2b3c4d-postgres-user")
            .times(1)
            .returning(|_, ns, name, _| {
                Ok(Certificate::client(
                    ObjectMeta::new(name, ns),
                    issuer(),
                    "postgres",
                    None,
                ))
            });
        certs.expect_reissue_certificate().never();
        let mut policies = MockApprovalPolicyClient::new();
        policies.expect_create_policy_for_certificate().never();

        let user_cert = ClusterUserCert::provision(
            &clients(certs, policies),
            &CancellationToken::new(),
            "db",
            "postgres",
            &issuer(),
            "pg-1a2b3c4d",
            &ClusterUserCertOptions::default(),
        )
        .await
        .expect("user certificate should be issued");

        assert_eq!(user_cert.role(), "postgres");
        assert_eq!(user_cert.secret_name(), Some("pg-1a2b3c4d-postgres-user"));
        assert!(user_cert.policy().is_none());
    }

    /// Story: with approval policies the policy is created before the
    /// certificate is reissued, and only then is readiness awaited.
    #[tokio::test]
    async fn story_issue_with_policy_reissues_after_policy_exists() {
        let mut seq = Sequence::new();
        let mut certs = MockCertManagerClient::new();
        let mut policies = MockApprovalPolicyClient::new();

        certs
            .expect_create_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|cert| Ok(cert.clone()));
        policies
            .expect_create_policy_for_certificate()
            .withf(|name, cert| {
                name == "pg-1a2b3c4d-postgres-user-policy"
                    && cert.metadata.name == "pg-1a2b3c4d-postgres-user"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, cert| Ok(CertificateRequestPolicy::for_certificate(name, cert)));
        certs
            .expect_reissue_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        certs
            .expect_wait_for_ready_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, ns, name, _| {
                Ok(Certificate::client(
                    ObjectMeta::new(name, ns),
                    issuer(),
                    "postgres",
                    None,
                ))
            });

        let options = ClusterUserCertOptions {
            enable_approval_policy: true,
            ..Default::default()
        };
        let user_cert = ClusterUserCert::provision(
            &clients(certs, policies),
            &CancellationToken::new(),
            "db",
            "postgres",
            &issuer(),
            "pg-1a2b3c4d",
            &options,
        )
        .await
        .expect("user certificate should be issued");

        assert_eq!(
            user_cert.policy().map(|p| p.metadata.name.as_str()),
            Some("pg-1a2b3c4d-postgres-user-policy")
        );
    }

    /// Story: a failed wait removes the policy and the certificate exactly
    /// once and reports the original failure.
    #[tokio::test]
    async fn story_failed_wait_unwinds_everything() {
        let mut certs = MockCertManagerClient::new();
        let mut policies = MockApprovalPolicyClient::new();
        expect_created(&mut certs);
        policies
            .expect_create_policy_for_certificate()
            .times(1)
            .returning(|name, cert| Ok(CertificateRequestPolicy::for_certificate(name, cert)));
        certs.expect_reissue_certificate().times(1).returning(|_, _| Ok(()));
        certs
            .expect_wait_for_ready_certificate()
            .times(1)
            .returning(|_, _, _, _| Err(timeout_error()));
        policies.expect_delete_policy().times(1).returning(|_| Ok(()));
        certs
            .expect_delete_certificate()
            .withf(|ns, name| ns == "db" && name == "pg-1a2b3c4d-postgres-user")
            .times(1)
            .returning(|_, _| Ok(()));

        let options = ClusterUserCertOptions {
            enable_approval_policy: true,
            ..Default::default()
        };
        let err = ClusterUserCert::provision(
            &clients(certs, policies),
            &CancellationToken::new(),
            "db",
            "postgres",
            &issuer(),
            "pg-1a2b3c4d",
            &options,
        )
        .await
        .expect_err("wait failure should fail provisioning");

        assert!(matches!(err, Error::Timeout { .. }));
    }

    /// Story: when the policy cannot be created only the certificate exists,
    /// so only the certificate is deleted.
    #[tokio::test]
    async fn story_failed_policy_deletes_only_certificate() {
        let mut certs = MockCertManagerClient::new();
        let mut policies = MockApprovalPolicyClient::new();
        expect_created(&mut certs);
        policies
            .expect_create_policy_for_certificate()
            .times(1)
            .returning(|_, _| Err(Error::internal("admission webhook denied")));
        policies.expect_delete_policy().never();
        certs.expect_reissue_certificate().never();
        certs.expect_wait_for_ready_certificate().never();
        certs.expect_delete_certificate().times(1).returning(|_, _| Ok(()));

        let options = ClusterUserCertOptions {
            enable_approval_policy: true,
            ..Default::default()
        };
        let err = ClusterUserCert::provision(
            &clients(certs, policies),
            &CancellationToken::new(),
            "db",
            "postgres",
            &issuer(),
            "pg-1a2b3c4d",
            &options,
        )
        .await
        .expect_err("policy failure should fail provisioning");

        assert!(err.to_string().contains("admission webhook denied"));
    }

    /// Story: when cleanup fails too, both failures are reported.
    #[tokio::test]
    async fn story_failed_cleanup_reports_both_failures() {
        let mut certs = MockCertManagerClient::new();
        expect_created(&mut certs);
        certs
            .expect_wait_for_ready_certificate()
            .times(1)
            .returning(|_, _, _, _| Err(timeout_error()));
        certs
            .expect_delete_certificate()
            .times(1)
            .returning(|_, _| Err(Error::internal("api server unavailable")));

        let err = ClusterUserCert::provision(
            &clients(certs, MockApprovalPolicyClient::new()),
            &CancellationToken::new(),
            "db",
            "postgres",
            &issuer(),
            "pg-1a2b3c4d",
            &ClusterUserCertOptions::default(),
        )
        .await
        .expect_err("provisioning should fail");

        assert!(matches!(err, Error::Cleanup { .. }));
        assert_eq!(err.sub_errors().map(ErrorList::len), Some(2));
        assert!(matches!(err.original_failure(), Some(Error::Timeout { .. })));
        let msg = err.to_string();
        assert!(msg.contains("api server unavailable"));
        assert!(msg.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_creates_nothing() {
        let mut certs = MockCertManagerClient::new();
        certs.expect_create_certificate().never();
        certs.expect_delete_certificate().never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ClusterUserCert::provision(
            &clients(certs, MockApprovalPolicyClient::new()),
            &cancel,
            "db",
            "postgres",
            &issuer(),
            "pg-1a2b3c4d",
            &ClusterUserCertOptions::default(),
        )
        .await
        .expect_err("cancelled provisioning should fail");
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_policy_and_is_repeatable() {
        let mut certs = MockCertManagerClient::new();
        certs.expect_delete_certificate().times(1).returning(|_, _| Ok(()));
        let mut policies = MockApprovalPolicyClient::new();
        policies.expect_delete_policy().never();
        let clients = clients(certs, policies);

        let mut user_cert = ClusterUserCert {
            certificates: clients.certificates.clone(),
            policies: clients.policies.clone(),
            namespace: "db".to_string(),
            role: "postgres".to_string(),
            certificate: Some(Certificate::client(
                ObjectMeta::new("pg-1a2b3c4d-postgres-user", "db"),
                issuer(),
                "postgres",
                None,
            )),
            policy: None,
        };

        user_cert.delete().await.expect("delete should succeed");
        assert!(user_cert.certificate().is_none());
        user_cert.delete().await.expect("second delete is a no-op");
    }

    #[tokio::test]
    async fn test_delete_attempts_certificate_after_policy_failure() {
        let mut certs = MockCertManagerClient::new();
        certs
            .expect_delete_certificate()
            .times(1)
            .returning(|_, _| Err(Error::internal("conflict")));
        let mut policies = MockApprovalPolicyClient::new();
        policies
            .expect_delete_policy()
            .times(1)
            .returning(|_| Err(Error::internal("forbidden")));
        let clients = clients(certs, policies);

        let cert = Certificate::client(
            ObjectMeta::new("pg-1a2b3c4d-postgres-user", "db"),
            issuer(),
            "postgres",
            None,
        );
        let mut user_cert = ClusterUserCert {
            certificates: clients.certificates.clone(),
            policies: clients.policies.clone(),
            namespace: "db".to_string(),
            role: "postgres".to_string(),
            policy: Some(CertificateRequestPolicy::for_certificate(
                "pg-1a2b3c4d-postgres-user-policy",
                &cert,
            )),
            certificate: Some(cert),
        };

        let err = user_cert.delete().await.expect_err("both deletes failed");
        assert_eq!(err.sub_errors().map(ErrorList::len), Some(2));
        assert!(user_cert.certificate().is_some());
        assert!(user_cert.policy().is_some());
    }
}
