//! The staged lifecycle shared by every disaster-recovery action
//!
//! ```text
//! Unconfigured --configure--> Configured --validate--> Validated
//!              --setup--> Setup --execute--> Executed
//! ```
//!
//! Each transition is one-shot and checked at runtime. `cleanup` is a no-op
//! before `Setup` and never changes the phase, so a failed cleanup can be
//! retried.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use clonedr_cluster::resources::cert_manager::{issuer_not_ready_reason, issuer_readiness};
use clonedr_cluster::resources::cnpg::cluster_readiness;
use clonedr_cluster::resources::{Cluster, Issuer};
use clonedr_cluster::Clients;
use clonedr_common::kube_utils::{describe_condition, CONDITION_READY};
use clonedr_common::{check_cancelled, Error, Readiness};

use crate::volumes::WorkerBuildOptions;
use crate::worker::RemoteWorker;

/// Lifecycle phase of an action
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Freshly constructed
    Unconfigured,
    /// Parameters stored and identifier generated
    Configured,
    /// Every dependency exists and is ready
    Validated,
    /// The working set exists and volumes were declared
    Setup,
    /// The remote work finished
    Executed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Unconfigured => "unconfigured",
            Phase::Configured => "configured",
            Phase::Validated => "validated",
            Phase::Setup => "set up",
            Phase::Executed => "executed",
        };
        f.write_str(s)
    }
}

/// Identifier embedded in every name an action derives
///
/// Two actions against the same cluster never share one, so their objects
/// and mount paths never collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActionId(String);

impl ActionId {
    /// Length of a generated identifier
    pub const LEN: usize = 8;

    /// A fresh random identifier
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(Self::LEN);
        Self(id)
    }

    /// The identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An action driven through the staged lifecycle
///
/// `configure` is inherent to each action since its parameters differ.
#[async_trait]
pub trait StagedAction: Send {
    /// Short name for logs and sequencing errors ("backup", "restore")
    fn kind(&self) -> &'static str;

    /// Current phase
    fn phase(&self) -> Phase;

    /// Identifier, once configured
    fn id(&self) -> Option<&ActionId>;

    /// Check every dependency exists and is ready; read-only
    async fn validate(&mut self, cancel: &CancellationToken) -> Result<(), Error>;

    /// Build the working set and append its volumes to `build_options`
    async fn setup(
        &mut self,
        cancel: &CancellationToken,
        build_options: &mut WorkerBuildOptions,
    ) -> Result<(), Error>;

    /// Run the remote work
    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        worker: &dyn RemoteWorker,
    ) -> Result<(), Error>;

    /// Tear down the working set; a no-op before setup
    async fn cleanup(&mut self) -> Result<(), Error>;
}

/// Phase bookkeeping shared by the actions
#[derive(Debug)]
pub(crate) struct Lifecycle {
    kind: &'static str,
    phase: Phase,
    id: Option<ActionId>,
}

impl Lifecycle {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            phase: Phase::Unconfigured,
            id: None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn id(&self) -> Option<&ActionId> {
        self.id.as_ref()
    }

    /// Identifier of a configured action
    pub(crate) fn require_id(&self) -> Result<&ActionId, Error> {
        self.id
            .as_ref()
            .ok_or_else(|| Error::sequence(self.kind, "action is not configured"))
    }

    /// Move to `Configured` with a fresh identifier
    pub(crate) fn configure(&mut self) -> Result<&ActionId, Error> {
        if self.phase != Phase::Unconfigured {
            return Err(Error::sequence(self.kind, "action is already configured"));
        }
        let id = ActionId::generate();
        info!(action = self.kind, action_id = %id, "Configured");
        self.phase = Phase::Configured;
        Ok(self.id.insert(id))
    }

    /// Fail unless the current phase is one of `allowed`
    pub(crate) fn require(&self, operation: &str, allowed: &[Phase]) -> Result<(), Error> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let message = if self.phase > allowed.iter().copied().max().unwrap_or(Phase::Executed) {
            format!("cannot {}: action is already {}", operation, self.phase)
        } else {
            format!("cannot {}: action is only {}", operation, self.phase)
        };
        Err(Error::sequence(self.kind, message))
    }

    pub(crate) fn advance(&mut self, to: Phase) {
        debug!(action = self.kind, from = %self.phase, to = %to, "Phase transition");
        self.phase = to;
    }

    /// Whether there is anything for cleanup to remove
    pub(crate) fn needs_cleanup(&self) -> bool {
        self.phase >= Phase::Setup
    }
}

/// Dependencies every action checks during validation
pub(crate) struct Dependencies<'a> {
    pub namespace: &'a str,
    pub cluster: &'a str,
    pub serving_issuer: &'a str,
    pub client_issuer: &'a str,
    pub volume_claim: &'a str,
}

/// Fetch the cluster, both issuers and the volume; all must exist and be ready
///
/// Returns the cluster so setup can read from it.
pub(crate) async fn validate_dependencies(
    clients: &Clients,
    cancel: &CancellationToken,
    deps: &Dependencies<'_>,
) -> Result<Cluster, Error> {
    let ns = deps.namespace;

    check_cancelled(cancel, "validating cluster")?;
    let cluster = clients.clusters.get_cluster(ns, deps.cluster).await?;
    if cluster_readiness(&cluster) != Readiness::Ready {
        return Err(Error::NotReady {
            kind: "Cluster".to_string(),
            namespace: ns.to_string(),
            name: deps.cluster.to_string(),
            reason: describe_condition(cluster.conditions(), CONDITION_READY),
        });
    }

    for issuer_name in [deps.serving_issuer, deps.client_issuer] {
        check_cancelled(cancel, "validating issuers")?;
        let issuer = clients.certificates.get_issuer(ns, issuer_name).await?;
        require_issuer_ready(ns, issuer_name, &issuer)?;
    }

    check_cancelled(cancel, "validating volume")?;
    clients.volumes.get_volume(ns, deps.volume_claim).await?;

    debug!(namespace = %ns, cluster = %deps.cluster, "Dependencies validated");
    Ok(cluster)
}

fn require_issuer_ready(namespace: &str, name: &str, issuer: &Issuer) -> Result<(), Error> {
    match issuer_readiness(issuer) {
        Readiness::Ready => Ok(()),
        _ => Err(Error::NotReady {
            kind: "Issuer".to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: issuer_not_ready_reason(issuer),
        }),
    }
}
