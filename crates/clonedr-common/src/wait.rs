//! Readiness waits for remote objects
//!
//! Blocks until a named object satisfies a caller-supplied predicate, its
//! own status reports a terminal failure, or a bounded deadline passes.
//! Refetches are driven by a change-notification stream when one is
//! available, and by interval polling otherwise (or once the stream ends).

use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::Error;

/// Default interval between refetches when no change notification arrives
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default maximum wait for certificates
pub const DEFAULT_CERTIFICATE_WAIT: Duration = Duration::from_secs(60);

/// Default maximum wait for issuers
pub const DEFAULT_ISSUER_WAIT: Duration = Duration::from_secs(60);

/// Default maximum wait for database backups
pub const DEFAULT_BACKUP_WAIT: Duration = Duration::from_secs(10 * 60);

/// Default maximum wait for database clusters
pub const DEFAULT_CLUSTER_WAIT: Duration = Duration::from_secs(10 * 60);

/// Fail fast if the caller has already cancelled
///
/// Checked before each remote mutation so a step is never started after
/// cancellation; mutations themselves are not interrupted mid-flight, so
/// whatever they create is always recorded for cleanup.
pub fn check_cancelled(cancel: &CancellationToken, context: &str) -> Result<(), Error> {
    if cancel.is_cancelled() {
        Err(Error::cancelled(context))
    } else {
        Ok(())
    }
}

/// Options accepted by every "wait for ready" operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    /// Maximum time to wait; zero means use the component default
    pub max_wait: Duration,
    /// Time between refetches when no change notification arrives
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            max_wait: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitOptions {
    /// Options with an explicit maximum wait
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            max_wait,
            ..Default::default()
        }
    }

    /// The bound to actually use, substituting `default` for a zero max wait
    pub fn effective_max_wait(&self, default: Duration) -> Duration {
        if self.max_wait.is_zero() {
            default
        } else {
            self.max_wait
        }
    }
}

/// Outcome of applying a readiness predicate to a fetched object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The object is usable
    Ready,
    /// Keep waiting
    Pending,
    /// The object reports a failure it will not recover from
    Failed(String),
}

/// A bounded wait on one named object
///
/// ```ignore
/// let cert = ReadinessWait::new("Certificate", &ns, &name)
///     .options(opts)
///     .default_max_wait(DEFAULT_CERTIFICATE_WAIT)
///     .changes(watch_stream)
///     .wait(cancel, || api.get_certificate(&ns, &name), certificate_readiness)
///     .await?;
/// ```
pub struct ReadinessWait<'a> {
    kind: &'a str,
    namespace: &'a str,
    name: &'a str,
    options: WaitOptions,
    default_max_wait: Duration,
    changes: Option<BoxStream<'a, ()>>,
}

impl<'a> ReadinessWait<'a> {
    /// Start describing a wait on `kind` `namespace`/`name`
    pub fn new(kind: &'a str, namespace: &'a str, name: &'a str) -> Self {
        Self {
            kind,
            namespace,
            name,
            options: WaitOptions::default(),
            default_max_wait: DEFAULT_CLUSTER_WAIT,
            changes: None,
        }
    }

    /// Set the caller's wait options
    pub fn options(mut self, options: WaitOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the component default used when the caller's max wait is zero
    pub fn default_max_wait(mut self, default_max_wait: Duration) -> Self {
        self.default_max_wait = default_max_wait;
        self
    }

    /// Refetch whenever this stream yields, in addition to interval polling
    pub fn changes(mut self, changes: BoxStream<'a, ()>) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Wait until `predicate` reports ready or failed
    ///
    /// `fetch` returns `Ok(None)` when the object does not exist. The wait
    /// fails on deadline, on cancellation of `cancel`, on a fetch error, on
    /// a terminal failure, or when the object disappears.
    pub async fn wait<T, F, Fut, P>(
        mut self,
        cancel: &CancellationToken,
        mut fetch: F,
        predicate: P,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, Error>>,
        P: Fn(&T) -> Readiness,
    {
        let max_wait = self.options.effective_max_wait(self.default_max_wait);
        let deadline = Instant::now() + max_wait;
        let mut changes = self.changes.take();

        debug!(
            kind = self.kind,
            namespace = self.namespace,
            name = self.name,
            max_wait = ?max_wait,
            "Waiting for object to become ready"
        );

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = sleep_until(deadline) => return Err(self.timeout(max_wait)),
                fetched = fetch() => fetched,
            };

            let object = match fetched {
                Ok(Some(object)) => object,
                Ok(None) => {
                    return Err(Error::ObjectDeleted {
                        kind: self.kind.to_string(),
                        namespace: self.namespace.to_string(),
                        name: self.name.to_string(),
                    })
                }
                Err(e) => {
                    return Err(Error::remote(
                        "get",
                        self.kind,
                        self.namespace,
                        self.name,
                        e,
                    ))
                }
            };

            match predicate(&object) {
                Readiness::Ready => {
                    debug!(
                        kind = self.kind,
                        namespace = self.namespace,
                        name = self.name,
                        "Object is ready"
                    );
                    return Ok(object);
                }
                Readiness::Failed(reason) => {
                    return Err(Error::TerminalFailure {
                        kind: self.kind.to_string(),
                        namespace: self.namespace.to_string(),
                        name: self.name.to_string(),
                        reason,
                    })
                }
                Readiness::Pending => {
                    trace!(kind = self.kind, name = self.name, "Object not ready yet");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = sleep_until(deadline) => return Err(self.timeout(max_wait)),
                _ = next_change(&mut changes) => {}
                _ = sleep(self.options.poll_interval) => {}
            }
        }
    }

    fn cancelled(&self) -> Error {
        Error::cancelled(format!(
            "waiting for {} {}/{}",
            self.kind, self.namespace, self.name
        ))
    }

    fn timeout(&self, waited: Duration) -> Error {
        Error::Timeout {
            kind: self.kind.to_string(),
            namespace: self.namespace.to_string(),
            name: self.name.to_string(),
            waited,
        }
    }
}

/// Resolves on the next change notification; never resolves once the stream is gone
async fn next_change(changes: &mut Option<BoxStream<'_, ()>>) {
    if let Some(stream) = changes {
        if stream.next().await.is_some() {
            return;
        }
        // Stream ended: fall back to polling for the rest of the wait
        *changes = None;
    }
    std::future::pending::<()>().await
}
