//! Compensating cleanup with a detached, bounded deadline
//!
//! When a multi-step operation fails partway through, whatever it created so
//! far must be removed. The operation frequently failed *because* its own
//! cancellation token fired or its deadline passed, so cleanup never observes
//! the caller's token: it gets a fresh bound of
//! `max(configured timeout, floor)` and reports a deadline error instead of
//! hanging past it.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{Error, ErrorList};

/// Floor for cleaning up a single certificate and its approval policy
pub const CERTIFICATE_CLEANUP_FLOOR: Duration = Duration::from_secs(30);

/// Floor for tearing down a whole cloned cluster
pub const CLONE_CLEANUP_FLOOR: Duration = Duration::from_secs(10 * 60);

/// A single compensating action, run once
pub struct CleanupTask<F> {
    func: F,
    message: String,
    original: Option<Error>,
    timeout: Duration,
    floor: Duration,
}

impl<F, Fut> CleanupTask<F>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    /// Wrap `func` as a cleanup task with the certificate-level floor
    pub fn new(func: F) -> Self {
        Self {
            func,
            message: "cleanup failed".to_string(),
            original: None,
            timeout: Duration::ZERO,
            floor: CERTIFICATE_CLEANUP_FLOOR,
        }
    }

    /// Message used to wrap a cleanup failure
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// The failure that triggered this cleanup
    pub fn with_original(mut self, original: Error) -> Self {
        self.original = Some(original);
        self
    }

    /// Caller-configured cleanup timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Hard floor for the cleanup bound
    pub fn with_floor(mut self, floor: Duration) -> Self {
        self.floor = floor;
        self
    }

    /// The bound the cleanup actually runs under
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.max(self.floor)
    }

    /// Run the cleanup
    ///
    /// - cleanup succeeded, no original: `Ok(())`
    /// - cleanup succeeded, original set: the original, unchanged
    /// - cleanup failed: [`Error::Cleanup`] holding the cleanup failure and
    ///   the original (when set)
    pub async fn run(self) -> Result<(), Error> {
        let bound = self.effective_timeout();
        let outcome = execute(self.func, bound).await;
        match (outcome, self.original) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(original)) => Err(original),
            (Err(e), original) => Err(cleanup_error(self.message, e, original)),
        }
    }

    /// Run the cleanup on behalf of a failed operation, returning the error to report
    pub async fn unwind(self, original: Error) -> Error {
        let bound = self.effective_timeout();
        match execute(self.func, bound).await {
            Ok(()) => original,
            Err(e) => cleanup_error(self.message, e, Some(original)),
        }
    }
}

async fn execute<F, Fut>(func: F, bound: Duration) -> Result<(), Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    debug!(bound = ?bound, "Running cleanup");
    match tokio::time::timeout(bound, func()).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded {
            context: "cleanup".to_string(),
            waited: bound,
        }),
    }
}

fn cleanup_error(message: String, failure: Error, original: Option<Error>) -> Error {
    warn!(error = %failure, "Cleanup failed");
    let mut errors = ErrorList::new();
    errors.push(failure);
    if let Some(original) = original {
        errors.push(original);
    }
    Error::Cleanup { message, errors }
}
