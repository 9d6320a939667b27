//! Error types for clonedr
//!
//! Errors are structured with fields to aid debugging in production.
//! Remote failures carry the operation, kind and namespaced name of the
//! object involved; cleanup failures carry every sub-failure so callers can
//! count and inspect them independently.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for clonedr operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A staged action phase was called out of order or twice
    #[error("sequence error for {action}: {message}")]
    Sequence {
        /// Action kind (e.g., "backup", "restore")
        action: String,
        /// What was violated
        message: String,
    },

    /// A remote create/get/delete/wait call failed
    #[error("failed to {operation} {kind} {namespace}/{name}: {source}")]
    Remote {
        /// Operation attempted (create, get, delete, wait for, reissue)
        operation: String,
        /// Resource kind
        kind: String,
        /// Resource namespace (empty for cluster-scoped resources)
        namespace: String,
        /// Resource name
        name: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// The object's own status reports a failure it will not recover from
    #[error("{kind} {namespace}/{name} failed: {reason}")]
    TerminalFailure {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
        /// Failure reported by the object
        reason: String,
    },

    /// A readiness wait ran out of time
    #[error("timed out after {waited:?} waiting for {kind} {namespace}/{name} to become ready")]
    Timeout {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// A bounded operation other than a readiness wait ran out of time
    #[error("{context} did not finish within {waited:?}")]
    DeadlineExceeded {
        /// What was running
        context: String,
        /// The bound that was exceeded
        waited: Duration,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled: {context}")]
    Cancelled {
        /// What was in flight when cancellation arrived
        context: String,
    },

    /// The watched object disappeared while waiting on it
    #[error("{kind} {namespace}/{name} was deleted while waiting for it to become ready")]
    ObjectDeleted {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
    },

    /// A dependency exists but is not in a usable state
    #[error("{kind} {namespace}/{name} is not ready: {reason}")]
    NotReady {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
        /// Why it is not ready
        reason: String,
    },

    /// A configuration value could not be used (e.g., unparsable storage size)
    #[error("invalid value {value:?} for {field}: {message}")]
    Config {
        /// Field the value came from
        field: String,
        /// The offending value
        value: String,
        /// Description of the problem
        message: String,
    },

    /// Input validation error
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Several independent failures, all reported
    #[error("{message}: {errors}")]
    Aggregate {
        /// Summary of the operation that failed
        message: String,
        /// Every sub-failure, in the order it happened
        errors: ErrorList,
    },

    /// A compensating cleanup failed
    ///
    /// `errors` holds the cleanup failure first, followed by the failure that
    /// triggered the cleanup when there was one.
    #[error("{message}: {errors}")]
    Cleanup {
        /// Summary of the cleanup that failed
        message: String,
        /// Cleanup failure, then the original failure (if any)
        errors: ErrorList,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a sequencing error for an action
    pub fn sequence(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Sequence {
            action: action.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the remote operation and object it concerns
    pub fn remote(
        operation: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::Remote {
            operation: operation.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create a configuration error naming the field and the offending value
    pub fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// The core never retries on its own; this tells the caller whether
    /// re-running the whole action could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Remote { source, .. } => source.is_retryable(),
            Error::Timeout { .. }
            | Error::DeadlineExceeded { .. }
            | Error::NotReady { .. }
            | Error::Internal { .. } => true,
            Error::Aggregate { errors, .. } | Error::Cleanup { errors, .. } => {
                errors.iter().all(Error::is_retryable)
            }
            Error::Sequence { .. }
            | Error::TerminalFailure { .. }
            | Error::Cancelled { .. }
            | Error::ObjectDeleted { .. }
            | Error::Config { .. }
            | Error::Validation { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Check if this error (or the remote call it wraps) is a 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Remote { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Sub-errors of an aggregate or cleanup error
    pub fn sub_errors(&self) -> Option<&ErrorList> {
        match self {
            Error::Aggregate { errors, .. } | Error::Cleanup { errors, .. } => Some(errors),
            _ => None,
        }
    }

    /// The failure that triggered a cleanup, when this is a cleanup error carrying one
    pub fn original_failure(&self) -> Option<&Error> {
        match self {
            Error::Cleanup { errors, .. } if errors.len() > 1 => errors.iter().last(),
            _ => None,
        }
    }
}

/// An ordered collection of independent failures
///
/// Used wherever several cleanup steps run unconditionally and every
/// failure must be reported.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    /// Create an empty list
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Record a failure
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// Record the error side of a result, if any
    pub fn record<T>(&mut self, result: Result<T, Error>) {
        if let Err(e) = result {
            self.0.push(e);
        }
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no failures were recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over recorded failures in order
    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    /// `Ok(())` when empty, otherwise an [`Error::Aggregate`] with the given message
    pub fn into_result(self, message: impl Into<String>) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate {
                message: message.into(),
                errors: self,
            })
        }
    }
}

impl From<Vec<Error>> for ErrorList {
    fn from(errors: Vec<Error>) -> Self {
        Self(errors)
    }
}

impl IntoIterator for ErrorList {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.0[0]),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for (i, e) in self.0.iter().enumerate() {
                    write!(f, " [{}] {}", i + 1, e)?;
                }
                Ok(())
            }
        }
    }
}
