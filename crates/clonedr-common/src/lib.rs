//! Common building blocks for clonedr: errors, readiness waits, compensating
//! cleanup, naming, storage quantities and telemetry

#![deny(missing_docs)]

pub mod cleanup;
pub mod error;
pub mod kube_utils;
pub mod names;
pub mod quantity;
pub mod telemetry;
pub mod wait;

pub use cleanup::CleanupTask;
pub use error::{Error, ErrorList};
pub use wait::{check_cancelled, Readiness, ReadinessWait, WaitOptions};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every object clonedr writes
pub const FIELD_MANAGER: &str = "clonedr";
