use std::{path::PathBuf, time::Duration};

use crate::recurrence::RecurrenceError;

/// Errors raised while loading or validating a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {format} manifest: {message}")]
    Parse { format: &'static str, message: String },

    #[error("unsupported manifest format: .{0}")]
    UnsupportedFormat(String),

    #[error("invalid route pattern {path}: {reason}")]
    InvalidPattern { path: String, reason: String },

    #[error("route {path} duplicates {existing} (identical after parameter-name erasure)")]
    DuplicateRoute { path: String, existing: String },

    #[error("route {path}: invalid method {method}")]
    InvalidMethod { path: String, method: String },

    #[error("duplicate {kind} name {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("queue {name}: FIFO queues must end with .fifo and standard queues must not")]
    FifoSuffix { name: String },

    #[error("{kind} {name}: timeout {timeout:?} exceeds the {max:?} ceiling")]
    TimeoutTooLong {
        kind: &'static str,
        name: String,
        timeout: Duration,
        max: Duration,
    },

    #[error("{kind} {name}: timeout must be greater than zero")]
    ZeroTimeout { kind: &'static str, name: String },

    #[error("schedule {name}: {source}")]
    InvalidSchedule {
        name: String,
        #[source]
        source: RecurrenceError,
    },

    #[error("schedule {name}: timeout {timeout:?} exceeds the {interval:?} between firings")]
    TimeoutExceedsInterval {
        name: String,
        timeout: Duration,
        interval: Duration,
    },

    #[error("{kind} {name}: handler identifier must not be empty")]
    EmptyHandler { kind: &'static str, name: String },
}
