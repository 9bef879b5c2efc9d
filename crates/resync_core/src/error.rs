//! Error types for the synchronization core.

use crate::api::{ApiError, ApiResponse};
use crate::consistency::FieldMismatch;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// The phase of a reconciliation step in which a backend call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Acquiring a client handle.
    Acquire,
    /// Reading the current version before an update.
    Fetch,
    /// Submitting a versioned mutation.
    Apply,
    /// Creating a resource.
    Create,
    /// Reading a resource.
    Read,
    /// Deleting a resource.
    Delete,
    /// Reading back after a mutation.
    Verify,
    /// Enumerating all resources of a type.
    List,
    /// Looking a resource up by name.
    Lookup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Acquire => "acquire",
            Phase::Fetch => "fetch",
            Phase::Apply => "apply",
            Phase::Create => "create",
            Phase::Read => "read",
            Phase::Delete => "delete",
            Phase::Verify => "verify",
            Phase::List => "list",
            Phase::Lookup => "lookup",
        };
        f.write_str(name)
    }
}

fn target(resource_type: &str, id: &Option<String>) -> String {
    match id {
        Some(id) => format!("{resource_type} '{id}'"),
        None => resource_type.to_string(),
    }
}

/// Errors surfaced by the synchronization core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A backend call failed during a known phase.
    #[error("{phase} failed for {}: {source}", target(.resource_type, .id))]
    Api {
        /// Phase of the failed call.
        phase: Phase,
        /// Resource type being reconciled.
        resource_type: String,
        /// Resource id, when known.
        id: Option<String>,
        /// Underlying backend error.
        #[source]
        source: ApiError,
    },

    /// Retrying stopped because the deadline elapsed.
    #[error("deadline exceeded after {attempts} attempts ({elapsed:?}): {last}")]
    DeadlineExceeded {
        /// Attempts made.
        attempts: u32,
        /// Time spent.
        elapsed: Duration,
        /// Last retryable error observed.
        last: Box<SyncError>,
    },

    /// Retrying stopped because the attempt budget was spent.
    #[error("exhausted {attempts} attempts: {last}")]
    RetryLimitExceeded {
        /// Attempts made.
        attempts: u32,
        /// Last retryable error observed.
        last: Box<SyncError>,
    },

    /// A resource could not be found.
    #[error("{resource_type} '{key}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Id or name that was looked up.
        key: String,
    },

    /// A deleted resource is still readable.
    #[error("{resource_type} '{id}' still exists")]
    StillExists {
        /// Resource type.
        resource_type: String,
        /// Resource id.
        id: String,
    },

    /// A created resource cannot be read back yet.
    #[error("{resource_type} '{id}' not yet visible")]
    NotYetVisible {
        /// Resource type.
        resource_type: String,
        /// Resource id.
        id: String,
    },

    /// The remote representation does not (yet) reflect the desired state.
    #[error("{} not yet consistent: {mismatch}", target(.resource_type, .id))]
    Mismatch {
        /// Resource type.
        resource_type: String,
        /// Resource id, when known.
        id: Option<String>,
        /// First differing field.
        mismatch: FieldMismatch,
    },

    /// The backend returned something the core cannot work with.
    #[error("invalid response for {resource_type}: {reason}")]
    InvalidResponse {
        /// Resource type.
        resource_type: String,
        /// What was wrong.
        reason: String,
    },

    /// A versioned object was read without a `version` field.
    #[error("resource has no version field")]
    MissingVersion,

    /// A caller supplied payload is unusable.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Building a pool client failed.
    #[error("failed to initialize pool client {slot}: {source}")]
    PoolInit {
        /// Slot whose construction failed.
        slot: usize,
        /// Underlying error.
        #[source]
        source: Box<SyncError>,
    },

    /// Pool prefill did not finish in time.
    #[error("timed out pre-filling client pool: {created}/{capacity} clients after {timeout:?}")]
    PoolInitTimeout {
        /// Clients created before the timeout.
        created: usize,
        /// Requested capacity.
        capacity: usize,
        /// Authorization timeout.
        timeout: Duration,
    },

    /// Pool prefill workers stopped before the pool was full.
    #[error("client pool prefill aborted: {created}/{capacity} clients")]
    PoolInitAborted {
        /// Clients created.
        created: usize,
        /// Requested capacity.
        capacity: usize,
    },

    /// No client became available in time.
    #[error("timeout after {timeout:?} waiting for available client (pool size {capacity})")]
    AcquireTimeout {
        /// Time waited.
        timeout: Duration,
        /// Pool capacity.
        capacity: usize,
    },

    /// The pool was closed.
    #[error("client pool is closed")]
    PoolClosed,

    /// Token acquisition failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Wraps a backend error with the phase and target it belongs to.
    pub fn api(
        phase: Phase,
        resource_type: impl Into<String>,
        id: Option<&str>,
        source: ApiError,
    ) -> Self {
        Self::Api {
            phase,
            resource_type: resource_type.into(),
            id: id.map(str::to_string),
            source,
        }
    }

    /// Returns the backend response metadata, if this error came from a backend call.
    pub fn api_response(&self) -> Option<&ApiResponse> {
        match self {
            SyncError::Api { source, .. } => Some(&source.response),
            _ => None,
        }
    }

    /// Returns the phase, if this error came from a backend call.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            SyncError::Api { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Returns true if the error means "the resource does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound { .. } => true,
            SyncError::Api { source, .. } => source.response.status == 404,
            _ => false,
        }
    }

    /// Returns true if retrying stopped at the deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, SyncError::DeadlineExceeded { .. })
    }

    /// Returns the last retryable error wrapped by a deadline or retry-limit error.
    pub fn last_retryable(&self) -> Option<&SyncError> {
        match self {
            SyncError::DeadlineExceeded { last, .. } | SyncError::RetryLimitExceeded { last, .. } => {
                Some(last)
            }
            _ => None,
        }
    }
}
