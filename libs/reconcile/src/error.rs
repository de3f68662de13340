//! Error types for the reconciliation core.

use thiserror::Error;
use vmfleet_api::KeyError;

/// Errors returned by the remote object store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The target object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// An object with this name already exists.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Resource version or patch `test` precondition failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request was rejected as unprocessable.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The store answered with a server-side failure.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The request never reached the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// A body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// NotFound for the object `name` of `kind`.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// The target was already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The store rejected the request as unprocessable.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }

    /// A resource version or patch precondition failed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure to settle ownership of a single candidate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// The adoption precheck refused.
    #[error("can't adopt {key}: {reason}")]
    CannotAdopt { key: String, reason: String },

    /// The adoption patch failed.
    #[error("failed to adopt {key}: {source}")]
    Adopt {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The release patch failed.
    #[error("failed to release {key}: {source}")]
    Release {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// All per-candidate failures from one claim pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", join_errors(.0))]
pub struct AggregateError(pub Vec<ClaimError>);

impl AggregateError {
    /// The individual candidate failures, in claim order.
    pub fn errors(&self) -> &[ClaimError] {
        &self.0
    }
}

fn join_errors(errors: &[ClaimError]) -> String {
    match errors {
        [single] => single.to_string(),
        many => {
            let parts: Vec<String> = many.iter().map(ToString::to_string).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

/// A reconcile failure surfaced on fleet status.
///
/// `reason` doubles as the condition reason and the event reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SyncError {
    pub reason: String,
    pub message: String,
    pub requires_requeue: bool,
}

impl SyncError {
    /// A requeueing error with `reason` and the message of `err`.
    pub fn new(reason: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            reason: reason.into(),
            message: err.to_string(),
            requires_requeue: true,
        }
    }
}

/// Umbrella error returned by one reconcile pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A direct store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ownership could not be settled for at least one candidate.
    #[error("claim failed: {0}")]
    Claim(#[from] AggregateError),

    /// A reconcile step failed and was recorded on status.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A queue key that does not parse as `namespace/name`. Never retried.
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
}

impl ReconcileError {
    /// Whether the queue should retry the key with backoff.
    pub fn requires_requeue(&self) -> bool {
        match self {
            Self::Sync(err) => err.requires_requeue,
            Self::Key(_) => false,
            _ => true,
        }
    }
}
