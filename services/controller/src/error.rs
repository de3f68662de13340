use std::num::ParseIntError;

use thiserror::Error;
use vmfleet_api::SelectorError;
use vmfleet_reconcile::StoreError;

/// Why a fleet object is not reconciled at all.
///
/// These never requeue: the object has to change before another pass can
/// succeed, and that change enqueues it again.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("selector is missing")]
    MissingSelector,

    #[error("template is missing")]
    MissingTemplate,

    #[error("template has no labels")]
    EmptyTemplateLabels,

    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("selector {selector} does not match template labels")]
    TemplateMismatch { selector: String },
}

/// Failure of a single member operation inside a pool pass.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot derive an ordinal from VM name {0:?}")]
    Ordinal(String),

    #[error("revision {name} is unreadable: {source}")]
    Revision {
        name: String,
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid maxUnavailable: {0}")]
    MaxUnavailable(#[from] ParseIntError),
}
