//! Fleet reconciliation core.
//!
//! This library provides the pieces a fleet controller is assembled from.
//! Key concepts:
//!
//! - **Fleet**: a parent object declaring a replica count and a template.
//! - **Member**: a child object owned by a fleet via a controller owner reference.
//! - **Expectations**: writes issued but not yet observed in the cache.
//! - **Claim**: adopting matching orphans and releasing non-matching children.
//!
//! # Invariants
//!
//! - A key is reconciled by at most one worker at a time
//! - No scale decision is made while expectations for the key are pending
//! - A child has at most one controller owner reference, and it is only
//!   written through a patch the store can reject

mod budget;
mod cache;
mod claim;
mod client;
mod error;
mod events;
mod expectations;
mod fanout;
mod patch;
mod queue;

use std::time::Duration;

pub use budget::{max_unavailable_int, DisruptionBudget};
pub use cache::{Change, Store};
pub use claim::{recheck_deletion_timestamp, CanAdoptFn, CanAdoptFuture, ClaimManager};
pub use client::{Clientset, DeleteOptions, PropagationPolicy, ResourceClient};
pub use error::{AggregateError, ClaimError, ReconcileError, StoreError, SyncError};
pub use events::{Event, EventRecorder, EventType, LogRecorder};
pub use expectations::{ControllerExpectations, UidTrackingExpectations, DEFAULT_EXPECTATIONS_TTL};
pub use fanout::{fan_out, first_error};
pub use patch::{adopt_patch, finalizer_patch, label_patch, release_patch, Patch, PatchOp};
pub use queue::{RateLimiter, WorkQueue, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

/// Default maximum number of creates or deletes issued in one pass.
pub const DEFAULT_BURST_REPLICAS: usize = 250;

/// Delay before re-enqueueing a fleet after a child event.
pub const DEFAULT_ADD_DELAY: Duration = Duration::from_secs(1);

/// Delay before retrying a rollout held back by the disruption budget.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
