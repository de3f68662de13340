//! Test support for vmfleet controllers.
//!
//! - [`FakeClient`] / [`FakeClientset`]: in-memory object store with a call
//!   log and failure injection
//! - [`FakeRecorder`]: event sink that keeps every event
//! - [`builders`]: fleets, members and instances wired the way the
//!   controllers expect

pub mod builders;
mod json;
mod recorder;
mod store;

pub use json::{apply_json, apply_merge};
pub use recorder::FakeRecorder;
pub use store::{Call, FakeClient, FakeClientset, Verb};
