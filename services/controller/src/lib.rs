//! # vmfleet-controller
//!
//! Fleet controllers for virtual machines.
//!
//! - [`PoolController`]: keeps `VirtualMachinePool`s at their replica count
//!   with stable, ordinal-named `VirtualMachine` members and rolls them
//!   through template revisions
//! - [`ReplicaSetController`]: keeps a count of bare
//!   `VirtualMachineInstance`s running
//!
//! Both run as queue workers over a shared set of [`Informers`] and are
//! selected by name through the [`ControllerRegistry`].

pub mod config;
pub mod error;
pub mod http;
pub mod informer;
pub mod pool;
pub mod reasons;
pub mod registry;
pub mod replicaset;
pub mod worker;

pub use config::{Config, ConfigError};
pub use error::{MemberError, ValidationError};
pub use http::HttpClient;
pub use informer::{Informers, Reflector};
pub use pool::PoolController;
pub use registry::{Context, Controller, ControllerRegistry, RegistryError};
pub use replicaset::ReplicaSetController;
pub use worker::{run_workers, QueueWorker};
