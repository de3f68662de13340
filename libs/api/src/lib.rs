//! # vmfleet-api
//!
//! Object model shared by the vmfleet controllers.
//!
//! ## Design Principles
//!
//! - Objects mirror the wire shape of a Kubernetes-style API server
//!   (camelCase JSON, `metadata` / `spec` / `status`)
//! - Every kind is reachable through the [`Resource`] trait so the
//!   reconciliation core can stay generic over the child type
//! - Ownership is expressed only through [`OwnerReference`]s; there is no
//!   other registry of parent/child bindings
//!
//! ## Kinds
//!
//! - [`VirtualMachinePool`]: fleet of [`VirtualMachine`] members
//! - [`VirtualMachineInstanceReplicaSet`]: fleet of [`VirtualMachineInstance`]s
//! - [`ControllerRevision`]: immutable snapshot of a pool spec

mod condition;
mod error;
mod intstr;
mod macros;
mod meta;
mod pool;
mod replicaset;
mod revision;
mod selector;
mod vm;

pub use condition::{Condition, ConditionStatus, Conditions};
pub use error::{KeyError, SelectorError};
pub use intstr::IntOrPercent;
pub use meta::{
    controller_of, namespaced_key, split_key, ObjectMeta, OwnerReference, Resource, Uid,
};
pub use pool::{
    BasePolicy, FleetConditionType, FleetStatus, NameGeneration, PoolSpec, ProactiveScaleIn,
    ScaleInStrategy, SelectionPolicy, VirtualMachinePool, POOL_FINALIZER,
    POOL_REVISION_LABEL,
};
pub use replicaset::{ReplicaSetSpec, VirtualMachineInstanceReplicaSet};
pub use revision::ControllerRevision;
pub use selector::{LabelSelector, LabelSelectorRequirement, Selector, SelectorOperator};
pub use vm::{
    ConfigMapVolumeSource, ContainerDiskSource, DataVolumeSource, DataVolumeTemplateSpec,
    DomainSpec, InstanceConditionType, InstancePhase, InstanceSpec, InstanceStatus,
    InstanceTemplateSpec, PersistentVolumeClaimSource, SecretVolumeSource, TemplateMeta,
    VirtualMachine, VirtualMachineInstance, VirtualMachineSpec, VirtualMachineStatus,
    VirtualMachineTemplateSpec, VmConditionType, Volume, VolumeSource, TERMINATING_REASON,
};
