//! `VirtualMachineInstanceReplicaSet`: a fleet of bare instances.

use serde::{Deserialize, Serialize};

use crate::macros::impl_resource;
use crate::{FleetStatus, InstanceTemplateSpec, LabelSelector, ObjectMeta};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<InstanceTemplateSpec>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
}

impl ReplicaSetSpec {
    /// Desired instance count, 1 when unset.
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceReplicaSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: FleetStatus,
}

impl_resource!(
    VirtualMachineInstanceReplicaSet,
    "vmfleet.io/v1",
    "VirtualMachineInstanceReplicaSet",
    "virtualmachineinstancereplicasets"
);
