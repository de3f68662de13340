//! `VirtualMachine` and `VirtualMachineInstance` kinds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionStatus, Conditions};
use crate::macros::impl_resource;
use crate::ObjectMeta;

/// Ready-condition reason marking an instance whose backing process is
/// shutting down.
pub const TERMINATING_REASON: &str = "PodTerminating";

/// Metadata carried inside an embedded template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDiskSource {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSource {
    pub claim_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVolumeSource {
    pub secret_name: String,
}

/// Backing source of a volume. Exactly one is set on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    ContainerDisk(ContainerDiskSource),
    PersistentVolumeClaim(PersistentVolumeClaimSource),
    DataVolume(DataVolumeSource),
    ConfigMap(ConfigMapVolumeSource),
    Secret(SecretVolumeSource),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

/// Desired shape of a running instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub domain: DomainSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: InstanceSpec,
}

/// Storage provisioning template owned by a VM.
///
/// The provisioning spec is opaque to the controllers; only the name is
/// rewritten per member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default)]
    pub template: InstanceTemplateSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<DataVolumeTemplateSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmConditionType {
    Ready,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition<VmConditionType>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl_resource!(VirtualMachine, "vmfleet.io/v1", "VirtualMachine", "virtualmachines");

impl VirtualMachine {
    /// Returns true if the VM reports a `Ready=True` condition.
    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .has_condition_with_status(&VmConditionType::Ready, ConditionStatus::True)
    }
}

/// Template of a VM as embedded in a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    #[default]
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    /// Succeeded and Failed are terminal; the instance will never run again.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceConditionType {
    Ready,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition<InstanceConditionType>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstance {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl_resource!(
    VirtualMachineInstance,
    "vmfleet.io/v1",
    "VirtualMachineInstance",
    "virtualmachineinstances"
);

impl VirtualMachineInstance {
    pub fn is_final(&self) -> bool {
        self.status.phase.is_final()
    }

    /// Running, not deleting, and `Ready=True`.
    pub fn is_ready(&self) -> bool {
        !self.metadata.is_deleting()
            && self.status.phase == InstancePhase::Running
            && self
                .status
                .conditions
                .has_condition_with_status(&InstanceConditionType::Ready, ConditionStatus::True)
    }

    /// Reports `Ready=True` regardless of phase.
    pub fn has_ready_condition(&self) -> bool {
        self.status
            .conditions
            .has_condition_with_status(&InstanceConditionType::Ready, ConditionStatus::True)
    }

    /// Not ready because the backing process is terminating.
    pub fn is_terminating(&self) -> bool {
        self.status.conditions.has_condition_with_reason(
            &InstanceConditionType::Ready,
            ConditionStatus::False,
            TERMINATING_REASON,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_volume_source_is_flattened() {
        let volume = Volume {
            name: "disk".into(),
            source: VolumeSource::DataVolume(DataVolumeSource { name: "dv-0".into() }),
        };
        let json = serde_json::to_value(&volume).unwrap();
        assert_eq!(json, json!({"name": "disk", "dataVolume": {"name": "dv-0"}}));

        let back: Volume = serde_json::from_value(json!({
            "name": "cfg",
            "configMap": {"name": "settings"}
        }))
        .unwrap();
        assert_eq!(
            back.source,
            VolumeSource::ConfigMap(ConfigMapVolumeSource { name: "settings".into() })
        );
    }

    #[test]
    fn test_instance_readiness() {
        let mut vmi = VirtualMachineInstance::default();
        assert!(!vmi.is_ready());

        vmi.status.phase = InstancePhase::Running;
        vmi.status
            .conditions
            .push(Condition::now(InstanceConditionType::Ready, "", ""));
        assert!(vmi.is_ready());

        vmi.metadata.deletion_timestamp = Some(chrono::Utc::now());
        assert!(!vmi.is_ready());
        assert!(vmi.has_ready_condition());
    }

    #[test]
    fn test_terminating_condition() {
        let mut vmi = VirtualMachineInstance::default();
        vmi.status.conditions.push(Condition {
            type_: InstanceConditionType::Ready,
            status: ConditionStatus::False,
            reason: TERMINATING_REASON.into(),
            message: String::new(),
            last_transition_time: None,
        });
        assert!(vmi.is_terminating());
        assert!(!vmi.is_final());
    }

    #[test]
    fn test_final_phases() {
        assert!(InstancePhase::Succeeded.is_final());
        assert!(InstancePhase::Failed.is_final());
        assert!(!InstancePhase::Unknown.is_final());
        assert!(!InstancePhase::Running.is_final());
    }
}
