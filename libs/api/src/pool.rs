//! `VirtualMachinePool`: a fleet of VMs built from one template.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::macros::impl_resource;
use crate::{IntOrPercent, LabelSelector, ObjectMeta, VirtualMachineTemplateSpec};

/// Finalizer the pool controller places on pools and their VMs.
pub const POOL_FINALIZER: &str = "pool.vmfleet.io/finalizer";

/// Label holding the name of the revision a VM (and its instance) was built from.
pub const POOL_REVISION_LABEL: &str = "pool.vmfleet.io/revision-name";

/// Order in which VMs are picked during scale-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasePolicy {
    #[default]
    Random,
    DescendingOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_policy: Option<BasePolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProactiveScaleIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_policy: Option<SelectionPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleInStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proactive: Option<ProactiveScaleIn>,
}

/// Per-member naming of referenced config maps and secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameGeneration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_index_to_config_map_refs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_index_to_secret_refs: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default)]
    pub virtual_machine_template: VirtualMachineTemplateSpec,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_in_strategy: Option<ScaleInStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_generation: Option<NameGeneration>,
}

impl PoolSpec {
    /// Desired member count; an unset count means one.
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Scale-in selection policy, `Random` when unset.
    pub fn base_policy(&self) -> BasePolicy {
        self.scale_in_strategy
            .as_ref()
            .and_then(|s| s.proactive.as_ref())
            .and_then(|p| p.selection_policy.as_ref())
            .and_then(|s| s.base_policy)
            .unwrap_or_default()
    }

    /// Whether config-map volume references get the member ordinal.
    pub fn append_index_to_config_map_refs(&self) -> bool {
        self.name_generation
            .as_ref()
            .and_then(|n| n.append_index_to_config_map_refs)
            .unwrap_or(false)
    }

    /// Whether secret volume references get the member ordinal.
    pub fn append_index_to_secret_refs(&self) -> bool {
        self.name_generation
            .as_ref()
            .and_then(|n| n.append_index_to_secret_refs)
            .unwrap_or(false)
    }
}

/// Condition types published on fleet status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FleetConditionType {
    ReplicaFailure,
    ReplicaPaused,
}

/// Observed state shared by pools and replica sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition<FleetConditionType>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachinePool {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PoolSpec,
    #[serde(default)]
    pub status: FleetStatus,
}

impl_resource!(
    VirtualMachinePool,
    "pool.vmfleet.io/v1alpha1",
    "VirtualMachinePool",
    "virtualmachinepools"
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let spec = PoolSpec::default();
        assert_eq!(spec.desired_replicas(), 1);
        assert_eq!(spec.base_policy(), BasePolicy::Random);
        assert!(!spec.append_index_to_config_map_refs());
        assert!(!spec.append_index_to_secret_refs());
    }

    #[test]
    fn test_deserialize_pool() {
        let pool: VirtualMachinePool = serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "default", "uid": "p1", "generation": 2},
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "web"}},
                "maxUnavailable": "25%",
                "scaleInStrategy": {
                    "proactive": {"selectionPolicy": {"basePolicy": "DescendingOrder"}}
                },
                "nameGeneration": {"appendIndexToSecretRefs": true},
                "virtualMachineTemplate": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"template": {"spec": {"domain": {"cpu": 2}}}}
                }
            }
        }))
        .unwrap();

        assert_eq!(pool.spec.desired_replicas(), 3);
        assert_eq!(pool.spec.base_policy(), BasePolicy::DescendingOrder);
        assert_eq!(
            pool.spec.max_unavailable,
            Some(IntOrPercent::Percent("25%".into()))
        );
        assert!(pool.spec.append_index_to_secret_refs());
        assert_eq!(
            pool.spec.virtual_machine_template.spec.template.spec.domain.cpu,
            Some(2)
        );
        assert_eq!(pool.metadata.generation, 2);
    }
}
