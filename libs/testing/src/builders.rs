//! Object builders for controller tests.

use std::collections::BTreeMap;

use vmfleet_api::{
    Condition, ContainerDiskSource, InstanceConditionType, InstancePhase, InstanceSpec,
    InstanceTemplateSpec, LabelSelector, ObjectMeta, OwnerReference, PoolSpec, ReplicaSetSpec,
    Resource, TemplateMeta, Uid, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceReplicaSet, VirtualMachinePool, VirtualMachineSpec,
    VirtualMachineTemplateSpec, VmConditionType, Volume, VolumeSource,
};

/// Namespace every builder uses.
pub const NAMESPACE: &str = "default";

/// Label map from `(key, value)` pairs.
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn instance_template(app: &str) -> InstanceTemplateSpec {
    InstanceTemplateSpec {
        metadata: TemplateMeta {
            labels: labels(&[("app", app)]),
            ..Default::default()
        },
        spec: InstanceSpec {
            volumes: vec![Volume {
                name: "root".into(),
                source: VolumeSource::ContainerDisk(ContainerDiskSource {
                    image: "registry.local/fedora:40".into(),
                }),
            }],
            ..Default::default()
        },
    }
}

/// Pool `name` selecting `app=<name>`, with a matching template.
pub fn pool(name: &str, replicas: i32) -> VirtualMachinePool {
    let mut metadata = ObjectMeta::named(NAMESPACE, name);
    metadata.uid = Uid::from(format!("pool-uid-{name}"));
    metadata.generation = 1;
    VirtualMachinePool {
        metadata,
        spec: PoolSpec {
            replicas: Some(replicas),
            selector: Some(LabelSelector::from_labels([("app", name)])),
            virtual_machine_template: VirtualMachineTemplateSpec {
                metadata: TemplateMeta {
                    labels: labels(&[("app", name)]),
                    ..Default::default()
                },
                spec: VirtualMachineSpec {
                    running: Some(true),
                    template: instance_template(name),
                    data_volume_templates: Vec::new(),
                },
            },
            ..Default::default()
        },
        status: Default::default(),
    }
}

/// Replica set `name` selecting `app=<name>`.
pub fn replicaset(name: &str, replicas: i32) -> VirtualMachineInstanceReplicaSet {
    let mut metadata = ObjectMeta::named(NAMESPACE, name);
    metadata.uid = Uid::from(format!("rs-uid-{name}"));
    VirtualMachineInstanceReplicaSet {
        metadata,
        spec: ReplicaSetSpec {
            replicas: Some(replicas),
            selector: Some(LabelSelector::from_labels([("app", name)])),
            template: Some(instance_template(name)),
            paused: false,
        },
        status: Default::default(),
    }
}

/// Unowned VM carrying `labels`.
pub fn orphan_vm(name: &str, vm_labels: BTreeMap<String, String>) -> VirtualMachine {
    let mut metadata = ObjectMeta::named(NAMESPACE, name);
    metadata.labels = vm_labels;
    VirtualMachine {
        metadata,
        ..Default::default()
    }
}

/// Attach a controller reference to `owner`.
pub fn owned_by<K: Resource, P: Resource>(mut obj: K, owner: &P) -> K {
    obj.meta_mut()
        .owner_references
        .push(OwnerReference::controller_for(owner));
    obj
}

/// Mark a VM `Ready=True`.
pub fn ready_vm(mut vm: VirtualMachine) -> VirtualMachine {
    vm.status
        .conditions
        .push(Condition::now(VmConditionType::Ready, "", ""));
    vm
}

/// Running, ready instance for `vm`, inheriting its template labels.
pub fn running_vmi_for(vm: &VirtualMachine) -> VirtualMachineInstance {
    let mut metadata = ObjectMeta::named(&vm.metadata.namespace, &vm.metadata.name);
    metadata.labels = vm.spec.template.metadata.labels.clone();
    metadata.owner_references.push(OwnerReference::controller_for(vm));
    let mut vmi = VirtualMachineInstance {
        metadata,
        spec: vm.spec.template.spec.clone(),
        ..Default::default()
    };
    vmi.status.phase = InstancePhase::Running;
    vmi.status
        .conditions
        .push(Condition::now(InstanceConditionType::Ready, "", ""));
    vmi
}

/// Bare instance with `labels` and `phase`.
pub fn vmi(
    name: &str,
    vmi_labels: BTreeMap<String, String>,
    phase: InstancePhase,
) -> VirtualMachineInstance {
    let mut metadata = ObjectMeta::named(NAMESPACE, name);
    metadata.labels = vmi_labels;
    let mut vmi = VirtualMachineInstance {
        metadata,
        ..Default::default()
    };
    vmi.status.phase = phase;
    if phase == InstancePhase::Running {
        vmi.status
            .conditions
            .push(Condition::now(InstanceConditionType::Ready, "", ""));
    }
    vmi
}
