//! Per-member rendering of the pool's VM template.

use std::collections::HashMap;

use vmfleet_api::{
    ObjectMeta, OwnerReference, PoolSpec, VirtualMachine, VirtualMachinePool,
    VirtualMachineSpec, VolumeSource, POOL_FINALIZER, POOL_REVISION_LABEL,
};

/// Name of the revision snapshotting `pool` at its current generation.
pub fn revision_name(pool: &VirtualMachinePool) -> String {
    format!("{}-{}", pool.metadata.name, pool.metadata.generation)
}

/// Name of the member at `ordinal`, e.g. `web-3`.
pub fn member_name(pool_name: &str, ordinal: usize) -> String {
    format!("{pool_name}-{ordinal}")
}

/// Ordinal encoded in the last `-` separated segment of a member name.
pub fn ordinal_from_name(name: &str) -> Option<usize> {
    name.rsplit('-').next()?.parse().ok()
}

/// The template's VM spec with storage and config references made unique
/// to the member at `ordinal`.
///
/// Data volume templates get an `-<ordinal>` suffix and every volume that
/// pointed at one of them follows the rename. Config map and secret
/// references are suffixed only when the pool asks for it.
pub fn index_vm_spec(spec: &PoolSpec, ordinal: usize) -> VirtualMachineSpec {
    let mut vm_spec = spec.virtual_machine_template.spec.clone();

    let mut renamed = HashMap::new();
    for dv in &mut vm_spec.data_volume_templates {
        let indexed = format!("{}-{ordinal}", dv.metadata.name);
        let original = std::mem::replace(&mut dv.metadata.name, indexed.clone());
        renamed.insert(original, indexed);
    }

    let append_config_maps = spec.append_index_to_config_map_refs();
    let append_secrets = spec.append_index_to_secret_refs();
    for volume in &mut vm_spec.template.spec.volumes {
        match &mut volume.source {
            VolumeSource::PersistentVolumeClaim(pvc) => {
                if let Some(name) = renamed.get(&pvc.claim_name) {
                    pvc.claim_name = name.clone();
                }
            }
            VolumeSource::DataVolume(dv) => {
                if let Some(name) = renamed.get(&dv.name) {
                    dv.name = name.clone();
                }
            }
            VolumeSource::ConfigMap(cm) if append_config_maps => {
                cm.name = format!("{}-{ordinal}", cm.name);
            }
            VolumeSource::Secret(secret) if append_secrets => {
                secret.secret_name = format!("{}-{ordinal}", secret.secret_name);
            }
            _ => {}
        }
    }

    vm_spec
}

/// Stamp `revision` on the VM and on its instance template, so the
/// instance it starts carries the label too.
pub fn inject_revision_labels(vm: &mut VirtualMachine, revision: &str) {
    vm.metadata
        .labels
        .insert(POOL_REVISION_LABEL.to_string(), revision.to_string());
    vm.spec
        .template
        .metadata
        .labels
        .insert(POOL_REVISION_LABEL.to_string(), revision.to_string());
}

/// A new member VM for `pool`, built from the current template.
pub fn new_member(
    pool: &VirtualMachinePool,
    name: &str,
    ordinal: usize,
    revision: &str,
) -> VirtualMachine {
    let template = &pool.spec.virtual_machine_template;

    let mut metadata = ObjectMeta::named(&pool.metadata.namespace, name);
    metadata.labels = template.metadata.labels.clone();
    metadata.annotations = template.metadata.annotations.clone();
    metadata.finalizers = vec![POOL_FINALIZER.to_string()];
    metadata.owner_references = vec![OwnerReference::controller_for(pool)];

    let mut vm = VirtualMachine {
        metadata,
        spec: index_vm_spec(&pool.spec, ordinal),
        ..Default::default()
    };
    inject_revision_labels(&mut vm, revision);
    vm
}
