use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};
use vmfleet_api::{
    Resource, VirtualMachine, VirtualMachineInstance, VirtualMachinePool, POOL_REVISION_LABEL,
};
use vmfleet_reconcile::{
    fan_out, first_error, label_patch, max_unavailable_int, DeleteOptions, DisruptionBudget,
    Event, SyncError, DEFAULT_RETRY_DELAY,
};

use super::template::{index_vm_spec, inject_revision_labels, ordinal_from_name};
use super::PoolController;
use crate::error::MemberError;
use crate::reasons::{FAILED_UPDATE, SUCCESSFUL_UPDATE};

/// What it takes to bring a running instance to its VM's revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    None,
    /// Same template content under a new revision name.
    PatchRevisionLabel,
    /// The instance template changed; a new instance picks it up.
    Restart,
    /// Storage templates changed; the VM itself has to be recreated.
    VmDelete,
}

impl UpdateType {
    /// Whether the update takes the member out of service.
    pub fn is_disruptive(self) -> bool {
        matches!(self, Self::Restart | Self::VmDelete)
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::PatchRevisionLabel => "label-patch",
            Self::Restart => "restart",
            Self::VmDelete => "vm-delete",
        };
        f.write_str(s)
    }
}

impl PoolController {
    /// Roll members towards the current template. Returns true when no
    /// VM was outdated.
    pub(super) async fn update(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<bool, SyncError> {
        let mut outdated = Vec::new();
        let mut current = Vec::new();
        for vm in vms.iter().filter(|vm| !vm.metadata.is_deleting()) {
            let is_outdated = self.is_outdated_vm(pool, vm).map_err(|e| {
                SyncError::new(FAILED_UPDATE, format!("error detecting outdated VMs: {e}"))
            })?;
            if is_outdated {
                outdated.push(Arc::clone(vm));
            } else {
                current.push(Arc::clone(vm));
            }
        }

        self.opportunistic_update(pool, &outdated)
            .await
            .map_err(|e| SyncError::new(FAILED_UPDATE, format!("error during VM update: {e}")))?;
        self.proactive_update(pool, &current)
            .await
            .map_err(|e| SyncError::new(FAILED_UPDATE, format!("error during VMI update: {e}")))?;

        Ok(outdated.is_empty())
    }

    /// A VM is outdated when it carries no revision, an unknown one, or one
    /// whose VM template differs from the pool's.
    pub(super) fn is_outdated_vm(
        &self,
        pool: &VirtualMachinePool,
        vm: &VirtualMachine,
    ) -> Result<bool, MemberError> {
        let Some(name) = vm.metadata.labels.get(POOL_REVISION_LABEL) else {
            return Ok(true);
        };
        match self.revision_spec(&vm.metadata.namespace, name)? {
            Some(spec) => Ok(spec.virtual_machine_template != pool.spec.virtual_machine_template),
            None => Ok(true),
        }
    }

    /// Compare the revision the instance runs against the one its VM wants.
    pub(super) fn classify_update(
        &self,
        vm: &VirtualMachine,
        vmi: &VirtualMachineInstance,
    ) -> Result<UpdateType, MemberError> {
        let namespace = &vm.metadata.namespace;
        let Some(wanted) = vm.metadata.labels.get(POOL_REVISION_LABEL) else {
            return Ok(UpdateType::None);
        };
        let Some(running) = vmi.metadata.labels.get(POOL_REVISION_LABEL) else {
            return Ok(UpdateType::Restart);
        };
        if wanted == running {
            return Ok(UpdateType::None);
        }

        let Some(wanted) = self.revision_spec(namespace, wanted)? else {
            return Ok(UpdateType::None);
        };
        let Some(running) = self.revision_spec(namespace, running)? else {
            return Ok(UpdateType::Restart);
        };

        let wanted = &wanted.virtual_machine_template.spec;
        let running = &running.virtual_machine_template.spec;
        if wanted.data_volume_templates != running.data_volume_templates {
            Ok(UpdateType::VmDelete)
        } else if wanted.template != running.template {
            Ok(UpdateType::Restart)
        } else {
            Ok(UpdateType::PatchRevisionLabel)
        }
    }

    async fn opportunistic_update(
        &self,
        pool: &VirtualMachinePool,
        outdated: &[Arc<VirtualMachine>],
    ) -> Result<(), MemberError> {
        if outdated.is_empty() {
            return Ok(());
        }

        let revision = self.ensure_revision(pool).await?;
        info!(pool = %pool.key(), count = outdated.len(), revision = %revision, "Updating outdated VMs");

        let revision = revision.as_str();
        let results = fan_out(outdated.iter().cloned(), self.burst_replicas, move |vm| {
            self.update_member(pool, revision, vm)
        })
        .await;

        match first_error(results, "update") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn update_member(
        &self,
        pool: &VirtualMachinePool,
        revision: &str,
        vm: Arc<VirtualMachine>,
    ) -> Result<(), MemberError> {
        let ordinal = ordinal_from_name(&vm.metadata.name)
            .ok_or_else(|| MemberError::Ordinal(vm.metadata.name.clone()))?;
        let template = &pool.spec.virtual_machine_template;

        let mut updated = (*vm).clone();
        updated.metadata.labels = template.metadata.labels.clone();
        updated.metadata.annotations = template.metadata.annotations.clone();
        updated.spec = index_vm_spec(&pool.spec, ordinal);
        inject_revision_labels(&mut updated, revision);

        match self.clientset.vms.update(&updated).await {
            Ok(_) => {
                debug!(vm = %vm.key(), revision, "Updated VM");
                self.recorder.record(Event::normal(
                    pool,
                    SUCCESSFUL_UPDATE,
                    format!("Updated VM {}", vm.key()),
                ));
                Ok(())
            }
            Err(err) => {
                error!(vm = %vm.key(), error = %err, "Failed to update VM");
                self.recorder.record(Event::warning(
                    pool,
                    FAILED_UPDATE,
                    format!("Error updating VM {}: {err}", vm.key()),
                ));
                Err(err.into())
            }
        }
    }

    /// Push the VM's revision to running instances, spending the disruption
    /// budget only on restarts and VM deletions.
    async fn proactive_update(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<(), MemberError> {
        let key = pool.key();
        let handled = self.roll_unhealthy_instances(pool, vms).await?;

        let max_unavailable = max_unavailable_int(
            pool.spec.max_unavailable.as_ref(),
            pool.spec.desired_replicas(),
        )?;
        let mut budget = DisruptionBudget::new(max_unavailable, self.unavailable_count(vms));

        for vm in vms.iter().filter(|vm| !handled.contains(&vm.key())) {
            let Some(vmi) = self.vmis.get(&vm.metadata.namespace, &vm.metadata.name) else {
                continue;
            };
            if vmi.metadata.is_deleting() {
                continue;
            }

            let update = self.classify_update(vm, &vmi)?;
            if update == UpdateType::None {
                continue;
            }
            if update.is_disruptive() && !budget.try_take() {
                debug!(pool = %key, max_unavailable, "Disruption budget exhausted, delaying update");
                self.queue.add_after(&key, DEFAULT_RETRY_DELAY);
                return Ok(());
            }
            self.apply_update(pool, vm, &vmi, update).await?;
        }
        Ok(())
    }

    /// Instances that are present but not ready cost nothing to disrupt.
    /// Returns the keys of the VMs that were handled here.
    async fn roll_unhealthy_instances(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<HashSet<String>, MemberError> {
        let mut handled = HashSet::new();
        for vm in vms.iter().filter(|vm| !vm.is_ready()) {
            let Some(vmi) = self.vmis.get(&vm.metadata.namespace, &vm.metadata.name) else {
                continue;
            };
            if vmi.metadata.is_deleting() {
                continue;
            }
            let update = self.classify_update(vm, &vmi)?;
            if update == UpdateType::None {
                continue;
            }
            self.apply_update(pool, vm, &vmi, update).await?;
            handled.insert(vm.key());
        }
        Ok(handled)
    }

    /// VMs with no instance, or one that is not ready.
    fn unavailable_count(&self, vms: &[Arc<VirtualMachine>]) -> i32 {
        vms.iter()
            .filter(|vm| {
                self.vmis
                    .get(&vm.metadata.namespace, &vm.metadata.name)
                    .is_none_or(|vmi| !vmi.is_ready())
            })
            .count() as i32
    }

    async fn apply_update(
        &self,
        pool: &VirtualMachinePool,
        vm: &VirtualMachine,
        vmi: &VirtualMachineInstance,
        update: UpdateType,
    ) -> Result<(), MemberError> {
        let namespace = &vm.metadata.namespace;
        info!(vm = %vm.key(), update = %update, "Applying proactive update");

        let result = match update {
            UpdateType::None => return Ok(()),
            UpdateType::Restart => {
                self.clientset
                    .vmis
                    .delete(namespace, &vmi.metadata.name, &DeleteOptions::default())
                    .await
            }
            UpdateType::VmDelete => {
                self.clientset
                    .vms
                    .delete(namespace, &vm.metadata.name, &DeleteOptions::foreground())
                    .await
            }
            UpdateType::PatchRevisionLabel => {
                let Some(revision) = vm.metadata.labels.get(POOL_REVISION_LABEL) else {
                    return Ok(());
                };
                let mut labels = vmi.metadata.labels.clone();
                labels.insert(POOL_REVISION_LABEL.to_string(), revision.clone());
                self.clientset
                    .vmis
                    .patch(
                        namespace,
                        &vmi.metadata.name,
                        &label_patch(&vmi.metadata.labels, &labels),
                    )
                    .await
                    .map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                self.recorder.record(Event::normal(
                    pool,
                    SUCCESSFUL_UPDATE,
                    format!("Applied {update} update to {}", vm.key()),
                ));
                Ok(())
            }
            Err(err) => {
                self.recorder.record(Event::warning(
                    pool,
                    FAILED_UPDATE,
                    format!("Error applying {update} update to {}: {err}", vm.key()),
                ));
                Err(err.into())
            }
        }
    }
}
