use std::sync::Arc;

use tracing::debug;
use vmfleet_api::{
    Condition, Conditions, FleetConditionType, Selector, VirtualMachine, VirtualMachinePool,
};
use vmfleet_reconcile::{Event, StoreError, SyncError};

use super::PoolController;
use crate::reasons::{SUCCESSFUL_PAUSED, SUCCESSFUL_RESUME};

impl PoolController {
    /// Publish counts and conditions for this pass.
    ///
    /// The write is skipped when nothing changed, unless some members are
    /// not ready yet: observers waiting on readiness keep getting updates.
    pub(super) async fn update_status(
        &self,
        pool: &VirtualMachinePool,
        selector: &Selector,
        vms: &[Arc<VirtualMachine>],
        sync_err: Option<&SyncError>,
    ) -> Result<(), StoreError> {
        let mut updated = pool.clone();
        let status = &mut updated.status;
        let failure = FleetConditionType::ReplicaFailure;
        let paused = FleetConditionType::ReplicaPaused;

        status.label_selector = selector.to_string();

        match sync_err {
            Some(err) if !status.conditions.has_condition(&failure) => {
                status.conditions.update_condition(Condition::now(
                    failure,
                    err.reason.clone(),
                    err.message.clone(),
                ));
                self.recorder
                    .record(Event::warning(pool, err.reason.clone(), err.message.clone()));
            }
            None if status.conditions.has_condition(&failure) => {
                status.conditions.remove_condition(&failure);
            }
            _ => {}
        }

        if pool.spec.paused && !status.conditions.has_condition(&paused) {
            status
                .conditions
                .update_condition(Condition::now(paused, "Paused", "Pool controller is paused"));
            self.recorder
                .record(Event::normal(pool, SUCCESSFUL_PAUSED, "Pool is paused"));
        } else if !pool.spec.paused && status.conditions.has_condition(&paused) {
            status.conditions.remove_condition(&paused);
            self.recorder
                .record(Event::normal(pool, SUCCESSFUL_RESUME, "Pool is unpaused"));
        }

        status.replicas = vms.len() as i32;
        status.ready_replicas = vms.iter().filter(|vm| vm.is_ready()).count() as i32;

        if updated.status == pool.status && status_settled(&updated) {
            return Ok(());
        }

        match self.clientset.pools.update_status(&updated).await {
            Ok(_) => {
                debug!(
                    replicas = updated.status.replicas,
                    ready_replicas = updated.status.ready_replicas,
                    "Updated pool status"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn status_settled(pool: &VirtualMachinePool) -> bool {
    pool.status.replicas == pool.status.ready_replicas
}
