use std::cmp::Reverse;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, error, info};
use vmfleet_api::{BasePolicy, Resource, VirtualMachine, VirtualMachinePool};
use vmfleet_reconcile::{fan_out, first_error, DeleteOptions, Event, StoreError, SyncError};

use super::template::{member_name, new_member, ordinal_from_name};
use super::PoolController;
use crate::error::MemberError;
use crate::reasons::{
    FAILED_CREATE, FAILED_DELETE, FAILED_SCALE_IN, FAILED_SCALE_OUT, SUCCESSFUL_CREATE,
    SUCCESSFUL_DELETE,
};

impl PoolController {
    /// Move the member count towards the desired count by at most one
    /// burst. Returns true when there was nothing to scale.
    pub(super) async fn scale(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<bool, SyncError> {
        let diff = vms.len() as i64 - i64::from(pool.spec.desired_replicas());

        if diff == 0 {
            self.strip_deleting_members(vms).await.map_err(|e| {
                SyncError::new(
                    FAILED_SCALE_IN,
                    format!("error during opportunistic scale in: {e}"),
                )
            })?;
            return Ok(true);
        }

        let count = (diff.unsigned_abs() as usize).min(self.burst_replicas);
        if diff < 0 {
            self.scale_out(pool, count).await.map_err(|e| {
                SyncError::new(FAILED_SCALE_OUT, format!("error during scale out: {e}"))
            })?;
        } else {
            self.scale_in(pool, vms, count).await.map_err(|e| {
                SyncError::new(FAILED_SCALE_IN, format!("error during scale in: {e}"))
            })?;
        }
        Ok(false)
    }

    /// Members already marked for deletion only wait on our finalizer.
    async fn strip_deleting_members(&self, vms: &[Arc<VirtualMachine>]) -> Result<(), StoreError> {
        for vm in vms.iter().filter(|vm| vm.metadata.is_deleting()) {
            self.remove_member_finalizer(vm).await?;
        }
        Ok(())
    }

    /// Free names for `count` new members, filling ordinal gaps first.
    fn new_member_names(&self, pool: &VirtualMachinePool, count: usize) -> Vec<(usize, String)> {
        let mut names = Vec::with_capacity(count);
        let mut ordinal = 0;
        while names.len() < count {
            let name = member_name(&pool.metadata.name, ordinal);
            if self.vms.get(&pool.metadata.namespace, &name).is_none() {
                names.push((ordinal, name));
            }
            ordinal += 1;
        }
        names
    }

    async fn scale_out(&self, pool: &VirtualMachinePool, count: usize) -> Result<(), MemberError> {
        let names = self.new_member_names(pool, count);
        let revision = self.ensure_revision(pool).await?;
        let key = pool.key();

        info!(pool = %key, count = names.len(), "Adding VMs to pool");
        self.expectations
            .raise_expectations(&key, names.len() as i64, 0);

        let revision = revision.as_str();
        let pool_key = key.as_str();
        let results = fan_out(names, self.burst_replicas, move |(ordinal, name)| {
            self.create_member(pool, pool_key, revision, ordinal, name)
        })
        .await;

        match first_error(results, "create") {
            Some(err) => {
                self.recorder.record(Event::warning(
                    pool,
                    FAILED_CREATE,
                    format!("Error creating VM: {err}"),
                ));
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn create_member(
        &self,
        pool: &VirtualMachinePool,
        pool_key: &str,
        revision: &str,
        ordinal: usize,
        name: String,
    ) -> Result<(), MemberError> {
        let vm = new_member(pool, &name, ordinal, revision);
        match self.clientset.vms.create(&vm).await {
            Ok(created) => {
                debug!(pool = %pool_key, vm = %created.key(), "Created VM");
                self.recorder.record(Event::normal(
                    pool,
                    SUCCESSFUL_CREATE,
                    format!("Created VM {}", created.key()),
                ));
                Ok(())
            }
            Err(err) => {
                self.expectations.creation_observed(pool_key);
                error!(pool = %pool_key, vm = %name, error = %err, "Failed to create VM");
                Err(err.into())
            }
        }
    }

    async fn scale_in(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
        count: usize,
    ) -> Result<(), MemberError> {
        // Members already deleting count towards the removal but only need
        // their finalizer gone.
        self.strip_deleting_members(vms).await?;

        let mut eligible: Vec<Arc<VirtualMachine>> = vms
            .iter()
            .filter(|vm| !vm.metadata.is_deleting())
            .cloned()
            .collect();
        let deleting = vms.len() - eligible.len();
        let count = count.saturating_sub(deleting).min(eligible.len());
        if count == 0 {
            return Ok(());
        }

        sort_for_scale_in(&mut eligible, pool.spec.base_policy());
        eligible.truncate(count);

        let key = pool.key();
        info!(pool = %key, count, "Removing VMs from pool");
        let child_keys: Vec<String> = eligible.iter().map(|vm| vm.key()).collect();
        self.expectations.expect_deletions(&key, &child_keys);

        let pool_key = key.as_str();
        let results = fan_out(eligible, self.burst_replicas, move |vm| {
            self.delete_member(pool, pool_key, vm)
        })
        .await;

        match first_error(results, "delete") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_member(
        &self,
        pool: &VirtualMachinePool,
        pool_key: &str,
        vm: Arc<VirtualMachine>,
    ) -> Result<(), MemberError> {
        let vm_key = vm.key();

        if let Err(err) = self.remove_member_finalizer(&vm).await {
            self.expectations.deletion_observed(pool_key, &vm_key);
            error!(pool = %pool_key, vm = %vm_key, error = %err, "Failed to remove VM finalizer");
            return Err(err.into());
        }

        match self
            .clientset
            .vms
            .delete(
                &vm.metadata.namespace,
                &vm.metadata.name,
                &DeleteOptions::foreground(),
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                self.expectations.deletion_observed(pool_key, &vm_key);
                self.recorder.record(Event::warning(
                    pool,
                    FAILED_DELETE,
                    format!("Error deleting VM {vm_key}: {err}"),
                ));
                return Err(err.into());
            }
        }

        debug!(pool = %pool_key, vm = %vm_key, "Deleted VM");
        self.recorder.record(Event::normal(
            pool,
            SUCCESSFUL_DELETE,
            format!(
                "Deleted VM {vm_key} with uid {} from pool",
                vm.metadata.uid
            ),
        ));
        Ok(())
    }
}

/// Order scale-in candidates; the front of the slice goes first.
fn sort_for_scale_in(vms: &mut [Arc<VirtualMachine>], policy: BasePolicy) {
    match policy {
        BasePolicy::Random => vms.shuffle(&mut rand::rng()),
        BasePolicy::DescendingOrder => vms.sort_by_key(|vm| {
            Reverse(ordinal_from_name(&vm.metadata.name).unwrap_or(0))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vmfleet_testing::builders::{labels, orphan_vm};

    fn members(names: &[&str]) -> Vec<Arc<VirtualMachine>> {
        names
            .iter()
            .map(|n| Arc::new(orphan_vm(n, labels(&[]))))
            .collect()
    }

    fn names(vms: &[Arc<VirtualMachine>]) -> Vec<&str> {
        vms.iter().map(|vm| vm.metadata.name.as_str()).collect()
    }

    #[test]
    fn test_descending_order_picks_highest_ordinals() {
        let mut vms = members(&["web-2", "web-10", "web-0", "legacy", "web-7"]);
        sort_for_scale_in(&mut vms, BasePolicy::DescendingOrder);
        assert_eq!(names(&vms), vec!["web-10", "web-7", "web-2", "web-0", "legacy"]);
    }

    #[test]
    fn test_random_order_is_a_permutation() {
        let mut vms = members(&["web-0", "web-1", "web-2", "web-3"]);
        sort_for_scale_in(&mut vms, BasePolicy::Random);
        let mut sorted = names(&vms);
        sorted.sort();
        assert_eq!(sorted, vec!["web-0", "web-1", "web-2", "web-3"]);
    }

    proptest! {
        #[test]
        fn test_descending_order_never_increases(
            ordinals in proptest::collection::vec(0usize..500, 0..40)
        ) {
            let vm_names: Vec<String> = ordinals.iter().map(|o| member_name("web", *o)).collect();
            let refs: Vec<&str> = vm_names.iter().map(String::as_str).collect();
            let mut vms = members(&refs);
            sort_for_scale_in(&mut vms, BasePolicy::DescendingOrder);

            let sorted: Vec<usize> = vms
                .iter()
                .filter_map(|vm| ordinal_from_name(&vm.metadata.name))
                .collect();
            prop_assert_eq!(sorted.len(), ordinals.len());
            prop_assert!(sorted.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
