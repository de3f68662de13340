//! Pool controller.
//!
//! Keeps the number of VMs owned by each `VirtualMachinePool` equal to its
//! desired count, rolls members forward when the template changes and
//! prunes revisions nothing references anymore.
//!
//! One pass (see [`PoolController::reconcile`]):
//! - claim VMs matching the selector, releasing owned ones that stopped matching
//! - ensure the pool finalizer while the pool is live
//! - scale, then update, then prune, each step gated on the previous one
//!   being stable and on expectations being satisfied
//! - publish status
//!
//! A deleting pool has its members' finalizers stripped, its revisions pruned
//! and its own finalizer removed.

mod revision;
mod scale;
mod status;
mod template;
mod update;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use vmfleet_api::{
    split_key, ControllerRevision, OwnerReference, Resource, Selector, VirtualMachine,
    VirtualMachineInstance, VirtualMachinePool, POOL_FINALIZER, POOL_REVISION_LABEL,
};
use vmfleet_reconcile::{
    finalizer_patch, recheck_deletion_timestamp, Change, ClaimManager, Clientset,
    EventRecorder, ReconcileError, Store, StoreError, SyncError, UidTrackingExpectations,
    WorkQueue, DEFAULT_ADD_DELAY,
};

use crate::error::ValidationError;
use crate::informer::Informers;
use crate::registry::{Context, Controller};
use crate::worker::{run_workers, QueueWorker};

pub use revision::build_revision;
pub use template::{index_vm_spec, member_name, new_member, ordinal_from_name, revision_name};
pub use update::UpdateType;

#[derive(Clone)]
pub struct PoolController {
    clientset: Clientset,
    pools: Arc<Store<VirtualMachinePool>>,
    vms: Arc<Store<VirtualMachine>>,
    vmis: Arc<Store<VirtualMachineInstance>>,
    revisions: Arc<Store<ControllerRevision>>,
    queue: WorkQueue,
    expectations: Arc<UidTrackingExpectations>,
    recorder: Arc<dyn EventRecorder>,
    burst_replicas: usize,
}

impl PoolController {
    /// Build a controller reading from `informers`. Handlers are not
    /// registered; see [`PoolController::register_handlers`].
    pub fn new(
        clientset: Clientset,
        informers: &Informers,
        recorder: Arc<dyn EventRecorder>,
        burst_replicas: usize,
    ) -> Self {
        Self {
            clientset,
            pools: informers.pools.store(),
            vms: informers.vms.store(),
            vmis: informers.vmis.store(),
            revisions: informers.revisions.store(),
            queue: WorkQueue::new("pool"),
            expectations: Arc::new(UidTrackingExpectations::new()),
            recorder,
            burst_replicas: burst_replicas.max(1),
        }
    }

    /// Build from the shared controller context.
    pub fn from_context(ctx: &Context) -> Self {
        let controller = Self::new(
            ctx.clientset.clone(),
            &ctx.informers,
            Arc::clone(&ctx.recorder),
            ctx.config.burst_replicas,
        );
        controller.register_handlers(&ctx.informers);
        controller
    }

    /// Hook the change handlers into the caches.
    pub fn register_handlers(&self, informers: &Informers) {
        let c = self.clone();
        informers.pools.add_handler(move |change| c.on_pool_change(change));
        let c = self.clone();
        informers.vms.add_handler(move |change| c.on_vm_change(change));
        let c = self.clone();
        informers.vmis.add_handler(move |change| c.on_vmi_change(change));
        let c = self.clone();
        informers
            .revisions
            .add_handler(move |change| c.on_revision_change(change));
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn expectations(&self) -> &UidTrackingExpectations {
        &self.expectations
    }

    fn enqueue(&self, pool: &VirtualMachinePool) {
        self.queue.add_after(&pool.key(), DEFAULT_ADD_DELAY);
    }

    /// The pool `owner` points at, if it is still the same object.
    fn resolve_pool(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Option<Arc<VirtualMachinePool>> {
        if owner.kind != VirtualMachinePool::KIND {
            return None;
        }
        self.pools
            .get(namespace, &owner.name)
            .filter(|pool| pool.metadata.uid == owner.uid)
    }

    fn owning_pool(&self, vm: &VirtualMachine) -> Option<Arc<VirtualMachinePool>> {
        let owner = vm.metadata.controller_ref()?;
        self.resolve_pool(&vm.metadata.namespace, owner)
    }

    /// Enqueue the pool on any change.
    pub fn on_pool_change(&self, change: &Change<VirtualMachinePool>) {
        match change {
            Change::Added(pool) | Change::Deleted(pool) => self.enqueue(pool),
            Change::Updated { new, .. } => self.enqueue(new),
        }
    }

    /// Observe member creations and deletions, then enqueue their pool.
    pub fn on_vm_change(&self, change: &Change<VirtualMachine>) {
        match change {
            Change::Added(vm) => {
                if vm.metadata.is_deleting() {
                    self.vm_deleted(vm);
                    return;
                }
                if let Some(pool) = self.owning_pool(vm) {
                    debug!(vm = %vm.key(), pool = %pool.key(), "VM created");
                    self.expectations.creation_observed(&pool.key());
                    self.enqueue(&pool);
                } else if vm.metadata.controller_ref().is_none() {
                    self.enqueue_matching_pools(vm);
                }
            }
            Change::Updated { old, new } => {
                if old.metadata.resource_version == new.metadata.resource_version {
                    return;
                }
                if new.metadata.is_deleting() {
                    self.vm_deleted(new);
                    if old.metadata.labels != new.metadata.labels {
                        self.vm_deleted(old);
                    }
                    return;
                }

                let current = new.metadata.controller_ref();
                let previous = old.metadata.controller_ref();
                if current != previous {
                    if let Some(pool) =
                        previous.and_then(|r| self.resolve_pool(&old.metadata.namespace, r))
                    {
                        self.enqueue(&pool);
                    }
                }
                if let Some(pool) = self.owning_pool(new) {
                    self.enqueue(&pool);
                } else if current.is_none()
                    && (previous.is_some() || old.metadata.labels != new.metadata.labels)
                {
                    self.enqueue_matching_pools(new);
                }
            }
            Change::Deleted(vm) => self.vm_deleted(vm),
        }
    }

    /// An orphan may be adopted by any live pool whose selector matches it.
    fn enqueue_matching_pools(&self, vm: &VirtualMachine) {
        for pool in self.pools.by_namespace(&vm.metadata.namespace) {
            if pool.metadata.is_deleting() {
                continue;
            }
            if validate(&pool).is_ok_and(|s| s.matches(&vm.metadata.labels)) {
                self.enqueue(&pool);
            }
        }
    }

    fn vm_deleted(&self, vm: &VirtualMachine) {
        if let Some(pool) = self.owning_pool(vm) {
            debug!(vm = %vm.key(), pool = %pool.key(), "VM deleted");
            self.expectations.deletion_observed(&pool.key(), &vm.key());
            self.enqueue(&pool);
        }
    }

    /// Instances are not members, but an instance running an older revision
    /// than its VM asks for means the pool has work to do.
    pub fn on_vmi_change(&self, change: &Change<VirtualMachineInstance>) {
        let vmi = match change {
            Change::Added(vmi) => vmi,
            Change::Updated { new, .. } => new,
            Change::Deleted(_) => return,
        };
        if vmi.metadata.is_deleting() {
            return;
        }

        let Some(owner) = vmi.metadata.controller_ref() else {
            return;
        };
        if owner.kind != VirtualMachine::KIND {
            return;
        }
        let Some(vm) = self
            .vms
            .get(&vmi.metadata.namespace, &owner.name)
            .filter(|vm| vm.metadata.uid == owner.uid)
        else {
            return;
        };
        let Some(pool) = self.owning_pool(&vm) else {
            return;
        };

        let wanted = vm.spec.template.metadata.labels.get(POOL_REVISION_LABEL);
        let running = vmi.metadata.labels.get(POOL_REVISION_LABEL);
        if wanted.is_some() && wanted == running {
            return;
        }
        debug!(vmi = %vmi.key(), pool = %pool.key(), "Instance revision differs from VM");
        self.enqueue(&pool);
    }

    /// Count a revision creation towards its pool.
    pub fn on_revision_change(&self, change: &Change<ControllerRevision>) {
        match change {
            Change::Added(revision) => {
                let Some(pool) = revision
                    .metadata
                    .controller_ref()
                    .and_then(|r| self.resolve_pool(&revision.metadata.namespace, r))
                else {
                    return;
                };
                self.expectations.creation_observed(&pool.key());
                self.enqueue(&pool);
            }
            Change::Updated { new, .. } => {
                if let Some(pool) = new
                    .metadata
                    .controller_ref()
                    .and_then(|r| self.resolve_pool(&new.metadata.namespace, r))
                {
                    self.enqueue(&pool);
                }
            }
            Change::Deleted(_) => {}
        }
    }

    /// Run one pass for the pool at `key`.
    #[instrument(skip(self), fields(pool = %key))]
    pub async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = split_key(key)?;
        let Some(cached) = self.pools.get(namespace, name) else {
            debug!("Pool no longer exists");
            self.expectations.delete_expectations(key);
            return Ok(());
        };

        let selector = match validate(&cached) {
            Ok(selector) => selector,
            Err(err) => {
                error!(error = %err, "Invalid pool, not reconciling");
                return Ok(());
            }
        };

        let namespace = cached.metadata.namespace.clone();
        let can_adopt = recheck_deletion_timestamp::<VirtualMachinePool>(
            Arc::clone(&self.clientset.pools),
            namespace.clone(),
            cached.metadata.name.clone(),
            cached.metadata.uid.clone(),
        );
        let manager = ClaimManager::<VirtualMachine>::new(
            cached.as_ref(),
            Arc::clone(&self.clientset.vms),
            can_adopt,
        );
        let vms = manager
            .claim_objects(self.vms.by_namespace(&namespace), |vm| {
                selector.matches(&vm.metadata.labels)
            })
            .await?;

        let pool = if cached.metadata.is_deleting() {
            cached
        } else {
            self.add_pool_finalizer(cached).await?
        };

        let sync_err = if pool.metadata.is_deleting() {
            self.finalize(&pool, &vms).await?
        } else if pool.spec.paused {
            debug!("Pool is paused");
            None
        } else if !self.expectations.satisfied_expectations(key) {
            debug!("Waiting for expectations");
            None
        } else {
            self.sync(&pool, &vms).await.err()
        };

        self.update_status(&pool, &selector, &vms, sync_err.as_ref())
            .await?;

        match sync_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Scale, then update, then prune. Each step only runs once the previous
    /// one reports the pool stable and the writes it issued were observed.
    async fn sync(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<(), SyncError> {
        let key = pool.key();

        if !self.scale(pool, vms).await? {
            return Ok(());
        }
        if !self.expectations.satisfied_expectations(&key) {
            return Ok(());
        }
        if !self.update(pool, vms).await? {
            return Ok(());
        }
        if !self.expectations.satisfied_expectations(&key) {
            return Ok(());
        }
        self.prune_revisions(pool, vms).await
    }

    /// Release members and revisions of a deleting pool, then let it go.
    async fn finalize(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<Option<SyncError>, StoreError> {
        for vm in vms {
            self.remove_member_finalizer(vm).await?;
        }
        if let Err(err) = self.prune_revisions(pool, vms).await {
            return Ok(Some(err));
        }
        self.remove_pool_finalizer(pool).await?;
        Ok(None)
    }

    /// Returns the pool as stored after the write, so later writes in the
    /// same pass carry a current resource version.
    async fn add_pool_finalizer(
        &self,
        pool: Arc<VirtualMachinePool>,
    ) -> Result<Arc<VirtualMachinePool>, StoreError> {
        if pool.metadata.has_finalizer(POOL_FINALIZER) {
            return Ok(pool);
        }

        let mut finalizers = pool.metadata.finalizers.clone();
        finalizers.push(POOL_FINALIZER.to_string());
        let patch = finalizer_patch(&pool.metadata.finalizers, &finalizers);
        match self
            .clientset
            .pools
            .patch(&pool.metadata.namespace, &pool.metadata.name, &patch)
            .await
        {
            Ok(patched) => {
                info!("Added pool finalizer");
                Ok(Arc::new(patched))
            }
            Err(e) if e.is_not_found() => Ok(pool),
            Err(e) => Err(e),
        }
    }

    async fn remove_pool_finalizer(&self, pool: &VirtualMachinePool) -> Result<(), StoreError> {
        if !pool.metadata.has_finalizer(POOL_FINALIZER) {
            return Ok(());
        }

        let finalizers = pool.metadata.finalizers_without(POOL_FINALIZER);
        let patch = finalizer_patch(&pool.metadata.finalizers, &finalizers);
        match self
            .clientset
            .pools
            .patch(&pool.metadata.namespace, &pool.metadata.name, &patch)
            .await
        {
            Ok(_) => {
                info!("Removed pool finalizer");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_member_finalizer(&self, vm: &VirtualMachine) -> Result<(), StoreError> {
        if !vm.metadata.has_finalizer(POOL_FINALIZER) {
            return Ok(());
        }

        let finalizers = vm.metadata.finalizers_without(POOL_FINALIZER);
        let patch = finalizer_patch(&vm.metadata.finalizers, &finalizers);
        match self
            .clientset
            .vms
            .patch(&vm.metadata.namespace, &vm.metadata.name, &patch)
            .await
        {
            Ok(_) => {
                debug!(vm = %vm.key(), "Removed pool finalizer from VM");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The pool's selector, provided it selects the pool's own template.
fn validate(pool: &VirtualMachinePool) -> Result<Selector, ValidationError> {
    let selector = pool
        .spec
        .selector
        .as_ref()
        .ok_or(ValidationError::MissingSelector)?
        .to_selector()?;
    if !selector.matches(&pool.spec.virtual_machine_template.metadata.labels) {
        return Err(ValidationError::TemplateMismatch {
            selector: selector.to_string(),
        });
    }
    Ok(selector)
}

#[async_trait]
impl QueueWorker for PoolController {
    fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    fn has_synced(&self) -> bool {
        self.pools.has_synced()
            && self.vms.has_synced()
            && self.vmis.has_synced()
            && self.revisions.has_synced()
    }

    async fn execute(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconcile(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(err) if err.requires_requeue() => {
                info!(pool = %key, error = %err, "Re-enqueuing pool");
                self.queue.add_rate_limited(&key);
            }
            Err(err) => {
                error!(pool = %key, error = %err, "Dropping pool");
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }
}

#[async_trait]
impl Controller for PoolController {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn run(&self, threadiness: usize, shutdown: watch::Receiver<bool>) {
        run_workers(self.clone(), threadiness, shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_api::LabelSelector;
    use vmfleet_testing::builders::{labels, pool};

    #[test]
    fn test_validate_requires_matching_template() {
        let mut p = pool("web", 1);
        assert!(validate(&p).is_ok());

        p.spec.selector = None;
        assert_eq!(validate(&p).unwrap_err(), ValidationError::MissingSelector);

        p.spec.selector = Some(LabelSelector::from_labels([("app", "db")]));
        assert!(matches!(
            validate(&p).unwrap_err(),
            ValidationError::TemplateMismatch { .. }
        ));

        p.spec.virtual_machine_template.metadata.labels = labels(&[("app", "db")]);
        assert!(validate(&p).is_ok());
    }
}
