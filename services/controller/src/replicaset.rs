//! Replica set controller.
//!
//! Keeps a fixed number of bare `VirtualMachineInstance`s running. Members
//! are instances themselves, so there are no revisions and no rolling
//! update: scale, clean up finished instances, publish status.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use vmfleet_api::{
    Condition, Conditions, FleetConditionType, InstanceTemplateSpec, ObjectMeta,
    split_key, OwnerReference, Resource, Selector, VirtualMachineInstance,
    VirtualMachineInstanceReplicaSet,
};
use vmfleet_reconcile::{
    fan_out, first_error, recheck_deletion_timestamp, Change, ClaimManager, Clientset,
    DeleteOptions, Event, EventRecorder, ReconcileError, Store, StoreError,
    UidTrackingExpectations, WorkQueue,
};

use crate::error::ValidationError;
use crate::informer::Informers;
use crate::reasons::{
    FAILED_CREATE, FAILED_DELETE, SUCCESSFUL_CREATE, SUCCESSFUL_DELETE, SUCCESSFUL_PAUSED,
    SUCCESSFUL_RESUMED,
};
use crate::registry::{Context, Controller};
use crate::worker::{run_workers, QueueWorker};

#[derive(Clone)]
pub struct ReplicaSetController {
    clientset: Clientset,
    replicasets: Arc<Store<VirtualMachineInstanceReplicaSet>>,
    vmis: Arc<Store<VirtualMachineInstance>>,
    queue: WorkQueue,
    expectations: Arc<UidTrackingExpectations>,
    recorder: Arc<dyn EventRecorder>,
    burst_replicas: usize,
}

impl ReplicaSetController {
    pub fn new(
        clientset: Clientset,
        informers: &Informers,
        recorder: Arc<dyn EventRecorder>,
        burst_replicas: usize,
    ) -> Self {
        Self {
            clientset,
            replicasets: informers.replicasets.store(),
            vmis: informers.vmis.store(),
            queue: WorkQueue::new("replicaset"),
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
        informers
            .replicasets
            .add_handler(move |change| c.on_replicaset_change(change));
        let c = self.clone();
        informers.vmis.add_handler(move |change| c.on_vmi_change(change));
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn expectations(&self) -> &UidTrackingExpectations {
        &self.expectations
    }

    fn enqueue(&self, rs: &VirtualMachineInstanceReplicaSet) {
        self.queue.add(&rs.key());
    }

    fn resolve_replicaset(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Option<Arc<VirtualMachineInstanceReplicaSet>> {
        if owner.kind != VirtualMachineInstanceReplicaSet::KIND {
            return None;
        }
        self.replicasets
            .get(namespace, &owner.name)
            .filter(|rs| rs.metadata.uid == owner.uid)
    }

    fn owning_replicaset(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Option<Arc<VirtualMachineInstanceReplicaSet>> {
        let owner = vmi.metadata.controller_ref()?;
        self.resolve_replicaset(&vmi.metadata.namespace, owner)
    }

    /// Enqueue the replica set on any change.
    pub fn on_replicaset_change(&self, change: &Change<VirtualMachineInstanceReplicaSet>) {
        match change {
            Change::Added(rs) | Change::Deleted(rs) => self.enqueue(rs),
            Change::Updated { new, .. } => self.enqueue(new),
        }
    }

    /// Observe instance creations and deletions, then enqueue their replica set.
    pub fn on_vmi_change(&self, change: &Change<VirtualMachineInstance>) {
        match change {
            Change::Added(vmi) => {
                if vmi.metadata.is_deleting() {
                    self.vmi_deleted(vmi);
                    return;
                }
                if let Some(rs) = self.owning_replicaset(vmi) {
                    debug!(vmi = %vmi.key(), replicaset = %rs.key(), "Instance created");
                    self.expectations.creation_observed(&rs.key());
                    self.enqueue(&rs);
                } else if vmi.metadata.controller_ref().is_none() {
                    self.enqueue_matching(vmi);
                }
            }
            Change::Updated { old, new } => {
                if old.metadata.resource_version == new.metadata.resource_version {
                    return;
                }
                let labels_changed = old.metadata.labels != new.metadata.labels;
                if new.metadata.is_deleting() {
                    self.vmi_deleted(new);
                    if labels_changed {
                        self.vmi_deleted(old);
                    }
                    return;
                }

                let current = new.metadata.controller_ref();
                let previous = old.metadata.controller_ref();
                if current != previous {
                    if let Some(rs) =
                        previous.and_then(|r| self.resolve_replicaset(&old.metadata.namespace, r))
                    {
                        self.enqueue(&rs);
                    }
                }
                if let Some(rs) = self.owning_replicaset(new) {
                    self.enqueue(&rs);
                } else if current.is_none() && (labels_changed || previous.is_some()) {
                    self.enqueue_matching(new);
                }
            }
            Change::Deleted(vmi) => self.vmi_deleted(vmi),
        }
    }

    fn enqueue_matching(&self, vmi: &VirtualMachineInstance) {
        for rs in self.replicasets.by_namespace(&vmi.metadata.namespace) {
            let matches = rs
                .spec
                .selector
                .as_ref()
                .and_then(|s| s.to_selector().ok())
                .is_some_and(|s| s.matches(&vmi.metadata.labels));
            if matches {
                self.enqueue(&rs);
            }
        }
    }

    fn vmi_deleted(&self, vmi: &VirtualMachineInstance) {
        if let Some(rs) = self.owning_replicaset(vmi) {
            debug!(vmi = %vmi.key(), replicaset = %rs.key(), "Instance deleted");
            self.expectations.deletion_observed(&rs.key(), &vmi.key());
            self.enqueue(&rs);
        }
    }

    /// Run one pass for the replica set at `key`.
    #[instrument(skip(self), fields(replicaset = %key))]
    pub async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = split_key(key)?;
        let Some(rs) = self.replicasets.get(namespace, name) else {
            debug!("Replica set no longer exists");
            self.expectations.delete_expectations(key);
            return Ok(());
        };

        let (template, selector) = match validate(&rs) {
            Ok(valid) => valid,
            Err(err) => {
                error!(error = %err, "Invalid replica set, not reconciling");
                return Ok(());
            }
        };

        let needs_sync = self.expectations.satisfied_expectations(key);

        let namespace = rs.metadata.namespace.clone();
        let can_adopt = recheck_deletion_timestamp::<VirtualMachineInstanceReplicaSet>(
            Arc::clone(&self.clientset.replicasets),
            namespace.clone(),
            rs.metadata.name.clone(),
            rs.metadata.uid.clone(),
        );
        let manager = ClaimManager::<VirtualMachineInstance>::new(
            rs.as_ref(),
            Arc::clone(&self.clientset.vmis),
            can_adopt,
        );
        let vmis = manager
            .claim_objects(self.vmis.by_namespace(&namespace), |vmi| {
                selector.matches(&vmi.metadata.labels)
            })
            .await?;

        let (active, finished): (Vec<_>, Vec<_>) = vmis
            .into_iter()
            .filter(|vmi| !vmi.metadata.is_deleting())
            .partition(|vmi| is_active(vmi));
        let diff = active.len() as i64 - i64::from(rs.spec.desired_replicas());

        let mut scale_err = None;
        if needs_sync && !rs.spec.paused && !rs.metadata.is_deleting() {
            scale_err = self.scale(&rs, template, &active, diff).await.err();
            // a second expectation batch would overwrite the first
            if scale_err.is_none() && diff == 0 && !finished.is_empty() {
                scale_err = self.clean_finished(&rs, &finished).await.err();
            }
        }
        if let Some(err) = &scale_err {
            error!(error = %err, "Scaling the replica set failed");
        }

        if let Err(err) = self
            .update_status(&rs, &selector, &active, diff, scale_err.as_ref())
            .await
        {
            error!(error = %err, "Updating the replica set status failed");
            if scale_err.is_none() {
                return Err(err.into());
            }
        }

        match scale_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn scale(
        &self,
        rs: &VirtualMachineInstanceReplicaSet,
        template: &InstanceTemplateSpec,
        active: &[Arc<VirtualMachineInstance>],
        diff: i64,
    ) -> Result<(), StoreError> {
        if diff == 0 {
            return Ok(());
        }

        let key = rs.key();
        let count = (diff.unsigned_abs() as usize).min(self.burst_replicas);
        let rs_key = key.as_str();

        let results = if diff < 0 {
            info!(count, "Creating missing instances");
            self.expectations.expect_creations(&key, count as i64);
            let base_name = base_name(rs, template);
            let base_name = base_name.as_str();
            fan_out(0..count, self.burst_replicas, move |_| {
                self.create_instance(rs, template, rs_key, base_name)
            })
            .await
        } else {
            info!(count, "Deleting excess instances");
            // instances that are not serving yet go first
            let mut candidates = active.to_vec();
            candidates.sort_by_key(|vmi| vmi.is_ready());
            candidates.truncate(count);
            let child_keys: Vec<String> = candidates.iter().map(|vmi| vmi.key()).collect();
            self.expectations.expect_deletions(&key, &child_keys);
            fan_out(candidates, self.burst_replicas, move |vmi| {
                self.delete_instance(rs, rs_key, vmi)
            })
            .await
        };

        match first_error(results, "scale") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn clean_finished(
        &self,
        rs: &VirtualMachineInstanceReplicaSet,
        finished: &[Arc<VirtualMachineInstance>],
    ) -> Result<(), StoreError> {
        let key = rs.key();
        let candidates = &finished[..finished.len().min(self.burst_replicas)];
        info!(count = candidates.len(), "Deleting finished instances");

        let child_keys: Vec<String> = candidates.iter().map(|vmi| vmi.key()).collect();
        self.expectations.expect_deletions(&key, &child_keys);

        let rs_key = key.as_str();
        let results = fan_out(candidates.iter().cloned(), self.burst_replicas, move |vmi| {
            self.delete_instance(rs, rs_key, vmi)
        })
        .await;

        match first_error(results, "delete finished") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn create_instance(
        &self,
        rs: &VirtualMachineInstanceReplicaSet,
        template: &InstanceTemplateSpec,
        rs_key: &str,
        base_name: &str,
    ) -> Result<(), StoreError> {
        let mut metadata = ObjectMeta::named(&rs.metadata.namespace, "");
        metadata.generate_name = base_name.to_string();
        metadata.labels = template.metadata.labels.clone();
        metadata.annotations = template.metadata.annotations.clone();
        metadata.owner_references = vec![OwnerReference::controller_for(rs)];
        let vmi = VirtualMachineInstance {
            metadata,
            spec: template.spec.clone(),
            ..Default::default()
        };

        match self.clientset.vmis.create(&vmi).await {
            Ok(created) => {
                self.recorder.record(Event::normal(
                    rs,
                    SUCCESSFUL_CREATE,
                    format!("Created instance {}", created.metadata.name),
                ));
                Ok(())
            }
            Err(err) => {
                self.expectations.creation_observed(rs_key);
                self.recorder.record(Event::warning(
                    rs,
                    FAILED_CREATE,
                    format!("Error creating instance: {err}"),
                ));
                Err(err)
            }
        }
    }

    async fn delete_instance(
        &self,
        rs: &VirtualMachineInstanceReplicaSet,
        rs_key: &str,
        vmi: Arc<VirtualMachineInstance>,
    ) -> Result<(), StoreError> {
        match self
            .clientset
            .vmis
            .delete(
                &vmi.metadata.namespace,
                &vmi.metadata.name,
                &DeleteOptions::default(),
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                self.expectations.deletion_observed(rs_key, &vmi.key());
                self.recorder.record(Event::warning(
                    rs,
                    FAILED_DELETE,
                    format!("Error deleting instance {}: {err}", vmi.metadata.name),
                ));
                return Err(err);
            }
        }

        self.recorder.record(Event::normal(
            rs,
            SUCCESSFUL_DELETE,
            format!("Deleted instance {}", vmi.metadata.uid),
        ));
        Ok(())
    }

    /// Write status only when something an observer can see changed.
    async fn update_status(
        &self,
        rs: &VirtualMachineInstanceReplicaSet,
        selector: &Selector,
        active: &[Arc<VirtualMachineInstance>],
        diff: i64,
        scale_err: Option<&StoreError>,
    ) -> Result<(), StoreError> {
        let failure = FleetConditionType::ReplicaFailure;
        let paused = FleetConditionType::ReplicaPaused;

        let replicas = active.len() as i32;
        let ready_replicas = active.iter().filter(|vmi| vmi.has_ready_condition()).count() as i32;
        let label_selector = selector.to_string();
        let conditions = &rs.status.conditions;

        let states_match =
            replicas == rs.status.replicas && ready_replicas == rs.status.ready_replicas;
        let errors_match = scale_err.is_some() == conditions.has_condition(&failure);
        let paused_match = rs.spec.paused == conditions.has_condition(&paused);
        let selector_match = rs.status.label_selector == label_selector;
        if states_match && errors_match && paused_match && selector_match {
            return Ok(());
        }

        let mut updated = rs.clone();
        let status = &mut updated.status;
        status.replicas = replicas;
        status.ready_replicas = ready_replicas;
        status.label_selector = label_selector;

        if rs.spec.paused && !status.conditions.has_condition(&paused) {
            status.conditions.update_condition(Condition::now(
                paused,
                "Paused",
                "Controller got paused",
            ));
        } else if !rs.spec.paused && status.conditions.has_condition(&paused) {
            status.conditions.remove_condition(&paused);
        }

        match scale_err {
            Some(err) if !status.conditions.has_condition(&failure) => {
                let reason = if diff < 0 { FAILED_CREATE } else { FAILED_DELETE };
                status
                    .conditions
                    .update_condition(Condition::now(failure, reason, err.to_string()));
            }
            None if status.conditions.has_condition(&failure) => {
                status.conditions.remove_condition(&failure);
            }
            _ => {}
        }

        match self.clientset.replicasets.update_status(&updated).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }

        if !paused_match {
            let event = if rs.spec.paused {
                Event::normal(rs, SUCCESSFUL_PAUSED, "Paused")
            } else {
                Event::normal(rs, SUCCESSFUL_RESUMED, "Resumed")
            };
            self.recorder.record(event);
        }
        Ok(())
    }
}

/// Not finished and not on its way out.
fn is_active(vmi: &VirtualMachineInstance) -> bool {
    !vmi.is_final() && !vmi.is_terminating()
}

fn base_name(rs: &VirtualMachineInstanceReplicaSet, template: &InstanceTemplateSpec) -> String {
    if !template.metadata.name.is_empty() {
        template.metadata.name.clone()
    } else if !template.metadata.generate_name.is_empty() {
        template.metadata.generate_name.clone()
    } else {
        rs.metadata.name.clone()
    }
}

fn validate(
    rs: &VirtualMachineInstanceReplicaSet,
) -> Result<(&InstanceTemplateSpec, Selector), ValidationError> {
    let template = rs
        .spec
        .template
        .as_ref()
        .ok_or(ValidationError::MissingTemplate)?;
    let selector = rs
        .spec
        .selector
        .as_ref()
        .ok_or(ValidationError::MissingSelector)?;
    if template.metadata.labels.is_empty() {
        return Err(ValidationError::EmptyTemplateLabels);
    }

    let selector = selector.to_selector()?;
    if !selector.matches(&template.metadata.labels) {
        return Err(ValidationError::TemplateMismatch {
            selector: selector.to_string(),
        });
    }
    Ok((template, selector))
}

#[async_trait]
impl QueueWorker for ReplicaSetController {
    fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    fn has_synced(&self) -> bool {
        self.replicasets.has_synced() && self.vmis.has_synced()
    }

    async fn execute(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconcile(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(err) if err.requires_requeue() => {
                info!(replicaset = %key, error = %err, "Re-enqueuing replica set");
                self.queue.add_rate_limited(&key);
            }
            Err(err) => {
                error!(replicaset = %key, error = %err, "Dropping replica set");
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }
}

#[async_trait]
impl Controller for ReplicaSetController {
    fn name(&self) -> &'static str {
        "replicaset"
    }

    async fn run(&self, threadiness: usize, shutdown: watch::Receiver<bool>) {
        run_workers(self.clone(), threadiness, shutdown).await;
    }
}
