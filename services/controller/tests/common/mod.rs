//! Shared setup for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vmfleet_api::{
    Condition, InstanceConditionType, InstancePhase, OwnerReference, VirtualMachine,
    VirtualMachineInstance, VirtualMachinePool, POOL_REVISION_LABEL,
};
use vmfleet_controller::pool::{member_name, new_member};
use vmfleet_controller::{Informers, PoolController, ReplicaSetController};
use vmfleet_testing::builders::ready_vm;
use vmfleet_testing::{FakeClientset, FakeRecorder};

pub const POOL_KEY: &str = "default/web";

/// Fake store, caches fed from it, and an event sink.
pub struct Harness {
    pub fake: FakeClientset,
    pub informers: Informers,
    pub recorder: Arc<FakeRecorder>,
}

impl Harness {
    pub fn new() -> Self {
        let fake = FakeClientset::new();
        let informers = Informers::new(&fake.clientset(), None, Duration::from_secs(5));
        Self {
            fake,
            informers,
            recorder: Arc::new(FakeRecorder::new()),
        }
    }

    pub fn pool_controller(&self, burst_replicas: usize) -> PoolController {
        let controller = PoolController::new(
            self.fake.clientset(),
            &self.informers,
            self.recorder.clone(),
            burst_replicas,
        );
        controller.register_handlers(&self.informers);
        controller
    }

    pub fn replicaset_controller(&self, burst_replicas: usize) -> ReplicaSetController {
        let controller = ReplicaSetController::new(
            self.fake.clientset(),
            &self.informers,
            self.recorder.clone(),
            burst_replicas,
        );
        controller.register_handlers(&self.informers);
        controller
    }

    /// Bring every cache up to date with the fake store.
    pub async fn sync(&self) {
        self.informers.sync_all().await.expect("informer sync");
    }
}

/// Ready member `ordinal` of `pool`, stamped with `revision`.
pub fn member(pool: &VirtualMachinePool, ordinal: usize, revision: &str) -> VirtualMachine {
    let name = member_name(&pool.metadata.name, ordinal);
    ready_vm(new_member(pool, &name, ordinal, revision))
}

/// Running, ready instance of `vm` labelled with `revision`.
pub fn instance_of(vm: &VirtualMachine, revision: &str) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance::default();
    vmi.metadata.namespace = vm.metadata.namespace.clone();
    vmi.metadata.name = vm.metadata.name.clone();
    vmi.metadata.labels = vm.spec.template.metadata.labels.clone();
    vmi.metadata
        .labels
        .insert(POOL_REVISION_LABEL.to_string(), revision.to_string());
    vmi.metadata
        .owner_references
        .push(OwnerReference::controller_for(vm));
    vmi.spec = vm.spec.template.spec.clone();
    vmi.status.phase = InstancePhase::Running;
    vmi.status
        .conditions
        .push(Condition::now(InstanceConditionType::Ready, "", ""));
    vmi
}
