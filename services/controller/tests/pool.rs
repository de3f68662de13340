mod common;

use std::time::Duration;

use chrono::Utc;
use common::{instance_of, member, Harness, POOL_KEY};
use serde_json::json;
use vmfleet_api::{
    BasePolicy, Conditions, DataVolumeTemplateSpec, FleetConditionType, IntOrPercent,
    ProactiveScaleIn, Resource, ScaleInStrategy, SelectionPolicy, TemplateMeta,
    VirtualMachinePool, POOL_FINALIZER, POOL_REVISION_LABEL,
};
use vmfleet_controller::pool::{build_revision, new_member};
use vmfleet_reconcile::{
    DeleteOptions, StoreError, WorkQueue, DEFAULT_ADD_DELAY, DEFAULT_BURST_REPLICAS,
    DEFAULT_RETRY_DELAY,
};
use vmfleet_testing::builders::{labels, orphan_vm, pool, ready_vm};
use vmfleet_testing::Verb;

/// `pool` moved on to `generation`, keeping its spec.
fn at_generation(pool: &VirtualMachinePool, generation: i64) -> VirtualMachinePool {
    let mut next = pool.clone();
    next.metadata.generation = generation;
    next
}

fn with_finalizer(mut pool: VirtualMachinePool) -> VirtualMachinePool {
    pool.metadata.finalizers.push(POOL_FINALIZER.to_string());
    pool
}

/// Let delayed adds land, then empty the queue.
async fn drain(queue: &WorkQueue) {
    tokio::task::yield_now().await;
    tokio::time::advance(DEFAULT_ADD_DELAY + Duration::from_millis(1)).await;
    tokio::task::yield_now().await;
    while !queue.is_empty() {
        if let Some(key) = queue.get().await {
            queue.done(&key);
        }
    }
}

fn sorted_names(calls: Vec<vmfleet_testing::Call>) -> Vec<String> {
    let mut names: Vec<String> = calls.into_iter().map(|c| c.name).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_scale_out_from_zero() {
    let h = Harness::new();
    h.fake.pools.insert(pool("web", 3));
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(
        sorted_names(h.fake.vms.calls_for(Verb::Create)),
        vec!["web-0", "web-1", "web-2"]
    );
    assert_eq!(h.recorder.count("SuccessfulCreate"), 3);
    for vm in h.fake.vms.objects() {
        let controllers: Vec<_> = vm
            .metadata
            .owner_references
            .iter()
            .filter(|r| r.is_controller())
            .collect();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].uid.as_str(), "pool-uid-web");
        assert!(vm.metadata.has_finalizer(POOL_FINALIZER));
        assert_eq!(
            vm.metadata.labels.get(POOL_REVISION_LABEL).map(String::as_str),
            Some("web-1")
        );
    }
    assert!(h.fake.revisions.object("default", "web-1").is_some());
    assert!(!controller.expectations().satisfied_expectations(POOL_KEY));

    h.sync().await;
    assert!(controller.expectations().satisfied_expectations(POOL_KEY));
    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(h.fake.vms.count(Verb::Create), 3);
    let stored = h.fake.pools.object("default", "web").unwrap();
    assert_eq!(stored.status.replicas, 3);
    assert_eq!(stored.status.ready_replicas, 0);
    assert_eq!(stored.status.label_selector, "app=web");
}

#[tokio::test]
async fn test_burst_limit_waits_for_expectations() {
    let h = Harness::new();
    h.fake.pools.insert(with_finalizer(pool("web", 15)));
    let controller = h.pool_controller(10);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(h.fake.vms.count(Verb::Create), 10);

    // the pool cache catches up, the member creations are not observed yet
    h.informers.pools.sync_once().await.unwrap();
    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(h.fake.vms.count(Verb::Create), 10);

    h.sync().await;
    h.fake.clear_calls();
    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(
        sorted_names(h.fake.vms.calls_for(Verb::Create)),
        vec!["web-10", "web-11", "web-12", "web-13", "web-14"]
    );
    assert_eq!(h.fake.vms.objects().len(), 15);
}

#[tokio::test]
async fn test_identical_template_only_patches_revision_label() {
    let h = Harness::new();
    let old = with_finalizer(pool("web", 1));
    let current = at_generation(&old, 2);
    h.fake.pools.insert(current.clone());
    h.fake.revisions.insert(build_revision(&old).unwrap());
    h.fake.revisions.insert(build_revision(&current).unwrap());
    let vm = h.fake.vms.insert(member(&current, 0, "web-2"));
    h.fake.vmis.insert(instance_of(&vm, "web-1"));
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(h.fake.vmis.count(Verb::Patch), 1);
    assert_eq!(h.fake.vmis.count(Verb::Delete), 0);
    assert_eq!(h.fake.vms.count(Verb::Delete), 0);
    let vmi = h.fake.vmis.object("default", "web-0").unwrap();
    assert_eq!(
        vmi.metadata.labels.get(POOL_REVISION_LABEL).map(String::as_str),
        Some("web-2")
    );
    assert_eq!(h.recorder.count("SuccessfulUpdate"), 1);
}

#[tokio::test]
async fn test_storage_template_change_deletes_the_vm() {
    let h = Harness::new();
    let mut old = with_finalizer(pool("web", 1));
    old.spec
        .virtual_machine_template
        .spec
        .data_volume_templates
        .push(DataVolumeTemplateSpec {
            metadata: TemplateMeta {
                name: "data".into(),
                ..Default::default()
            },
            spec: json!({"storage": {"resources": {"requests": {"storage": "10Gi"}}}}),
        });
    let mut current = at_generation(&old, 2);
    current
        .spec
        .virtual_machine_template
        .spec
        .data_volume_templates
        .clear();

    h.fake.pools.insert(current.clone());
    h.fake.revisions.insert(build_revision(&old).unwrap());
    h.fake.revisions.insert(build_revision(&current).unwrap());
    let vm = h.fake.vms.insert(member(&current, 0, "web-2"));
    h.fake.vmis.insert(instance_of(&vm, "web-1"));
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    let deletes = h.fake.vms.calls_for(Verb::Delete);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].name, "web-0");
    assert_eq!(deletes[0].delete_options, Some(DeleteOptions::foreground()));
    assert_eq!(h.fake.vmis.count(Verb::Delete), 0);
    assert!(h
        .fake
        .vms
        .object("default", "web-0")
        .unwrap()
        .metadata
        .is_deleting());
}

#[tokio::test]
async fn test_orphan_is_adopted_once() {
    let h = Harness::new();
    let web = pool("web", 1);
    h.fake.pools.insert(web.clone());
    h.fake.revisions.insert(build_revision(&web).unwrap());
    h.fake.vms.insert(ready_vm(orphan_vm(
        "web-0",
        labels(&[("app", "web"), (POOL_REVISION_LABEL, "web-1")]),
    )));
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(h.fake.vms.count(Verb::Patch), 1);
    assert_eq!(h.fake.vms.count(Verb::Create), 0);
    let adopted = h.fake.vms.object("default", "web-0").unwrap();
    let owner = adopted.metadata.controller_ref().unwrap();
    assert_eq!(owner.kind, VirtualMachinePool::KIND);
    assert_eq!(owner.uid.as_str(), "pool-uid-web");

    h.sync().await;
    h.fake.clear_calls();
    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(h.fake.vms.count(Verb::Patch), 0);
    assert_eq!(h.fake.write_count(), 0);
}

#[tokio::test]
async fn test_reconcile_is_idempotent_when_converged() {
    let h = Harness::new();
    let web = with_finalizer(pool("web", 2));
    h.fake.pools.insert(web.clone());
    h.fake.revisions.insert(build_revision(&web).unwrap());
    for ordinal in 0..2 {
        let vm = h.fake.vms.insert(member(&web, ordinal, "web-1"));
        h.fake.vmis.insert(instance_of(&vm, "web-1"));
    }
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(h.fake.pools.count(Verb::UpdateStatus), 1);
    assert_eq!(h.fake.write_count(), 1);

    h.sync().await;
    h.fake.clear_calls();
    controller.reconcile(POOL_KEY).await.unwrap();
    assert_eq!(h.fake.write_count(), 0);

    let stored = h.fake.pools.object("default", "web").unwrap();
    assert_eq!(stored.status.replicas, 2);
    assert_eq!(stored.status.ready_replicas, 2);
}

#[tokio::test]
async fn test_restarts_respect_max_unavailable() {
    let h = Harness::new();
    let mut old = with_finalizer(pool("web", 3));
    old.spec.max_unavailable = Some(IntOrPercent::Int(1));
    old.spec
        .virtual_machine_template
        .spec
        .template
        .metadata
        .annotations
        .insert("build".into(), "1".into());
    let mut current = at_generation(&old, 2);
    current
        .spec
        .virtual_machine_template
        .spec
        .template
        .metadata
        .annotations
        .insert("build".into(), "2".into());

    h.fake.pools.insert(current.clone());
    h.fake.revisions.insert(build_revision(&old).unwrap());
    h.fake.revisions.insert(build_revision(&current).unwrap());
    for ordinal in 0..3 {
        let vm = h.fake.vms.insert(member(&current, ordinal, "web-2"));
        h.fake.vmis.insert(instance_of(&vm, "web-1"));
    }
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(h.fake.vmis.count(Verb::Delete), 1);
    assert_eq!(h.fake.vms.count(Verb::Delete), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_requeues_after_delay() {
    let h = Harness::new();
    let mut old = with_finalizer(pool("web", 3));
    old.spec.max_unavailable = Some(IntOrPercent::Int(1));
    let mut current = at_generation(&old, 2);
    current
        .spec
        .virtual_machine_template
        .spec
        .template
        .metadata
        .annotations
        .insert("build".into(), "2".into());

    h.fake.pools.insert(current.clone());
    h.fake.revisions.insert(build_revision(&old).unwrap());
    h.fake.revisions.insert(build_revision(&current).unwrap());
    for ordinal in 0..3 {
        let vm = h.fake.vms.insert(member(&current, ordinal, "web-2"));
        h.fake.vmis.insert(instance_of(&vm, "web-1"));
    }
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;
    drain(controller.queue()).await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(h.fake.vmis.count(Verb::Delete), 1);
    tokio::task::yield_now().await;
    assert!(controller.queue().is_empty());

    tokio::time::advance(DEFAULT_RETRY_DELAY + Duration::from_millis(1)).await;
    tokio::task::yield_now().await;
    assert_eq!(controller.queue().len(), 1);
    assert_eq!(controller.queue().get().await.as_deref(), Some(POOL_KEY));
}

#[tokio::test]
async fn test_malformed_key_is_dropped() {
    let h = Harness::new();
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);

    let err = controller.reconcile("default/web/extra").await.unwrap_err();
    assert!(!err.requires_requeue());
    assert_eq!(h.fake.write_count(), 0);
}

#[tokio::test]
async fn test_unhealthy_instances_restart_without_budget() {
    let h = Harness::new();
    let mut old = with_finalizer(pool("web", 3));
    old.spec.max_unavailable = Some(IntOrPercent::Int(2));
    let mut current = at_generation(&old, 2);
    current
        .spec
        .virtual_machine_template
        .spec
        .template
        .metadata
        .annotations
        .insert("build".into(), "2".into());

    h.fake.pools.insert(current.clone());
    h.fake.revisions.insert(build_revision(&old).unwrap());
    h.fake.revisions.insert(build_revision(&current).unwrap());

    // web-0 is neither ready nor serving
    let sick = h
        .fake
        .vms
        .insert(new_member(&current, "web-0", 0, "web-2"));
    let mut sick_vmi = instance_of(&sick, "web-1");
    sick_vmi.status.conditions.clear();
    h.fake.vmis.insert(sick_vmi);
    for ordinal in 1..3 {
        let vm = h.fake.vms.insert(member(&current, ordinal, "web-2"));
        h.fake.vmis.insert(instance_of(&vm, "web-1"));
    }
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    // one free restart plus maxUnavailable(2) - unavailable(1)
    let restarted = sorted_names(h.fake.vmis.calls_for(Verb::Delete));
    assert_eq!(restarted.len(), 2);
    assert_eq!(restarted[0], "web-0");
}

#[tokio::test]
async fn test_prune_keeps_revisions_in_use() {
    let h = Harness::new();
    let web = with_finalizer(pool("web", 2));
    let current = at_generation(&web, 2);
    h.fake.pools.insert(current.clone());
    h.fake
        .revisions
        .insert(build_revision(&at_generation(&web, 0)).unwrap());
    h.fake.revisions.insert(build_revision(&web).unwrap());
    h.fake.revisions.insert(build_revision(&current).unwrap());
    h.fake
        .revisions
        .insert(build_revision(&pool("db", 1)).unwrap());

    let first = h.fake.vms.insert(member(&current, 0, "web-2"));
    h.fake.vmis.insert(instance_of(&first, "web-1"));
    let second = h.fake.vms.insert(member(&current, 1, "web-2"));
    h.fake.vmis.insert(instance_of(&second, "web-2"));
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(
        sorted_names(h.fake.revisions.calls_for(Verb::Delete)),
        vec!["web-0"]
    );
    assert!(h.fake.revisions.object("default", "db-1").is_some());
}

#[tokio::test]
async fn test_deleting_pool_releases_members_and_finalizer() {
    let h = Harness::new();
    let mut web = with_finalizer(pool("web", 2));
    h.fake.revisions.insert(build_revision(&web).unwrap());
    web.metadata.deletion_timestamp = Some(Utc::now());
    h.fake.pools.insert(web.clone());
    for ordinal in 0..2 {
        h.fake.vms.insert(member(&web, ordinal, "web-1"));
    }
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(h.fake.vms.count(Verb::Patch), 2);
    for vm in h.fake.vms.objects() {
        assert!(!vm.metadata.has_finalizer(POOL_FINALIZER));
    }
    assert_eq!(h.fake.vms.count(Verb::Delete), 0);
    assert_eq!(h.fake.revisions.count(Verb::Delete), 0);
    assert!(h.fake.pools.object("default", "web").is_none());
}

#[tokio::test]
async fn test_paused_pool_only_reports_status() {
    let h = Harness::new();
    let mut web = pool("web", 2);
    web.spec.paused = true;
    h.fake.pools.insert(web);
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    assert_eq!(h.fake.vms.count(Verb::Create), 0);
    let stored = h.fake.pools.object("default", "web").unwrap();
    assert!(stored
        .status
        .conditions
        .has_condition(&FleetConditionType::ReplicaPaused));
    assert_eq!(h.recorder.count("SuccessfulPaused"), 1);

    let mut resumed = stored;
    resumed.spec.paused = false;
    h.fake.pools.set(resumed);
    h.sync().await;
    controller.reconcile(POOL_KEY).await.unwrap();

    let stored = h.fake.pools.object("default", "web").unwrap();
    assert!(!stored
        .status
        .conditions
        .has_condition(&FleetConditionType::ReplicaPaused));
    assert_eq!(h.recorder.count("SuccessfulResume"), 1);
    assert_eq!(h.fake.vms.count(Verb::Create), 2);
}

#[tokio::test]
async fn test_descending_scale_in_removes_highest_ordinals() {
    let h = Harness::new();
    let mut web = with_finalizer(pool("web", 1));
    web.spec.scale_in_strategy = Some(ScaleInStrategy {
        proactive: Some(ProactiveScaleIn {
            selection_policy: Some(SelectionPolicy {
                base_policy: Some(BasePolicy::DescendingOrder),
            }),
        }),
    });
    h.fake.pools.insert(web.clone());
    h.fake.revisions.insert(build_revision(&web).unwrap());
    for ordinal in 0..3 {
        h.fake.vms.insert(member(&web, ordinal, "web-1"));
    }
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    let deletes = h.fake.vms.calls_for(Verb::Delete);
    assert!(deletes
        .iter()
        .all(|c| c.delete_options == Some(DeleteOptions::foreground())));
    assert_eq!(sorted_names(deletes), vec!["web-1", "web-2"]);
    assert!(h.fake.vms.object("default", "web-0").is_some());
    assert!(h.fake.vms.object("default", "web-2").is_none());
    assert_eq!(h.recorder.count("SuccessfulDelete"), 2);

    assert!(!controller.expectations().satisfied_expectations(POOL_KEY));
    h.sync().await;
    assert!(controller.expectations().satisfied_expectations(POOL_KEY));
}

#[tokio::test]
async fn test_failed_creates_surface_and_roll_back() {
    let h = Harness::new();
    h.fake.pools.insert(pool("web", 2));
    h.fake.vms.fail(
        Verb::Create,
        None,
        StoreError::Server {
            status: 500,
            message: "etcd unavailable".into(),
        },
    );
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    let err = controller.reconcile(POOL_KEY).await.err().unwrap();
    assert!(err.requires_requeue());
    assert_eq!(h.fake.vms.count(Verb::Create), 2);
    assert_eq!(h.recorder.count("FailedCreate"), 1);

    let stored = h.fake.pools.object("default", "web").unwrap();
    let failure = stored
        .status
        .conditions
        .iter()
        .find(|c| c.type_ == FleetConditionType::ReplicaFailure)
        .unwrap();
    assert_eq!(failure.reason, "FailedScaleOut");

    // only the revision create is still pending
    h.sync().await;
    assert!(controller.expectations().satisfied_expectations(POOL_KEY));
}

#[tokio::test]
async fn test_member_that_stops_matching_is_released() {
    let h = Harness::new();
    let web = with_finalizer(pool("web", 1));
    h.fake.pools.insert(web.clone());
    h.fake.revisions.insert(build_revision(&web).unwrap());
    let mut drifted = member(&web, 0, "web-1");
    drifted.metadata.labels.insert("app".into(), "other".into());
    h.fake.vms.insert(drifted);
    let controller = h.pool_controller(DEFAULT_BURST_REPLICAS);
    h.sync().await;

    controller.reconcile(POOL_KEY).await.unwrap();

    let released = h.fake.vms.object("default", "web-0").unwrap();
    assert!(released.metadata.owner_references.is_empty());
    assert_eq!(
        sorted_names(h.fake.vms.calls_for(Verb::Create)),
        vec!["web-1"]
    );
}
