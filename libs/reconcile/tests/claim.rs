//! Ownership claim protocol against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vmfleet_api::{OwnerReference, Uid, VirtualMachine, VirtualMachinePool};
use vmfleet_reconcile::{
    recheck_deletion_timestamp, CanAdoptFn, CanAdoptFuture, ClaimError, ClaimManager, Patch,
    StoreError,
};
use vmfleet_testing::builders::{labels, orphan_vm, owned_by, pool, NAMESPACE};
use vmfleet_testing::{FakeClient, Verb};

fn always_ok() -> CanAdoptFn {
    Box::new(|| -> CanAdoptFuture { Box::pin(async { Ok(()) }) })
}

fn matches_app(app: &'static str) -> impl Fn(&VirtualMachine) -> bool {
    move |vm| vm.metadata.labels.get("app").map(String::as_str) == Some(app)
}

fn seed(store: &FakeClient<VirtualMachine>, vm: VirtualMachine) -> Arc<VirtualMachine> {
    Arc::new(store.insert(vm))
}

#[tokio::test]
async fn test_adopts_matching_orphan_once() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let orphan = seed(&store, orphan_vm("vm-0", labels(&[("app", "web")])));

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![orphan.clone()], matches_app("web"))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(store.count(Verb::Patch), 1);

    let Some(Patch::Merge(body)) = &store.calls_for(Verb::Patch)[0].patch else {
        panic!("adoption must be a merge patch");
    };
    assert_eq!(body["metadata"]["uid"], orphan.metadata.uid.as_str());

    // the adopted object now carries exactly one controller reference
    let adopted = store.object(NAMESPACE, "vm-0").unwrap();
    let controllers: Vec<_> = adopted
        .metadata
        .owner_references
        .iter()
        .filter(|r| r.is_controller())
        .collect();
    assert_eq!(controllers.len(), 1);
    assert_eq!(controllers[0].uid, web.metadata.uid);

    // a second pass over the now-owned object issues nothing
    store.clear_calls();
    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![Arc::new(adopted)], matches_app("web"))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_ignores_objects_owned_elsewhere() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let other = pool("other", 1);
    let foreign = seed(
        &store,
        owned_by(orphan_vm("vm-0", labels(&[("app", "web")])), &other),
    );

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![foreign], matches_app("web"))
        .await
        .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_non_controller_reference_does_not_grant_ownership() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let mut vm = orphan_vm("vm-0", labels(&[("app", "web")]));
    let mut weak = OwnerReference::controller_for(&web);
    weak.controller = Some(false);
    vm.metadata.owner_references.push(weak);
    let vm = seed(&store, vm);

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![vm], matches_app("web"))
        .await
        .unwrap();
    // treated as an orphan and adopted
    assert_eq!(claimed.len(), 1);
    assert_eq!(store.count(Verb::Patch), 1);
}

#[tokio::test]
async fn test_releases_owned_object_that_stopped_matching() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let drifted = seed(
        &store,
        owned_by(orphan_vm("vm-0", labels(&[("app", "db")])), &web),
    );

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![drifted], matches_app("web"))
        .await
        .unwrap();
    assert!(claimed.is_empty());
    assert!(store
        .object(NAMESPACE, "vm-0")
        .unwrap()
        .metadata
        .owner_references
        .is_empty());
}

#[tokio::test]
async fn test_release_tolerates_not_found_and_invalid() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let gone = Arc::new(owned_by(orphan_vm("gone", labels(&[])), &web));
    let reowned = seed(&store, owned_by(orphan_vm("reowned", labels(&[])), &web));
    store.fail(
        Verb::Patch,
        Some("reowned"),
        StoreError::Invalid("uid changed".into()),
    );

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![gone, reowned], matches_app("web"))
        .await
        .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(store.count(Verb::Patch), 2);
}

#[tokio::test]
async fn test_deleting_owner_neither_adopts_nor_releases() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let mut web = pool("web", 1);
    web.metadata.deletion_timestamp = Some(chrono::Utc::now());
    let orphan = seed(&store, orphan_vm("vm-0", labels(&[("app", "web")])));
    let drifted = seed(
        &store,
        owned_by(orphan_vm("vm-1", labels(&[("app", "db")])), &web),
    );

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![orphan, drifted], matches_app("web"))
        .await
        .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_deleting_orphan_is_not_adopted() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let mut vm = orphan_vm("vm-0", labels(&[("app", "web")]));
    vm.metadata.deletion_timestamp = Some(chrono::Utc::now());
    let vm = seed(&store, vm);

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let claimed = manager
        .claim_objects(vec![vm], matches_app("web"))
        .await
        .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_can_adopt_is_evaluated_once_and_memoized() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let can_adopt: CanAdoptFn = {
        let calls = Arc::clone(&calls);
        Box::new(move || -> CanAdoptFuture {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err("pool is going away".to_string()) })
        })
    };
    let a = seed(&store, orphan_vm("vm-0", labels(&[("app", "web")])));
    let b = seed(&store, orphan_vm("vm-1", labels(&[("app", "web")])));

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), can_adopt);
    let err = manager
        .claim_objects(vec![a, b], matches_app("web"))
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.errors().len(), 2);
    assert!(err
        .errors()
        .iter()
        .all(|e| matches!(e, ClaimError::CannotAdopt { .. })));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_adopt_rejected_when_object_was_replaced() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let stale = seed(&store, orphan_vm("vm-0", labels(&[("app", "web")])));

    // recreated under the same name with a new uid
    let mut replacement = (*stale).clone();
    replacement.metadata.uid = Uid::from("replacement");
    store.set(replacement);

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let err = manager
        .claim_objects(vec![stale], matches_app("web"))
        .await
        .unwrap_err();
    assert!(matches!(err.errors()[0], ClaimError::Adopt { .. }));
}

#[tokio::test]
async fn test_recheck_deletion_timestamp() {
    let pools: Arc<FakeClient<VirtualMachinePool>> = Arc::new(FakeClient::new());
    let live = pools.insert(pool("web", 1));

    let check = recheck_deletion_timestamp::<VirtualMachinePool>(
        pools.clone(),
        NAMESPACE.to_string(),
        "web".to_string(),
        live.metadata.uid.clone(),
    );
    assert!(check().await.is_ok());

    let mut deleting = live.clone();
    deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
    deleting.metadata.finalizers = vec!["keep".into()];
    pools.set(deleting);
    let err = check().await.unwrap_err();
    assert!(err.contains("has just been deleted"));

    let check_other_uid = recheck_deletion_timestamp::<VirtualMachinePool>(
        pools.clone(),
        NAMESPACE.to_string(),
        "web".to_string(),
        Uid::from("someone-else"),
    );
    assert!(check_other_uid().await.unwrap_err().contains("is gone"));

    pools.remove(NAMESPACE, "web");
    assert!(check().await.is_err());
    assert_eq!(pools.count(Verb::Get), 4);
}

#[tokio::test]
async fn test_other_adopt_errors_propagate() {
    let store: Arc<FakeClient<VirtualMachine>> = Arc::new(FakeClient::new());
    let web = pool("web", 1);
    let orphan = seed(&store, orphan_vm("vm-0", labels(&[("app", "web")])));
    store.fail(Verb::Patch, None, StoreError::Transport("reset".into()));

    let manager = ClaimManager::<VirtualMachine>::new(&web, store.clone(), always_ok());
    let err = manager
        .claim_objects(vec![orphan], matches_app("web"))
        .await
        .unwrap_err();
    assert_eq!(err.errors().len(), 1);
}
