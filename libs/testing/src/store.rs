//! In-memory object store implementing [`ResourceClient`].

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use vmfleet_api::{
    namespaced_key, ControllerRevision, Resource, Uid, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceReplicaSet, VirtualMachinePool,
};
use vmfleet_reconcile::{Clientset, DeleteOptions, Patch, ResourceClient, StoreError};

use crate::json::{apply_json, apply_merge};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Store operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

impl Verb {
    /// Whether the verb changes stored state.
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Get | Self::List)
    }
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct Call {
    pub verb: Verb,
    pub namespace: String,
    pub name: String,
    pub patch: Option<Patch>,
    pub delete_options: Option<DeleteOptions>,
}

#[derive(Debug, Clone)]
struct Failure {
    verb: Verb,
    name: Option<String>,
    error: StoreError,
}

/// Fake store for one kind.
///
/// Behaves like a Kubernetes-style API server where it matters to the
/// controllers: UIDs and resource versions are assigned on write, deletes of
/// objects with finalizers only set the deletion timestamp, and an object
/// marked for deletion disappears once its last finalizer is removed.
#[derive(Debug)]
pub struct FakeClient<K> {
    objects: Mutex<BTreeMap<String, K>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<Failure>>,
    counter: AtomicU64,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> Default for FakeClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> FakeClient<K> {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            _kind: PhantomData,
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, verb: Verb, namespace: &str, name: &str) {
        self.record_call(Call {
            verb,
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch: None,
            delete_options: None,
        });
    }

    fn record_call(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    fn check_failure(&self, verb: Verb, name: &str) -> Result<(), StoreError> {
        let failures = lock(&self.failures);
        match failures
            .iter()
            .find(|f| f.verb == verb && f.name.as_deref().is_none_or(|n| n == name))
        {
            Some(f) => Err(f.error.clone()),
            None => Ok(()),
        }
    }

    fn not_found(name: &str) -> StoreError {
        StoreError::not_found(K::KIND, name)
    }

    fn from_value(value: Value) -> Result<K, StoreError> {
        serde_json::from_value(value).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    /// Bump the resource version and drop the object if its deletion is complete.
    fn commit(&self, objects: &mut BTreeMap<String, K>, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(self.next().to_string());
        let key = obj.key();
        let meta = obj.meta();
        if meta.is_deleting() && meta.finalizers.is_empty() {
            objects.remove(&key);
        } else {
            objects.insert(key, obj.clone());
        }
        obj
    }

    /// Make every `verb` call (optionally only for `name`) fail with `error`.
    pub fn fail(&self, verb: Verb, name: Option<&str>, error: StoreError) {
        lock(&self.failures).push(Failure {
            verb,
            name: name.map(str::to_string),
            error,
        });
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Every call, in order.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Calls made with `verb`.
    pub fn calls_for(&self, verb: Verb) -> Vec<Call> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.verb == verb)
            .cloned()
            .collect()
    }

    /// Number of calls made with `verb`.
    pub fn count(&self, verb: Verb) -> usize {
        lock(&self.calls).iter().filter(|c| c.verb == verb).count()
    }

    /// Number of calls that write.
    pub fn write_count(&self) -> usize {
        lock(&self.calls).iter().filter(|c| c.verb.is_write()).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Seed an object without recording a call. Missing UID and resource
    /// version are filled in.
    pub fn insert(&self, mut obj: K) -> K {
        let n = self.next();
        let meta = obj.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = Uid::from(format!("{}-uid-{n}", K::PLURAL));
        }
        if meta.resource_version.is_none() {
            meta.resource_version = Some(n.to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }
        lock(&self.objects).insert(obj.key(), obj.clone());
        obj
    }

    /// Overwrite an object as an outside actor would, bumping its resource version.
    pub fn set(&self, obj: K) -> K {
        let mut objects = lock(&self.objects);
        self.commit(&mut objects, obj)
    }

    /// Stored copy of one object.
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects)
            .get(&namespaced_key(namespace, name))
            .cloned()
    }

    /// Every stored object.
    pub fn objects(&self) -> Vec<K> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Drop an object without recording a call.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects).remove(&namespaced_key(namespace, name))
    }
}

#[async_trait]
impl<K: Resource> ResourceClient<K> for FakeClient<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.record(Verb::Get, namespace, name);
        self.check_failure(Verb::Get, name)?;
        self.object(namespace, name)
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.record(Verb::List, namespace.unwrap_or_default(), "");
        self.check_failure(Verb::List, "")?;
        Ok(self
            .objects()
            .into_iter()
            .filter(|o| namespace.is_none_or(|ns| o.meta().namespace == ns))
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.meta();
        self.record(Verb::Create, &meta.namespace, &meta.name);
        let requested = if meta.name.is_empty() {
            &meta.generate_name
        } else {
            &meta.name
        };
        self.check_failure(Verb::Create, requested)?;

        let mut obj = obj.clone();
        let n = self.next();
        let meta = obj.meta_mut();
        if meta.name.is_empty() {
            if meta.generate_name.is_empty() {
                return Err(StoreError::Invalid(
                    "name or generateName is required".to_string(),
                ));
            }
            meta.name = format!("{}{:05x}", meta.generate_name, n);
        }
        meta.uid = Uid::from(format!("{}-uid-{n}", K::PLURAL));
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        let mut objects = lock(&self.objects);
        if objects.contains_key(&obj.key()) {
            return Err(StoreError::AlreadyExists {
                kind: K::KIND.to_string(),
                name: obj.meta().name.clone(),
            });
        }
        Ok(self.commit(&mut objects, obj))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.meta();
        self.record(Verb::Update, &meta.namespace, &meta.name);
        self.check_failure(Verb::Update, &meta.name)?;

        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&obj.key())
            .cloned()
            .ok_or_else(|| Self::not_found(&meta.name))?;
        let old_meta = existing.meta();
        if meta.resource_version.is_some() && meta.resource_version != old_meta.resource_version {
            return Err(StoreError::Conflict(format!(
                "{} {:?} was modified",
                K::KIND,
                meta.name
            )));
        }

        let old_value = serde_json::to_value(&existing)?;
        let mut new_value = serde_json::to_value(obj)?;
        // status is only written through the status subresource
        match old_value.get("status") {
            Some(status) => new_value["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut new_value {
                    map.remove("status");
                }
            }
        }
        let spec_changed = old_value.get("spec") != new_value.get("spec");

        let mut updated = Self::from_value(new_value)?;
        let new_meta = updated.meta_mut();
        new_meta.uid = old_meta.uid.clone();
        new_meta.creation_timestamp = old_meta.creation_timestamp;
        new_meta.deletion_timestamp = old_meta.deletion_timestamp;
        new_meta.generation = old_meta.generation + i64::from(spec_changed);
        Ok(self.commit(&mut objects, updated))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.meta();
        self.record(Verb::UpdateStatus, &meta.namespace, &meta.name);
        self.check_failure(Verb::UpdateStatus, &meta.name)?;

        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&obj.key())
            .cloned()
            .ok_or_else(|| Self::not_found(&meta.name))?;
        if meta.resource_version.is_some()
            && meta.resource_version != existing.meta().resource_version
        {
            return Err(StoreError::Conflict(format!(
                "{} {:?} was modified",
                K::KIND,
                meta.name
            )));
        }

        let mut value = serde_json::to_value(&existing)?;
        let new_value = serde_json::to_value(obj)?;
        value["status"] = new_value.get("status").cloned().unwrap_or(Value::Null);
        let updated = Self::from_value(value)?;
        Ok(self.commit(&mut objects, updated))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Patch) -> Result<K, StoreError> {
        self.record_call(Call {
            verb: Verb::Patch,
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch: Some(patch.clone()),
            delete_options: None,
        });
        self.check_failure(Verb::Patch, name)?;

        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&namespaced_key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found(name))?;
        let uid = existing.meta().uid.clone();
        let mut value = serde_json::to_value(&existing)?;

        match patch {
            Patch::Merge(body) => {
                if let Some(want) = body.pointer("/metadata/uid").and_then(Value::as_str) {
                    if want != uid.as_str() {
                        return Err(StoreError::Conflict(format!(
                            "uid precondition failed for {} {name:?}: have {uid}, want {want}",
                            K::KIND
                        )));
                    }
                }
                apply_merge(&mut value, body);
            }
            Patch::Json(ops) => apply_json(&mut value, ops)?,
        }

        let mut patched = Self::from_value(value)?;
        patched.meta_mut().uid = uid;
        Ok(self.commit(&mut objects, patched))
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), StoreError> {
        self.record_call(Call {
            verb: Verb::Delete,
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch: None,
            delete_options: Some(options.clone()),
        });
        self.check_failure(Verb::Delete, name)?;

        let mut objects = lock(&self.objects);
        let mut existing = objects
            .get(&namespaced_key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found(name))?;
        let meta = existing.meta_mut();
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Utc::now());
        }
        self.commit(&mut objects, existing);
        Ok(())
    }
}

/// One fake per kind, plus the matching [`Clientset`].
#[derive(Debug, Clone, Default)]
pub struct FakeClientset {
    pub pools: Arc<FakeClient<VirtualMachinePool>>,
    pub vms: Arc<FakeClient<VirtualMachine>>,
    pub vmis: Arc<FakeClient<VirtualMachineInstance>>,
    pub revisions: Arc<FakeClient<ControllerRevision>>,
    pub replicasets: Arc<FakeClient<VirtualMachineInstanceReplicaSet>>,
}

impl FakeClientset {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `Clientset` whose clients are these fakes.
    pub fn clientset(&self) -> Clientset {
        Clientset {
            pools: self.pools.clone(),
            vms: self.vms.clone(),
            vmis: self.vmis.clone(),
            revisions: self.revisions.clone(),
            replicasets: self.replicasets.clone(),
        }
    }

    /// Writes across every kind.
    pub fn write_count(&self) -> usize {
        self.pools.write_count()
            + self.vms.write_count()
            + self.vmis.write_count()
            + self.revisions.write_count()
            + self.replicasets.write_count()
    }

    pub fn clear_calls(&self) {
        self.pools.clear_calls();
        self.vms.clear_calls();
        self.vmis.clear_calls();
        self.revisions.clear_calls();
        self.replicasets.clear_calls();
    }
}
