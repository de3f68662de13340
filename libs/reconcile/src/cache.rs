//! Indexed local mirror of one object kind.
//!
//! The store is fed by a reflector and read by controllers. Reads hand out
//! `Arc`s; callers clone before mutating.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use vmfleet_api::{namespaced_key, Resource, Uid};

/// A change applied to the store by [`Store::replace`].
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

#[derive(Debug)]
struct Indexes<K> {
    objects: HashMap<String, Arc<K>>,
    by_namespace: HashMap<String, BTreeSet<String>>,
    by_owner: HashMap<Uid, BTreeSet<String>>,
}

impl<K> Default for Indexes<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            by_namespace: HashMap::new(),
            by_owner: HashMap::new(),
        }
    }
}

impl<K: Resource> Indexes<K> {
    fn insert(&mut self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = obj.key();
        let old = self.remove(&key);
        let meta = obj.meta();
        self.by_namespace
            .entry(meta.namespace.clone())
            .or_default()
            .insert(key.clone());
        if let Some(owner) = meta.controller_ref() {
            self.by_owner
                .entry(owner.uid.clone())
                .or_default()
                .insert(key.clone());
        }
        self.objects.insert(key, obj);
        old
    }

    fn remove(&mut self, key: &str) -> Option<Arc<K>> {
        let old = self.objects.remove(key)?;
        let meta = old.meta();
        if let Some(keys) = self.by_namespace.get_mut(&meta.namespace) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_namespace.remove(&meta.namespace);
            }
        }
        if let Some(owner) = meta.controller_ref() {
            if let Some(keys) = self.by_owner.get_mut(&owner.uid) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_owner.remove(&owner.uid);
                }
            }
        }
        Some(old)
    }

    fn collect<'a>(&self, keys: impl Iterator<Item = &'a String>) -> Vec<Arc<K>> {
        keys.filter_map(|k| self.objects.get(k).cloned()).collect()
    }
}

/// Thread-safe, indexed object store for kind `K`.
#[derive(Debug)]
pub struct Store<K> {
    indexes: RwLock<Indexes<K>>,
    synced: AtomicBool,
}

impl<K: Resource> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            synced: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexes<K>> {
        self.indexes.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes<K>> {
        self.indexes.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Object at `namespace/name` key.
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.read().objects.get(key).cloned()
    }

    /// Object by namespace and name.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_by_key(&namespaced_key(namespace, name))
    }

    /// All objects in `namespace`, ordered by key.
    pub fn by_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        let indexes = self.read();
        match indexes.by_namespace.get(namespace) {
            Some(keys) => indexes.collect(keys.iter()),
            None => Vec::new(),
        }
    }

    /// All objects whose controller reference carries `uid`, ordered by key.
    pub fn by_owner(&self, uid: &Uid) -> Vec<Arc<K>> {
        let indexes = self.read();
        match indexes.by_owner.get(uid) {
            Some(keys) => indexes.collect(keys.iter()),
            None => Vec::new(),
        }
    }

    /// Every cached object.
    pub fn list(&self) -> Vec<Arc<K>> {
        let indexes = self.read();
        let mut keys: Vec<&String> = indexes.objects.keys().collect();
        keys.sort();
        indexes.collect(keys.into_iter())
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite; returns the previous object.
    pub fn upsert(&self, obj: K) -> Option<Arc<K>> {
        self.write().insert(Arc::new(obj))
    }

    /// Drop the object at `key`, returning it.
    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        self.write().remove(key)
    }

    /// Replace the full contents with `objects` and report what changed.
    ///
    /// An object present before and after counts as updated only when its
    /// resource version differs.
    pub fn replace(&self, objects: Vec<K>) -> Vec<Change<K>> {
        let mut indexes = self.write();
        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();

        for obj in objects {
            let obj = Arc::new(obj);
            let key = obj.key();
            seen.insert(key.clone());
            let new_rv = obj.meta().resource_version.clone();
            match indexes.insert(Arc::clone(&obj)) {
                None => changes.push(Change::Added(obj)),
                Some(old) if old.meta().resource_version != new_rv => {
                    changes.push(Change::Updated { old, new: obj })
                }
                Some(_) => {}
            }
        }

        let stale: Vec<String> = indexes
            .objects
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(old) = indexes.remove(&key) {
                changes.push(Change::Deleted(old));
            }
        }
        changes
    }

    /// Whether a full list has been loaded.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Record that a full list has been loaded.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}
