//! Typed access to the remote object store.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use vmfleet_api::{
    ControllerRevision, Resource, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceReplicaSet, VirtualMachinePool,
};

use crate::{Patch, StoreError};

/// How dependents are handled when an object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropagationPolicy {
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation_policy: Option<PropagationPolicy>,
}

impl DeleteOptions {
    /// Delete only after dependents are gone.
    pub fn foreground() -> Self {
        Self {
            propagation_policy: Some(PropagationPolicy::Foreground),
        }
    }
}

/// Namespaced CRUD for one kind.
///
/// Every call is a network round-trip; nothing here reads the local cache.
#[async_trait]
pub trait ResourceClient<K: Resource>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// List objects, across all namespaces when `namespace` is `None`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Write the status subresource only.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    async fn patch(&self, namespace: &str, name: &str, patch: &Patch) -> Result<K, StoreError>;

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), StoreError>;
}

/// One client per kind the controllers touch.
#[derive(Clone)]
pub struct Clientset {
    pub pools: Arc<dyn ResourceClient<VirtualMachinePool>>,
    pub vms: Arc<dyn ResourceClient<VirtualMachine>>,
    pub vmis: Arc<dyn ResourceClient<VirtualMachineInstance>>,
    pub revisions: Arc<dyn ResourceClient<ControllerRevision>>,
    pub replicasets: Arc<dyn ResourceClient<VirtualMachineInstanceReplicaSet>>,
}

impl fmt::Debug for Clientset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clientset").finish_non_exhaustive()
    }
}
