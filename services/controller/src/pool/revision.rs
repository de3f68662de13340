use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};
use vmfleet_api::{
    ControllerRevision, ObjectMeta, OwnerReference, PoolSpec, Resource, VirtualMachine,
    VirtualMachinePool, POOL_REVISION_LABEL,
};
use vmfleet_reconcile::{DeleteOptions, SyncError};

use super::template::revision_name;
use super::PoolController;
use crate::error::MemberError;
use crate::reasons::FAILED_REVISION_PRUNING;

/// Snapshot of `pool`'s spec at its current generation.
pub fn build_revision(pool: &VirtualMachinePool) -> Result<ControllerRevision, serde_json::Error> {
    let mut metadata = ObjectMeta::named(&pool.metadata.namespace, revision_name(pool));
    metadata.owner_references = vec![OwnerReference::controller_for(pool)];
    Ok(ControllerRevision {
        metadata,
        data: serde_json::to_value(&pool.spec)?,
        revision: pool.metadata.generation,
    })
}

impl PoolController {
    /// Pool spec recorded in the cached revision `name`.
    pub(super) fn revision_spec(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PoolSpec>, MemberError> {
        let Some(revision) = self.revisions.get(namespace, name) else {
            return Ok(None);
        };
        serde_json::from_value(revision.data.clone())
            .map(Some)
            .map_err(|source| MemberError::Revision {
                name: name.to_string(),
                source,
            })
    }

    /// Make sure the revision for the pool's current generation exists and
    /// return its name.
    pub(super) async fn ensure_revision(
        &self,
        pool: &VirtualMachinePool,
    ) -> Result<String, MemberError> {
        let name = revision_name(pool);
        if self.revisions.get(&pool.metadata.namespace, &name).is_some() {
            return Ok(name);
        }

        let revision = build_revision(pool)?;
        let key = pool.key();
        self.expectations.raise_expectations(&key, 1, 0);
        if let Err(err) = self.clientset.revisions.create(&revision).await {
            self.expectations.creation_observed(&key);
            return Err(err.into());
        }
        info!(pool = %key, revision = %name, "Created revision");
        Ok(name)
    }

    /// Delete owned revisions no member VM or instance is labeled with.
    pub(super) async fn prune_revisions(
        &self,
        pool: &VirtualMachinePool,
        vms: &[Arc<VirtualMachine>],
    ) -> Result<(), SyncError> {
        let namespace = &pool.metadata.namespace;
        let mut unused: BTreeSet<String> = self
            .revisions
            .by_owner(&pool.metadata.uid)
            .iter()
            .filter(|r| &r.metadata.namespace == namespace)
            .map(|r| r.metadata.name.clone())
            .collect();

        for vm in vms {
            if let Some(name) = vm.metadata.labels.get(POOL_REVISION_LABEL) {
                unused.remove(name);
            }
            if let Some(vmi) = self.vmis.get(namespace, &vm.metadata.name) {
                if let Some(name) = vmi.metadata.labels.get(POOL_REVISION_LABEL) {
                    unused.remove(name);
                }
            }
        }

        for name in unused {
            match self
                .clientset
                .revisions
                .delete(namespace, &name, &DeleteOptions::default())
                .await
            {
                Ok(()) => info!(pool = %pool.key(), revision = %name, "Pruned revision"),
                Err(e) if e.is_not_found() => {
                    debug!(revision = %name, "Revision already gone")
                }
                Err(e) => {
                    return Err(SyncError::new(
                        FAILED_REVISION_PRUNING,
                        format!("error pruning revision {name}: {e}"),
                    ))
                }
            }
        }
        Ok(())
    }
}
