//! Ownership claims: adopt matching orphans, release non-matching children.
//!
//! The claim protocol is the only thing that writes controller owner
//! references onto existing children. Correctness under racing controllers
//! comes from the store, not local locks: adoption carries the child UID and
//! the store rejects the patch if the object was replaced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info};
use vmfleet_api::{OwnerReference, Resource, Uid};

use crate::patch::{adopt_patch, release_patch};
use crate::{AggregateError, ClaimError, ResourceClient};

/// Boxed future returned by an adoption precheck.
pub type CanAdoptFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Adoption precheck; evaluated at most once per [`ClaimManager`].
pub type CanAdoptFn = Box<dyn Fn() -> CanAdoptFuture + Send + Sync>;

/// Precheck that re-reads the owner from the store, bypassing the cache.
///
/// Fails if the owner is gone, was replaced by a new object with the same
/// name, or has started deleting since it was read from the cache.
pub fn recheck_deletion_timestamp<P: Resource>(
    client: Arc<dyn ResourceClient<P>>,
    namespace: String,
    name: String,
    uid: Uid,
) -> CanAdoptFn {
    Box::new(move || -> CanAdoptFuture {
        let client = Arc::clone(&client);
        let namespace = namespace.clone();
        let name = name.clone();
        let uid = uid.clone();
        Box::pin(async move {
            let fresh = client
                .get(&namespace, &name)
                .await
                .map_err(|e| e.to_string())?;
            let meta = fresh.meta();
            if meta.uid != uid {
                return Err(format!(
                    "original {} {}/{} is gone: got uid {}, wanted {}",
                    P::KIND,
                    namespace,
                    name,
                    meta.uid,
                    uid
                ));
            }
            if let Some(ts) = meta.deletion_timestamp {
                return Err(format!(
                    "{} {}/{} has just been deleted at {}",
                    P::KIND,
                    namespace,
                    name,
                    ts
                ));
            }
            Ok(())
        })
    })
}

/// Settles controller ownership of children of kind `K` for one owner.
///
/// Build one per reconcile pass; the precheck result is memoized for the
/// manager's lifetime.
pub struct ClaimManager<K: Resource> {
    owner: OwnerReference,
    owner_deleting: bool,
    client: Arc<dyn ResourceClient<K>>,
    can_adopt: CanAdoptFn,
    can_adopt_result: OnceCell<Result<(), String>>,
}

impl<K: Resource> ClaimManager<K> {
    /// Manager claiming on behalf of `owner`.
    pub fn new<P: Resource>(
        owner: &P,
        client: Arc<dyn ResourceClient<K>>,
        can_adopt: CanAdoptFn,
    ) -> Self {
        Self {
            owner: OwnerReference::controller_for(owner),
            owner_deleting: owner.meta().is_deleting(),
            client,
            can_adopt,
            can_adopt_result: OnceCell::new(),
        }
    }

    /// Claim `candidates` for the owner.
    ///
    /// Returns the children that are (or have just become) owned and
    /// matching. Per-candidate failures are collected; any failure means the
    /// caller must requeue.
    pub async fn claim_objects<F>(
        &self,
        candidates: Vec<Arc<K>>,
        match_fn: F,
    ) -> Result<Vec<Arc<K>>, AggregateError>
    where
        F: Fn(&K) -> bool,
    {
        let mut claimed = Vec::new();
        let mut errors = Vec::new();

        for obj in candidates {
            match self.claim_object(&obj, &match_fn).await {
                Ok(true) => claimed.push(obj),
                Ok(false) => {}
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(claimed)
        } else {
            Err(AggregateError(errors))
        }
    }

    async fn claim_object<F>(&self, obj: &K, match_fn: &F) -> Result<bool, ClaimError>
    where
        F: Fn(&K) -> bool,
    {
        let meta = obj.meta();

        if let Some(controller) = meta.controller_ref() {
            if controller.uid != self.owner.uid {
                return Ok(false);
            }
            if match_fn(obj) {
                return Ok(true);
            }
            if self.owner_deleting {
                return Ok(false);
            }
            self.release(obj).await?;
            return Ok(false);
        }

        if self.owner_deleting || !match_fn(obj) || meta.is_deleting() {
            return Ok(false);
        }
        self.adopt(obj).await?;
        Ok(true)
    }

    async fn can_adopt(&self) -> Result<(), String> {
        self.can_adopt_result
            .get_or_init(|| (self.can_adopt)())
            .await
            .clone()
    }

    /// Make the owner the controller of `obj`. A vanished object is not an error.
    pub async fn adopt(&self, obj: &K) -> Result<(), ClaimError> {
        let key = obj.key();
        if let Err(reason) = self.can_adopt().await {
            return Err(ClaimError::CannotAdopt { key, reason });
        }

        let meta = obj.meta();
        info!(
            owner = %self.owner.name,
            kind = K::KIND,
            child = %key,
            "Adopting orphan"
        );
        let patch = adopt_patch(&self.owner, &meta.uid);
        match self.client.patch(&meta.namespace, &meta.name, &patch).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(source) => Err(ClaimError::Adopt { key, source }),
        }
    }

    /// Drop all owner references from `obj`.
    ///
    /// NotFound and Invalid are ignored: the object is gone or was re-owned.
    pub async fn release(&self, obj: &K) -> Result<(), ClaimError> {
        let meta = obj.meta();
        let key = obj.key();
        debug!(
            owner = %self.owner.name,
            kind = K::KIND,
            child = %key,
            "Releasing child that no longer matches"
        );
        match self
            .client
            .patch(&meta.namespace, &meta.name, &release_patch())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() || err.is_invalid() => Ok(()),
            Err(source) => Err(ClaimError::Release { key, source }),
        }
    }
}
