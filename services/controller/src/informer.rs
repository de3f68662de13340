//! Polling reflectors feeding the local caches.
//!
//! Each reflector relists one kind on an interval, replaces its [`Store`]
//! and hands the resulting changes to the registered handlers. Handlers run
//! synchronously on the reflector task and must not block.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use vmfleet_api::{
    ControllerRevision, Resource, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceReplicaSet, VirtualMachinePool,
};
use vmfleet_reconcile::{Change, Clientset, ResourceClient, Store, StoreError};

type Handler<K> = Box<dyn Fn(&Change<K>) + Send + Sync>;

/// Keeps one `Store` in step with the object store by relisting.
pub struct Reflector<K: Resource> {
    client: Arc<dyn ResourceClient<K>>,
    store: Arc<Store<K>>,
    namespace: Option<String>,
    interval: Duration,
    handlers: Mutex<Vec<Handler<K>>>,
}

impl<K: Resource> Reflector<K> {
    pub fn new(
        client: Arc<dyn ResourceClient<K>>,
        namespace: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store: Arc::new(Store::new()),
            namespace,
            interval,
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// The store this reflector fills.
    pub fn store(&self) -> Arc<Store<K>> {
        Arc::clone(&self.store)
    }

    /// Register a handler for every future change.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&Change<K>) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(handler));
    }

    /// List once, update the store and dispatch. Returns the number of changes.
    pub async fn sync_once(&self) -> Result<usize, StoreError> {
        let objects = self.client.list(self.namespace.as_deref()).await?;
        let changes = self.store.replace(objects);
        self.store.mark_synced();

        let handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        for change in &changes {
            for handler in handlers.iter() {
                handler(change);
            }
        }
        if !changes.is_empty() {
            debug!(kind = K::KIND, changes = changes.len(), "Cache updated");
        }
        Ok(changes.len())
    }

    /// Relist until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(kind = K::KIND))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reflector"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %e, "Relist failed");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Reflector shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// One reflector per kind the controllers watch.
#[derive(Clone)]
pub struct Informers {
    pub pools: Arc<Reflector<VirtualMachinePool>>,
    pub vms: Arc<Reflector<VirtualMachine>>,
    pub vmis: Arc<Reflector<VirtualMachineInstance>>,
    pub revisions: Arc<Reflector<ControllerRevision>>,
    pub replicasets: Arc<Reflector<VirtualMachineInstanceReplicaSet>>,
}

impl Informers {
    pub fn new(clientset: &Clientset, namespace: Option<String>, interval: Duration) -> Self {
        Self {
            pools: Arc::new(Reflector::new(
                Arc::clone(&clientset.pools),
                namespace.clone(),
                interval,
            )),
            vms: Arc::new(Reflector::new(
                Arc::clone(&clientset.vms),
                namespace.clone(),
                interval,
            )),
            vmis: Arc::new(Reflector::new(
                Arc::clone(&clientset.vmis),
                namespace.clone(),
                interval,
            )),
            revisions: Arc::new(Reflector::new(
                Arc::clone(&clientset.revisions),
                namespace.clone(),
                interval,
            )),
            replicasets: Arc::new(Reflector::new(
                Arc::clone(&clientset.replicasets),
                namespace,
                interval,
            )),
        }
    }

    /// Relist every kind once. Parents go first so child handlers can
    /// resolve their owners.
    pub async fn sync_all(&self) -> Result<(), StoreError> {
        self.pools.sync_once().await?;
        self.replicasets.sync_once().await?;
        self.revisions.sync_once().await?;
        self.vms.sync_once().await?;
        self.vmis.sync_once().await?;
        Ok(())
    }

    /// Spawn one relist task per kind.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            spawn_reflector(Arc::clone(&self.pools), shutdown.clone()),
            spawn_reflector(Arc::clone(&self.replicasets), shutdown.clone()),
            spawn_reflector(Arc::clone(&self.revisions), shutdown.clone()),
            spawn_reflector(Arc::clone(&self.vms), shutdown.clone()),
            spawn_reflector(Arc::clone(&self.vmis), shutdown.clone()),
        ]
    }
}

fn spawn_reflector<K: Resource>(
    reflector: Arc<Reflector<K>>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move { reflector.run(shutdown).await })
}
