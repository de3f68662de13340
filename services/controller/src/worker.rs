//! Worker pool shared by the controllers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, instrument};
use vmfleet_reconcile::WorkQueue;

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// A controller that processes one queue key per call.
#[async_trait]
pub trait QueueWorker: Clone + Send + Sync + 'static {
    fn queue(&self) -> &WorkQueue;

    /// Whether every cache the controller reads has completed a list.
    fn has_synced(&self) -> bool;

    /// Process one key. Returns false once the queue has shut down.
    async fn execute(&self) -> bool;
}

/// Wait for caches, run `threadiness` workers until `shutdown`, then drain.
#[instrument(skip(worker, shutdown), fields(queue = %worker.queue().name()))]
pub async fn run_workers<W: QueueWorker>(
    worker: W,
    threadiness: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(threadiness, "Starting controller");

    if !wait_for_cache_sync(&worker, &mut shutdown).await {
        info!("Stopped before caches synced");
        worker.queue().shut_down();
        return;
    }

    let handles: Vec<_> = (0..threadiness.max(1))
        .map(|_| {
            let worker = worker.clone();
            tokio::spawn(async move { while worker.execute().await {} })
        })
        .collect();

    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("Stopping controller");
    worker.queue().shut_down();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }
}

async fn wait_for_cache_sync<W: QueueWorker>(
    worker: &W,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut poll = tokio::time::interval(CACHE_SYNC_POLL);
    loop {
        if *shutdown.borrow() {
            return false;
        }
        if worker.has_synced() {
            return true;
        }
        tokio::select! {
            _ = poll.tick() => {}
            res = shutdown.changed() => {
                if res.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct Counter {
        queue: WorkQueue,
        synced: Arc<AtomicBool>,
        processed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueueWorker for Counter {
        fn queue(&self) -> &WorkQueue {
            &self.queue
        }

        fn has_synced(&self) -> bool {
            self.synced.load(Ordering::SeqCst)
        }

        async fn execute(&self) -> bool {
            let Some(key) = self.queue.get().await else {
                return false;
            };
            self.processed.fetch_add(1, Ordering::SeqCst);
            self.queue.done(&key);
            true
        }
    }

    fn counter() -> Counter {
        Counter {
            queue: WorkQueue::new("test"),
            synced: Arc::new(AtomicBool::new(false)),
            processed: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_start_after_sync_and_stop_on_shutdown() {
        let worker = counter();
        worker.queue.add("default/a");
        worker.queue.add("default/b");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_workers(worker.clone(), 2, rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(worker.processed.load(Ordering::SeqCst), 0);

        worker.synced.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(worker.processed.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(worker.queue.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_sync() {
        let worker = counter();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_workers(worker.clone(), 1, rx));

        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(worker.queue.is_shutting_down());
        assert_eq!(worker.processed.load(Ordering::SeqCst), 0);
    }
}
