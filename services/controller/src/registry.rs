//! Controller registry and the shared construction context.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use vmfleet_reconcile::{Clientset, EventRecorder};

use crate::config::Config;
use crate::informer::Informers;
use crate::pool::PoolController;
use crate::replicaset::ReplicaSetController;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown controller {0:?}")]
    UnknownController(String),
}

/// Everything a controller needs at construction time.
#[derive(Clone)]
pub struct Context {
    pub clientset: Clientset,
    pub informers: Informers,
    pub recorder: Arc<dyn EventRecorder>,
    pub config: Config,
}

#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `threadiness` workers until `shutdown` flips to true.
    async fn run(&self, threadiness: usize, shutdown: watch::Receiver<bool>);
}

pub type Constructor = fn(&Context) -> Arc<dyn Controller>;

/// Named controller constructors, built once at startup.
#[derive(Default)]
pub struct ControllerRegistry {
    constructors: Vec<(&'static str, Constructor)>,
}

impl ControllerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the pool and replica set controllers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("pool", pool_controller)
            .register("replicaset", replicaset_controller);
        registry
    }

    /// Add or replace a constructor.
    pub fn register(&mut self, name: &'static str, constructor: Constructor) -> &mut Self {
        match self.constructors.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = constructor,
            None => self.constructors.push((name, constructor)),
        }
        self
    }

    /// Registered controller names, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.iter().map(|(n, _)| *n).collect()
    }

    /// Construct the controllers named in `names`, in that order.
    pub fn build(
        &self,
        names: &[String],
        ctx: &Context,
    ) -> Result<Vec<Arc<dyn Controller>>, RegistryError> {
        names
            .iter()
            .map(|name| {
                self.constructors
                    .iter()
                    .find(|(n, _)| *n == name.as_str())
                    .map(|(_, constructor)| constructor(ctx))
                    .ok_or_else(|| RegistryError::UnknownController(name.clone()))
            })
            .collect()
    }
}

fn pool_controller(ctx: &Context) -> Arc<dyn Controller> {
    Arc::new(PoolController::from_context(ctx))
}

fn replicaset_controller(ctx: &Context) -> Arc<dyn Controller> {
    Arc::new(ReplicaSetController::from_context(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vmfleet_testing::{FakeClientset, FakeRecorder};

    fn context() -> Context {
        let fake = FakeClientset::new();
        let clientset = fake.clientset();
        Context {
            informers: Informers::new(&clientset, None, Duration::from_secs(5)),
            clientset,
            recorder: Arc::new(FakeRecorder::new()),
            config: Config::default(),
        }
    }

    struct Noop;

    #[async_trait]
    impl Controller for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn run(&self, _threadiness: usize, _shutdown: watch::Receiver<bool>) {}
    }

    #[test]
    fn test_defaults_build_in_requested_order() {
        let registry = ControllerRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["pool", "replicaset"]);

        let built = registry
            .build(&["replicaset".to_string(), "pool".to_string()], &context())
            .unwrap();
        let names: Vec<_> = built.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["replicaset", "pool"]);
    }

    #[test]
    fn test_unknown_controller() {
        let registry = ControllerRegistry::with_defaults();
        let err = registry
            .build(&["migration".to_string()], &context())
            .err()
            .unwrap();
        assert_eq!(err, RegistryError::UnknownController("migration".into()));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = ControllerRegistry::with_defaults();
        fn noop(_: &Context) -> Arc<dyn Controller> {
            Arc::new(Noop)
        }
        registry.register("pool", noop);
        assert_eq!(registry.names().len(), 2);

        let built = registry.build(&["pool".to_string()], &context()).unwrap();
        assert_eq!(built[0].name(), "noop");
    }
}
