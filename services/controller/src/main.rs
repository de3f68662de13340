//! vmfleet fleet controller
//!
//! Watches pools and replica sets on the object store and converges their
//! members towards the declared state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfleet_api::Resource;
use vmfleet_controller::{Config, Context, ControllerRegistry, HttpClient, Informers};
use vmfleet_reconcile::{Clientset, LogRecorder, ResourceClient};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_url = %config.api_url,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        controllers = ?config.controllers,
        burst_replicas = config.burst_replicas,
        "Starting vmfleet controller"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;
    let clientset = Clientset {
        pools: client(&http, &config),
        vms: client(&http, &config),
        vmis: client(&http, &config),
        revisions: client(&http, &config),
        replicasets: client(&http, &config),
    };

    let informers = Informers::new(&clientset, config.namespace.clone(), config.resync_interval);
    let ctx = Context {
        clientset,
        informers: informers.clone(),
        recorder: Arc::new(LogRecorder),
        config: config.clone(),
    };
    let controllers = ControllerRegistry::with_defaults().build(&config.controllers, &ctx)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles: Vec<JoinHandle<()>> = informers.spawn(&shutdown_rx);
    for controller in controllers {
        let threadiness = config.threads_for(controller.name());
        info!(controller = controller.name(), threadiness, "Starting controller");
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            controller.run(threadiness, shutdown_rx).await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    for handle in handles {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Task panicked during shutdown"),
            Err(_) => warn!("Task did not stop in time"),
        }
    }

    info!("Controller shutdown complete");
    Ok(())
}

fn client<K: Resource>(http: &reqwest::Client, config: &Config) -> Arc<dyn ResourceClient<K>> {
    Arc::new(HttpClient::with_client(
        http.clone(),
        &config.api_url,
        config.token.clone(),
    ))
}
