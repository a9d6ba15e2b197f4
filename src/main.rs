use crate::config::{build_globset, load_config};
use crate::controller::Observer;
use crate::fanout::Fanout;
use crate::image::NotificationEvent;
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiterRegistry;
use crate::registry_store::RegistryStore;
use crate::repository::MemoryRepository;
use crate::state::{ControllerContext, WorkerContext};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod controller;
mod error;
mod fanout;
mod image;
mod image_reference;
mod metrics;
mod oci_registry;
mod pull_secrets;
mod rate_limiter;
mod registry_store;
mod repository;
mod secret_string;
mod state;
mod tag_matcher;
mod webserver;
mod worker;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-tag-tracker {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "/config/config.yaml".to_string());
    let config = Arc::new(load_config(&config_path)?);

    let root = CancellationToken::new();
    let metrics = Arc::new(Metrics::new()?);

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (fanout, fanout_task) = Fanout::spawn(events_rx, root.clone());
    let (subscriber_tx, subscriber_rx) = mpsc::channel(EVENT_BUFFER);
    fanout.notify(subscriber_tx);
    tokio::spawn(log_notifications(subscriber_rx));

    let worker_ctx = WorkerContext {
        http_client: oci_registry::create_client(&config)?,
        repository: Arc::new(MemoryRepository::new()),
        limiters: Arc::new(RateLimiterRegistry::new(config.registry_requests_per_second)),
        events: events_tx,
        metrics: metrics.clone(),
        poll_interval: config.poll_interval(),
        plain_http_registries: build_globset(&config.plain_http_registries)?,
    };
    let store = Arc::new(RegistryStore::new(worker_ctx, root.clone()));

    let kube_client = controller::create_client().await?;
    let observer = Arc::new(Observer::new(ControllerContext {
        kube_client,
        exclude_images: build_globset(&config.exclude_images)?,
        config: config.clone(),
        store: store.clone(),
    }));

    info!(
        "Executing reconcile job at cron schedule {}",
        config.reconcile_schedule
    );
    let mut scheduler = JobScheduler::new().await?;
    let job_observer = observer.clone();
    let job = Job::new_async(config.reconcile_schedule.clone(), move |_uuid, _l| {
        let observer = job_observer.clone();
        Box::pin(async move {
            if let Err(e) = observer.reconcile().await {
                tracing::error!("Error reconciling workloads: {:?}", e);
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    // Discover images right away instead of waiting for the first tick
    if let Err(e) = observer.reconcile().await {
        tracing::error!("Error reconciling workloads: {:?}", e);
    }

    let app = webserver::create_app(metrics);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = root.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {:?}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    scheduler.shutdown().await?;
    store.shutdown().await;
    fanout_task.await?;
    Ok(())
}

async fn log_notifications(mut events: mpsc::Receiver<NotificationEvent>) {
    while let Some(event) = events.recv().await {
        info!(
            "Newer tag available for {}: {} -> {} (detected at {})",
            event.image.id,
            event.image.tag,
            event.new_tag,
            event.detected_at.to_rfc3339()
        );
    }
}
