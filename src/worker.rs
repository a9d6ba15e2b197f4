use crate::error::{PollError, RegistryError};
use crate::image::{Image, ListOptions, NotificationEvent};
use crate::metrics::Metrics;
use crate::oci_registry::RegistryClient;
use crate::rate_limiter::Limiter;
use crate::repository::Repository;
use crate::state::WorkerContext;
use crate::tag_matcher::{latest_matching, pattern_for};
use anyhow::Context;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls one `(registry, name)` pair and reports newer tags for every record that
/// deploys it. All records share a single tag listing per cycle.
pub struct ImageWorker {
    registry: String,
    name: String,
    images: RwLock<HashMap<String, Image>>,
    client: OnceCell<RegistryClient>,
    limiter: Arc<Limiter>,
    http_client: reqwest::Client,
    plain_http: bool,
    repository: Arc<dyn Repository>,
    events: mpsc::Sender<NotificationEvent>,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
}

impl ImageWorker {
    pub fn new(image: &Image, ctx: &WorkerContext) -> Self {
        ImageWorker {
            registry: image.registry.clone(),
            name: image.name.clone(),
            images: RwLock::new(HashMap::from([(image.id.clone(), image.clone())])),
            client: OnceCell::new(),
            limiter: ctx.limiters.limiter_for(&image.registry),
            http_client: ctx.http_client.clone(),
            plain_http: ctx.uses_plain_http(&image.registry),
            repository: ctx.repository.clone(),
            events: ctx.events.clone(),
            metrics: ctx.metrics.clone(),
            poll_interval: ctx.poll_interval,
        }
    }

    #[cfg(test)]
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    pub async fn add_or_update(&self, image: Image) {
        self.images.write().await.insert(image.id.clone(), image);
    }

    pub async fn delete(&self, id: &str) {
        self.images.write().await.remove(id);
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> Vec<Image> {
        self.images.read().await.values().cloned().collect()
    }

    fn list_options(&self) -> ListOptions {
        ListOptions {
            image_name: Some(self.name.clone()),
            registry: Some(self.registry.clone()),
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting worker for {}/{}", self.registry, self.name);
        self.metrics.worker_started();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll() => match result {
                    Ok(emitted) => debug!(
                        "Poll of {}/{} emitted {} notification(s)",
                        self.registry, self.name, emitted
                    ),
                    Err(e) => error!("Poll of {}/{} failed: {:?}", self.registry, self.name, e),
                },
            }
        }

        self.metrics.worker_stopped();
        info!("Stopped worker for {}/{}", self.registry, self.name);
    }

    /// Runs one poll cycle and returns the number of notifications emitted.
    pub async fn poll(&self) -> anyhow::Result<usize> {
        let records = self
            .repository
            .list_images(&self.list_options())
            .await
            .with_context(|| {
                format!(
                    "Failed to list tracked records for {}/{}",
                    self.registry, self.name
                )
            })?;

        if records.is_empty() {
            debug!(
                "No records tracked for {}/{}, skipping cycle",
                self.registry, self.name
            );
            return Ok(0);
        }

        // Refresh the tracked set and keep a snapshot, the lock is not held across I/O
        {
            let mut images = self.images.write().await;
            *images = records
                .iter()
                .map(|image| (image.id.clone(), image.clone()))
                .collect();
        }

        let template = &records[0];
        let client = self
            .client
            .get_or_init(|| async {
                RegistryClient::new(
                    self.http_client.clone(),
                    &template.registry,
                    &template.name,
                    self.plain_http,
                )
            })
            .await;

        self.limiter.take().await;
        self.metrics.record_poll();

        let tags = match self.fetch_tags(client, &records).await {
            Ok(tags) => Arc::new(tags),
            Err(e) => {
                self.metrics.record_poll_failure(e.failure_kind());
                return Err(e.into());
            }
        };
        debug!(
            "Found {} tags for {}/{}",
            tags.len(),
            self.registry,
            self.name
        );

        let evaluations = records.into_iter().map(|image| {
            let tags = tags.clone();
            let events = self.events.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move { evaluate(image, &tags, &events, &metrics).await })
        });

        let emitted = join_all(evaluations)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        Ok(emitted)
    }

    /// Tries every record and every pull secret in order until one listing succeeds.
    async fn fetch_tags(
        &self,
        client: &RegistryClient,
        records: &[Image],
    ) -> Result<Vec<String>, PollError> {
        let mut attempts: Vec<RegistryError> = Vec::new();

        for image in records {
            if image.auth.is_empty() {
                match client.get_tags(None).await {
                    Ok(tags) => return Ok(tags),
                    Err(e) => {
                        debug!("Anonymous tag listing for {} failed: {}", image, e);
                        attempts.push(e);
                    }
                }
                continue;
            }

            for secret in &image.auth {
                match client.get_tags(Some(secret)).await {
                    Ok(tags) => return Ok(tags),
                    Err(e) => {
                        debug!(
                            "Tag listing for {} as {} failed: {}",
                            image, secret.username, e
                        );
                        attempts.push(e);
                    }
                }
            }
        }

        Err(PollError {
            image: format!("{}/{}", self.registry, self.name),
            attempts,
        })
    }
}

async fn evaluate(
    image: Image,
    tags: &[String],
    events: &mpsc::Sender<NotificationEvent>,
    metrics: &Metrics,
) -> bool {
    let latest = match pattern_for(&image.tag)
        .and_then(|pattern| latest_matching(tags, &pattern).map(str::to_string))
    {
        Ok(latest) => latest,
        Err(e) => {
            warn!("Could not determine latest tag for {}: {}", image, e);
            return false;
        }
    };

    if latest == image.tag {
        debug!("Image {} is up to date", image);
        return false;
    }

    info!("Found newer tag {} for image {}", latest, image);
    match events.send(NotificationEvent::new(image, latest)).await {
        Ok(()) => {
            metrics.record_notification();
            true
        }
        Err(e) => {
            warn!("Dropping notification, no receiver left: {}", e);
            false
        }
    }
}

/// A spawned worker together with the means to stop it.
pub struct WorkerHandle {
    worker: Arc<ImageWorker>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(worker: Arc<ImageWorker>, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let task = tokio::spawn(worker.clone().run(cancel.clone()));
        WorkerHandle {
            worker,
            cancel,
            task,
        }
    }

    pub fn worker(&self) -> &Arc<ImageWorker> {
        &self.worker
    }

    /// Cancels the poll loop and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(
                "Worker for {}/{} ended abnormally: {}",
                self.worker.registry, self.worker.name, e
            );
        }
    }
}
