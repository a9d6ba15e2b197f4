use crate::image::Image;
use crate::repository::Repository;
use crate::state::WorkerContext;
use crate::worker::{ImageWorker, WorkerHandle};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type RegistryWorkers = Arc<tokio::sync::Mutex<HashMap<String, WorkerHandle>>>;

/// Tracks deployed images per registry host and owns one [`ImageWorker`] per image name.
/// Changes to the same registry are serialized, different registries proceed in parallel.
pub struct RegistryStore {
    repository: Arc<dyn Repository>,
    ctx: WorkerContext,
    root: CancellationToken,
    registries: Mutex<HashMap<String, RegistryWorkers>>,
}

impl RegistryStore {
    pub fn new(ctx: WorkerContext, root: CancellationToken) -> Self {
        RegistryStore {
            repository: ctx.repository.clone(),
            ctx,
            root,
            registries: Mutex::new(HashMap::new()),
        }
    }

    fn workers_for(&self, registry: &str) -> RegistryWorkers {
        self.registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(registry.to_string())
            .or_default()
            .clone()
    }

    pub async fn add_image(&self, image: &Image) -> Result<()> {
        let workers = self.workers_for(&image.registry);
        let mut workers = workers.lock().await;

        self.repository
            .add_image(image)
            .await
            .with_context(|| format!("Failed to add image {}", image))?;

        match workers.get(&image.name) {
            Some(handle) => handle.worker().add_or_update(image.clone()).await,
            None => {
                info!("Tracking new image {}/{}", image.registry, image.name);
                let worker = Arc::new(ImageWorker::new(image, &self.ctx));
                workers.insert(image.name.clone(), WorkerHandle::spawn(worker, &self.root));
            }
        }
        Ok(())
    }

    pub async fn update_image(&self, image: &Image) -> Result<()> {
        let workers = self.workers_for(&image.registry);
        let _workers = workers.lock().await;

        self.repository
            .update_image(image)
            .await
            .with_context(|| format!("Failed to update image {}", image))
    }

    pub async fn delete_image(&self, image: &Image) -> Result<()> {
        let workers = self.workers_for(&image.registry);
        let mut workers = workers.lock().await;

        self.repository
            .delete_image(image)
            .await
            .with_context(|| format!("Failed to delete image {}", image))?;

        let remaining = self
            .repository
            .list_images(&image.list_options())
            .await
            .with_context(|| format!("Failed to list remaining records for {}", image))?;

        if remaining.len() <= 1 {
            if let Some(handle) = workers.remove(&image.name) {
                info!(
                    "Stopping worker for {}/{}, {} record(s) left",
                    image.registry,
                    image.name,
                    remaining.len()
                );
                handle.stop().await;
            }
        } else if let Some(handle) = workers.get(&image.name) {
            debug!(
                "Image {}/{} still has {} record(s)",
                image.registry,
                image.name,
                remaining.len()
            );
            handle.worker().delete(&image.id).await;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn worker(&self, registry: &str, name: &str) -> Option<Arc<ImageWorker>> {
        let workers = self.workers_for(registry);
        let workers = workers.lock().await;
        workers.get(name).map(|handle| handle.worker().clone())
    }

    pub async fn worker_count(&self) -> usize {
        let registries: Vec<RegistryWorkers> = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut count = 0;
        for workers in registries {
            count += workers.lock().await.len();
        }
        count
    }

    /// Stops every worker and waits for their loops to exit.
    pub async fn shutdown(&self) {
        let registries: Vec<RegistryWorkers> = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, workers)| workers)
            .collect();

        for workers in registries {
            let handles: Vec<WorkerHandle> = workers.lock().await.drain().map(|(_, h)| h).collect();
            for handle in handles {
                handle.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_registry::fake_registry::{Behaviour, FakeRegistry};
    use crate::repository::MemoryRepository;
    use crate::worker::tests::{context, image};
    use std::time::Duration;

    fn new_store(poll_interval: Duration) -> (
        RegistryStore,
        Arc<MemoryRepository>,
        tokio::sync::mpsc::Receiver<crate::image::NotificationEvent>,
    ) {
        let repository = Arc::new(MemoryRepository::new());
        let (ctx, rx) = context(repository.clone(), poll_interval);
        (
            RegistryStore::new(ctx, CancellationToken::new()),
            repository,
            rx,
        )
    }

    fn named(id: &str, registry: &str, name: &str) -> Image {
        Image {
            name: name.to_string(),
            ..image(id, registry, "1.0")
        }
    }

    #[tokio::test]
    async fn test_same_image_shares_one_worker() {
        let (store, repository, _rx) = new_store(Duration::from_secs(60));
        store.add_image(&image("a", "ghcr.io", "1.0")).await.unwrap();
        store.add_image(&image("b", "ghcr.io", "1.1")).await.unwrap();

        assert_eq!(store.worker_count().await, 1);
        let worker = store.worker("ghcr.io", "acme/app").await.unwrap();
        assert_eq!(worker.tracked().await.len(), 2);
        assert_eq!(
            repository
                .list_images(&Default::default())
                .await
                .unwrap()
                .len(),
            2
        );
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_workers_share_limiter_per_registry() {
        let (store, _repository, _rx) = new_store(Duration::from_secs(60));
        store.add_image(&named("a", "ghcr.io", "acme/app")).await.unwrap();
        store.add_image(&named("b", "ghcr.io", "acme/db")).await.unwrap();
        store.add_image(&named("c", "quay.io", "acme/app")).await.unwrap();
        assert_eq!(store.worker_count().await, 3);

        let app = store.worker("ghcr.io", "acme/app").await.unwrap();
        let db = store.worker("ghcr.io", "acme/db").await.unwrap();
        let quay = store.worker("quay.io", "acme/app").await.unwrap();
        assert!(Arc::ptr_eq(app.limiter(), db.limiter()));
        assert!(!Arc::ptr_eq(app.limiter(), quay.limiter()));
        store.shutdown().await;
        assert_eq!(store.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_has_no_worker_side_effects() {
        let (store, repository, _rx) = new_store(Duration::from_secs(60));
        let mut record = image("a", "ghcr.io", "1.0");
        assert!(store.update_image(&record).await.is_err());
        assert_eq!(store.worker_count().await, 0);

        store.add_image(&record).await.unwrap();
        record.tag = "1.1".to_string();
        store.update_image(&record).await.unwrap();
        assert_eq!(store.worker_count().await, 1);
        let listed = repository.list_images(&record.list_options()).await.unwrap();
        assert_eq!(listed[0].tag, "1.1");
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_keeps_worker_while_records_remain() {
        let (store, _repository, _rx) = new_store(Duration::from_secs(60));
        let records = [
            image("a", "ghcr.io", "1.0"),
            image("b", "ghcr.io", "1.0"),
            image("c", "ghcr.io", "1.0"),
        ];
        for record in &records {
            store.add_image(record).await.unwrap();
        }

        store.delete_image(&records[0]).await.unwrap();
        let worker = store.worker("ghcr.io", "acme/app").await.unwrap();
        assert_eq!(worker.tracked().await.len(), 2);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_stops_worker() {
        let (store, repository, _rx) = new_store(Duration::from_secs(60));
        let first = image("a", "ghcr.io", "1.0");
        let second = image("b", "ghcr.io", "1.0");
        store.add_image(&first).await.unwrap();
        store.add_image(&second).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), store.delete_image(&first))
            .await
            .expect("Delete should finish promptly")
            .unwrap();

        assert!(store.worker("ghcr.io", "acme/app").await.is_none());
        assert_eq!(store.worker_count().await, 0);
        // the poll loop has exited, not merely been detached
        assert_eq!(store.ctx.metrics.workers(), 0);
        assert_eq!(
            repository.list_images(&first.list_options()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_deleting_last_record_stops_worker() {
        let (store, repository, _rx) = new_store(Duration::from_secs(60));
        let only = image("a", "ghcr.io", "1.0");
        store.add_image(&only).await.unwrap();
        assert!(store.worker("ghcr.io", "acme/app").await.is_some());

        tokio::time::timeout(Duration::from_secs(5), store.delete_image(&only))
            .await
            .expect("Delete should finish promptly")
            .unwrap();

        assert!(store.worker("ghcr.io", "acme/app").await.is_none());
        assert_eq!(store.worker_count().await, 0);
        assert_eq!(store.ctx.metrics.workers(), 0);
        assert!(
            repository
                .list_images(&only.list_options())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_added_image_is_polled() {
        let registry = FakeRegistry::start(Behaviour::default()).await;
        registry.set_tags(&["4.0.0", "4.2.0", "5.0.0-beta1"]);
        let (store, _repository, mut rx) = new_store(Duration::from_millis(10));
        store
            .add_image(&image("a", &registry.host, "4.0.0"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Event should arrive")
            .unwrap();
        assert_eq!(event.image.id, "a");
        assert_eq!(event.new_tag, "4.2.0");
        store.shutdown().await;
    }
}
