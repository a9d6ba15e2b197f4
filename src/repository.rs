use crate::image::{Image, ListOptions};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keyed store of image records. Reads must observe every completed write, the registry
/// store relies on that to decide when the last record of an image is gone.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn add_image(&self, image: &Image) -> Result<()>;
    async fn update_image(&self, image: &Image) -> Result<()>;
    async fn delete_image(&self, image: &Image) -> Result<()>;
    async fn list_images(&self, options: &ListOptions) -> Result<Vec<Image>>;
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    images: RwLock<HashMap<String, Image>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn add_image(&self, image: &Image) -> Result<()> {
        self.images
            .write()
            .await
            .insert(image.id.clone(), image.clone());
        Ok(())
    }

    async fn update_image(&self, image: &Image) -> Result<()> {
        let mut images = self.images.write().await;
        match images.get_mut(&image.id) {
            Some(existing) => {
                *existing = image.clone();
                Ok(())
            }
            None => bail!("Image {} with id {} is not tracked", image, image.id),
        }
    }

    async fn delete_image(&self, image: &Image) -> Result<()> {
        self.images.write().await.remove(&image.id);
        Ok(())
    }

    async fn list_images(&self, options: &ListOptions) -> Result<Vec<Image>> {
        let images = self.images.read().await;
        let mut matching: Vec<Image> = images
            .values()
            .filter(|image| options.matches(image))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }
}
