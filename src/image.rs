use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use chrono::{DateTime, Utc};
use std::fmt;

/// A deployed image reference. `(registry, name)` selects the worker that polls it,
/// `id` is unique among the records of that worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub registry: String,
    pub name: String,
    pub tag: String,
    pub auth: Vec<PullSecret>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSecret {
    pub username: String,
    pub password: SecretString,
}

/// Filter for [`crate::repository::Repository::list_images`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub image_name: Option<String>,
    pub registry: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub image: Image,
    pub new_tag: String,
    pub detected_at: DateTime<Utc>,
}

impl Image {
    pub fn from_reference(id: String, reference: &ImageReference, auth: Vec<PullSecret>) -> Self {
        Image {
            id,
            registry: reference.registry.clone(),
            name: reference.repository.clone(),
            tag: reference.tag.clone(),
            auth,
        }
    }

    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            image_name: Some(self.name.clone()),
            registry: Some(self.registry.clone()),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.name, self.tag)
    }
}

impl PullSecret {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PullSecret {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }
}

impl ListOptions {
    pub fn matches(&self, image: &Image) -> bool {
        self.image_name.as_ref().is_none_or(|n| *n == image.name)
            && self.registry.as_ref().is_none_or(|r| *r == image.registry)
    }
}

impl NotificationEvent {
    pub fn new(image: Image, new_tag: String) -> Self {
        NotificationEvent {
            image,
            new_tag,
            detected_at: Utc::now(),
        }
    }
}
