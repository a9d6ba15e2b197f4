use crate::config::Config;
use crate::image::NotificationEvent;
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiterRegistry;
use crate::registry_store::RegistryStore;
use crate::repository::Repository;
use globset::GlobSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Arc<Config>,
    pub(crate) store: Arc<RegistryStore>,
    pub(crate) exclude_images: GlobSet,
}

/// Everything an image worker shares with its siblings.
#[derive(Clone)]
pub struct WorkerContext {
    pub(crate) http_client: reqwest::Client,
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) limiters: Arc<RateLimiterRegistry>,
    pub(crate) events: mpsc::Sender<NotificationEvent>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) poll_interval: Duration,
    pub(crate) plain_http_registries: GlobSet,
}

impl WorkerContext {
    pub fn uses_plain_http(&self, registry: &str) -> bool {
        self.plain_http_registries.is_match(registry)
    }
}
