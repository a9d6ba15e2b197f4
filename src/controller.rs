use crate::image::{Image, PullSecret};
use crate::image_reference::ImageReference;
use crate::pull_secrets::{DOCKER_CONFIG_JSON_KEY, DOCKER_CONFIG_JSON_TYPE, pull_secrets_for};
use crate::state::ControllerContext;
use crate::workload::Workload;
use anyhow::Context;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s controller");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, in-cluster Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

#[derive(Debug, PartialEq)]
pub enum Change {
    Add(Image),
    Update(Image),
    Delete(Image),
}

/// Discovers deployed images from workloads and keeps the registry store in sync with them.
pub struct Observer {
    ctx: ControllerContext,
    known: Mutex<BTreeMap<String, Image>>,
}

impl Observer {
    pub fn new(ctx: ControllerContext) -> Self {
        Observer {
            ctx,
            known: Mutex::new(BTreeMap::new()),
        }
    }

    fn namespace(&self) -> String {
        self.ctx
            .config
            .namespace
            .clone()
            .unwrap_or_else(|| self.ctx.kube_client.default_namespace().to_string())
    }

    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let namespace = self.namespace();
        let secrets: Api<Secret> = Api::namespaced(self.ctx.kube_client.clone(), &namespace);

        let mut current = BTreeMap::new();
        self.collect::<Deployment>(&namespace, &secrets, &mut current)
            .await?;
        self.collect::<StatefulSet>(&namespace, &secrets, &mut current)
            .await?;
        self.collect::<DaemonSet>(&namespace, &secrets, &mut current)
            .await?;

        let mut known = self.known.lock().await;
        let changes = diff(&known, &current);
        info!(
            "Found {} container images in namespace {}, {} change(s) to apply",
            current.len(),
            namespace,
            changes.len()
        );

        for change in changes {
            match change {
                Change::Add(image) => match self.ctx.store.add_image(&image).await {
                    Ok(()) => {
                        known.insert(image.id.clone(), image);
                    }
                    Err(e) => warn!("Failed to track image {}: {:?}", image, e),
                },
                Change::Update(image) => match self.ctx.store.update_image(&image).await {
                    Ok(()) => {
                        known.insert(image.id.clone(), image);
                    }
                    Err(e) => warn!("Failed to update image {}: {:?}", image, e),
                },
                Change::Delete(image) => match self.ctx.store.delete_image(&image).await {
                    Ok(()) => {
                        known.remove(&image.id);
                    }
                    Err(e) => warn!("Failed to untrack image {}: {:?}", image, e),
                },
            }
        }

        info!(
            "Tracking {} container image(s) with {} worker(s)",
            known.len(),
            self.ctx.store.worker_count().await
        );
        Ok(())
    }

    async fn collect<W: Workload>(
        &self,
        namespace: &str,
        secrets: &Api<Secret>,
        current: &mut BTreeMap<String, Image>,
    ) -> anyhow::Result<()> {
        let api: Api<W> = Api::namespaced(self.ctx.kube_client.clone(), namespace);
        let workloads = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list {}s in {}", W::kind_name(), namespace))?;

        for workload in workloads.items {
            let workload_name = workload.name_any();
            let secret_names = workload.image_pull_secrets();

            for (container, image) in workload.container_images() {
                let reference = match ImageReference::parse(&image) {
                    Ok(reference) => reference,
                    Err(e) => {
                        debug!(
                            "Skipping container {} of {} {}: {}",
                            container,
                            W::kind_name(),
                            workload_name,
                            e
                        );
                        continue;
                    }
                };

                let qualified = format!("{}/{}", reference.registry, reference.repository);
                if self.ctx.exclude_images.is_match(&qualified) {
                    debug!("Image {} is excluded from tracking", qualified);
                    continue;
                }

                let auth = resolve_pull_secrets(secrets, &secret_names, &reference.registry).await;
                let id = format!(
                    "{}/{}/{}/{}",
                    namespace,
                    W::kind_name(),
                    workload_name,
                    container
                );
                current.insert(id.clone(), Image::from_reference(id, &reference, auth));
            }
        }
        Ok(())
    }
}

async fn resolve_pull_secrets(
    secrets: &Api<Secret>,
    names: &[String],
    registry: &str,
) -> Vec<PullSecret> {
    let mut resolved = Vec::new();
    for name in names {
        let secret = match secrets.get_opt(name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                warn!("Image pull secret {} does not exist", name);
                continue;
            }
            Err(e) => {
                warn!("Failed to read image pull secret {}: {}", name, e);
                continue;
            }
        };

        if secret.type_.as_deref() != Some(DOCKER_CONFIG_JSON_TYPE) {
            debug!("Ignoring secret {} of type {:?}", name, secret.type_);
            continue;
        }
        let Some(data) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
        else {
            warn!("Secret {} has no {} entry", name, DOCKER_CONFIG_JSON_KEY);
            continue;
        };

        match pull_secrets_for(registry, &data.0) {
            Ok(found) => resolved.extend(found),
            Err(e) => warn!("Failed to parse image pull secret {}: {:?}", name, e),
        }
    }
    resolved
}

/// Changes turning `previous` into `current`. A record whose registry or repository changed
/// belongs to a different worker, so it is deleted and re-added rather than updated.
pub fn diff(previous: &BTreeMap<String, Image>, current: &BTreeMap<String, Image>) -> Vec<Change> {
    let mut changes = Vec::new();

    for (id, old) in previous {
        match current.get(id) {
            None => changes.push(Change::Delete(old.clone())),
            Some(new) if new.registry != old.registry || new.name != old.name => {
                changes.push(Change::Delete(old.clone()));
            }
            Some(_) => {}
        }
    }

    for (id, new) in current {
        match previous.get(id) {
            None => changes.push(Change::Add(new.clone())),
            Some(old) if new.registry != old.registry || new.name != old.name => {
                changes.push(Change::Add(new.clone()));
            }
            Some(old) if old != new => changes.push(Change::Update(new.clone())),
            Some(_) => {}
        }
    }
    changes
}
