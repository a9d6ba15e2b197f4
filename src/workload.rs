use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// A workload kind whose pod template deploys container images.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("Workload")
    }

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn image_pull_secrets(&self) -> Vec<String> {
        self.pod_spec()
            .and_then(|ps| ps.image_pull_secrets.as_ref())
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    /// `(container name, image)` for every container in the pod template.
    fn container_images(&self) -> Vec<(String, String)> {
        self.pod_spec()
            .map(|ps| {
                ps.containers
                    .iter()
                    .filter_map(|c| c.image.as_ref().map(|image| (c.name.clone(), image.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Workload for Deployment {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for StatefulSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for DaemonSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}
