//! Kubernetes-backed implementation of [`PodClientTrait`].

use crate::error::PodClientError;
use crate::models::{PodList, PodWatchEvent};
use crate::pod_trait::{PodClientTrait, PodEventStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use tracing::debug;

/// Server-side watch timeout. Kept under the API server's 5 minute ceiling so
/// sessions end with a clean close rather than a dropped connection.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Pod API client backed by a shared `kube::Client`.
///
/// Cloning is cheap; every clone shares the same connection pool.
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
    watch_timeout_secs: u32,
}

impl KubePodClient {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
        }
    }

    /// Build a client from the inferred environment (in-cluster service
    /// account first, then the default kubeconfig).
    pub async fn try_default() -> Result<Self, PodClientError> {
        let config = Config::infer()
            .await
            .map_err(|e| PodClientError::Config(e.to_string()))?;
        Self::from_config(config)
    }

    /// Build a client from an explicit kubeconfig file.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self, PodClientError> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| PodClientError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| PodClientError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self, PodClientError> {
        debug!("Connecting to Kubernetes API at {}", config.cluster_url);
        let client = Client::try_from(config).map_err(|e| PodClientError::Config(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn namespaced(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PodClientTrait for KubePodClient {
    async fn list_pods(&self) -> Result<PodList, PodClientError> {
        let list = self.all().list(&ListParams::default()).await?;
        Ok(PodList {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch_pods(&self, resource_version: &str) -> Result<PodEventStream, PodClientError> {
        debug!("Opening pod watch at resourceVersion {}", resource_version);
        let params = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self.all().watch(&params, resource_version).await?;
        Ok(stream
            .map(|item| item.map(PodWatchEvent::from).map_err(PodClientError::from))
            .boxed())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PodClientError> {
        Ok(self.namespaced(namespace).get(name).await?)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, PodClientError> {
        let (Some(namespace), Some(name)) = (&pod.metadata.namespace, &pod.metadata.name) else {
            return Err(PodClientError::Malformed(
                "cannot replace a pod without namespace and name".to_string(),
            ));
        };
        Ok(self
            .namespaced(namespace)
            .replace(name, &PostParams::default(), pod)
            .await?)
    }
}
