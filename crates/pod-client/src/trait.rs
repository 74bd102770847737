//! PodClient trait for mocking
//!
//! This trait abstracts the Kubernetes Pod API to enable mocking in unit tests.
//! `KubePodClient` implements it against a live cluster and tests use
//! `MockPodClient`.

use crate::error::PodClientError;
use crate::models::{PodList, PodWatchEvent};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;

/// A single watch session. It ends when the server closes the connection.
pub type PodEventStream = BoxStream<'static, Result<PodWatchEvent, PodClientError>>;

/// Trait for Pod API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PodClientTrait: Send + Sync {
    /// List pods in all namespaces.
    async fn list_pods(&self) -> Result<PodList, PodClientError>;

    /// Open a watch on pods in all namespaces, starting after `resource_version`.
    async fn watch_pods(&self, resource_version: &str) -> Result<PodEventStream, PodClientError>;

    /// Fetch the current state of a single pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PodClientError>;

    /// Replace a pod. The object's `resourceVersion` is the expected version;
    /// a mismatch fails with [`PodClientError::Conflict`].
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, PodClientError>;
}
