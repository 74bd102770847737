//! Kubernetes Pod API Client
//!
//! A thin client over the Kubernetes core/v1 Pod API covering exactly what the
//! pod timestamp controller needs: a cluster-wide list, a resumable
//! cluster-wide watch, and a namespaced get/replace pair that honours the
//! object's `resourceVersion` for optimistic concurrency.
//!
//! # Example
//!
//! ```no_run
//! use pod_client::{KubePodClient, PodClientTrait, merge_annotation};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubePodClient::try_default().await?;
//!
//! // Snapshot the cluster and remember where the watch should resume
//! let list = client.list_pods().await?;
//! println!("{} pods at version {:?}", list.items.len(), list.resource_version);
//!
//! // Read-modify-write a single pod
//! let mut pod = client.get_pod("default", "web-1").await?;
//! merge_annotation(&mut pod, "timestamp", "1700000000");
//! client.replace_pod(&pod).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod pod_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubePodClient;
pub use error::PodClientError;
pub use models::*;
pub use pod_trait::{PodClientTrait, PodEventStream};
#[cfg(feature = "test-util")]
pub use mock::MockPodClient;

/// Re-exported so callers do not need their own `k8s-openapi` dependency.
pub use k8s_openapi::api::core::v1::Pod;
