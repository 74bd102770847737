//! Data models for the Pod API client
//!
//! `Pod` itself is the upstream `k8s-openapi` type; these models are the
//! controller-facing views of it and of the watch protocol.

use crate::error::PodClientError;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::WatchEvent;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a pod: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The fields of a pod the controller reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub key: PodKey,
    /// Set once by the API server; `None` only for objects that were never persisted
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub annotations: BTreeMap<String, String>,
    /// Optimistic concurrency token
    pub resource_version: Option<String>,
}

impl PodSnapshot {
    /// Build a snapshot from a full pod object.
    ///
    /// Pods without a namespace or name cannot be addressed and are reported
    /// as malformed.
    pub fn from_pod(pod: &Pod) -> Result<Self, PodClientError> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| PodClientError::Malformed("pod without metadata.name".to_string()))?;
        let namespace = pod.metadata.namespace.clone().ok_or_else(|| {
            PodClientError::Malformed(format!("pod {name} without metadata.namespace"))
        })?;

        Ok(Self {
            key: PodKey { namespace, name },
            creation_timestamp: pod.metadata.creation_timestamp.as_ref().and_then(to_utc),
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
            resource_version: pod.metadata.resource_version.clone(),
        })
    }
}

/// Convert an API `Time` to a chrono timestamp.
///
/// Goes through the RFC 3339 wire form so it does not depend on which date
/// library `k8s-openapi` wraps.
pub fn to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(time).ok()?;
    let text = raw.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Insert or overwrite a single annotation, leaving every other one untouched.
pub fn merge_annotation(pod: &mut Pod, key: &str, value: &str) {
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Status carried by an in-stream watch `ERROR` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl From<WatchStatus> for PodClientError {
    fn from(status: WatchStatus) -> Self {
        let message = if status.message.is_empty() {
            status.reason
        } else {
            status.message
        };
        PodClientError::from_status(status.code, message)
    }
}

/// One element of a pod watch, as delivered by the API server.
#[derive(Debug, Clone)]
pub enum PodWatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    /// Progress marker carrying only a resumption token
    Bookmark { resource_version: String },
    Error(WatchStatus),
}

impl From<WatchEvent<Pod>> for PodWatchEvent {
    fn from(event: WatchEvent<Pod>) -> Self {
        match event {
            WatchEvent::Added(pod) => Self::Added(pod),
            WatchEvent::Modified(pod) => Self::Modified(pod),
            WatchEvent::Deleted(pod) => Self::Deleted(pod),
            WatchEvent::Bookmark(bookmark) => Self::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            },
            WatchEvent::Error(status) => Self::Error(WatchStatus {
                code: status.code,
                reason: status.reason.clone(),
                message: status.message.clone(),
            }),
        }
    }
}

/// Result of a cluster-wide list.
#[derive(Debug, Clone, Default)]
pub struct PodList {
    pub items: Vec<Pod>,
    /// Collection version to start a watch from
    pub resource_version: Option<String>,
}
