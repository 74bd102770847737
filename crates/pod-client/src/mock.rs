//! Mock PodClient for unit testing
//!
//! This module provides an in-memory implementation of [`PodClientTrait`] that
//! can be used in unit tests without a running cluster. Pods are stored with a
//! monotonically increasing `resourceVersion`, so `replace_pod` enforces the
//! same optimistic concurrency rule as the API server. Watch sessions are
//! scripted up front and handed out one per `watch_pods` call.

use crate::error::PodClientError;
use crate::models::{PodKey, PodList, PodWatchEvent};
use crate::pod_trait::{PodClientTrait, PodEventStream};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use futures::stream;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Build a pod with the fields the controller reads.
pub fn pod(namespace: &str, name: &str, created: DateTime<Utc>) -> Pod {
    let value = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "creationTimestamp": created.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    });
    // A literal built from valid RFC 3339 always decodes
    serde_json::from_value(value).unwrap_or_default()
}

/// One scripted watch session.
#[derive(Debug, Clone, Default)]
struct WatchScript {
    items: Vec<Result<PodWatchEvent, PodClientError>>,
    /// Keep the connection open after the last item instead of closing it
    hold_open: bool,
}

#[derive(Default)]
struct MockState {
    pods: HashMap<PodKey, Pod>,
    next_version: u64,
    list_errors: VecDeque<PodClientError>,
    watch_errors: VecDeque<PodClientError>,
    watch_scripts: VecDeque<WatchScript>,
    get_errors: VecDeque<PodClientError>,
    replace_errors: VecDeque<PodClientError>,
    always_conflict: bool,
    list_calls: usize,
    get_calls: usize,
    replace_calls: usize,
    watch_versions: Vec<String>,
}

impl MockState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Mock PodClient for testing
#[derive(Clone, Default)]
pub struct MockPodClient {
    state: Arc<Mutex<MockState>>,
}

impl MockPodClient {
    /// Create an empty mock cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a pod (for test setup). Assigns a fresh `resourceVersion`.
    pub fn insert_pod(&self, mut pod: Pod) -> Pod {
        let mut state = self.state();
        let key = PodKey::new(
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        pod.metadata.resource_version = Some(state.bump());
        state.pods.insert(key, pod.clone());
        pod
    }

    /// Current stored copy of a pod.
    pub fn stored_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state().pods.get(&PodKey::new(namespace, name)).cloned()
    }

    /// Simulate a concurrent writer touching the pod.
    pub fn touch_pod(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        let version = state.bump();
        if let Some(pod) = state.pods.get_mut(&PodKey::new(namespace, name)) {
            pod.metadata.resource_version = Some(version);
        }
    }

    /// Queue a watch session that closes after delivering `items`.
    pub fn push_watch_session(&self, items: Vec<Result<PodWatchEvent, PodClientError>>) {
        self.state().watch_scripts.push_back(WatchScript { items, hold_open: false });
    }

    /// Queue a watch session that stays open after delivering `items`.
    pub fn push_open_watch_session(&self, items: Vec<Result<PodWatchEvent, PodClientError>>) {
        self.state().watch_scripts.push_back(WatchScript { items, hold_open: true });
    }

    /// Make the next `list_pods` call fail.
    pub fn fail_next_list(&self, err: PodClientError) {
        self.state().list_errors.push_back(err);
    }

    /// Make the next `watch_pods` call fail before a stream is opened.
    pub fn fail_next_watch(&self, err: PodClientError) {
        self.state().watch_errors.push_back(err);
    }

    /// Make the next `get_pod` call fail.
    pub fn fail_next_get(&self, err: PodClientError) {
        self.state().get_errors.push_back(err);
    }

    /// Make the next `replace_pod` call fail.
    pub fn fail_next_replace(&self, err: PodClientError) {
        self.state().replace_errors.push_back(err);
    }

    /// Reject every `replace_pod` call with a conflict.
    pub fn always_conflict(&self) {
        self.state().always_conflict = true;
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn get_calls(&self) -> usize {
        self.state().get_calls
    }

    pub fn replace_calls(&self) -> usize {
        self.state().replace_calls
    }

    /// Resource versions passed to `watch_pods`, in call order.
    pub fn watch_versions(&self) -> Vec<String> {
        self.state().watch_versions.clone()
    }

    /// Total number of API calls of any kind.
    pub fn total_calls(&self) -> usize {
        let state = self.state();
        state.list_calls + state.get_calls + state.replace_calls + state.watch_versions.len()
    }
}

#[async_trait::async_trait]
impl PodClientTrait for MockPodClient {
    async fn list_pods(&self) -> Result<PodList, PodClientError> {
        let mut state = self.state();
        state.list_calls += 1;
        if let Some(err) = state.list_errors.pop_front() {
            return Err(err);
        }
        let mut items: Vec<Pod> = state.pods.values().cloned().collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(PodList {
            items,
            resource_version: Some(state.next_version.to_string()),
        })
    }

    async fn watch_pods(&self, resource_version: &str) -> Result<PodEventStream, PodClientError> {
        let mut state = self.state();
        state.watch_versions.push(resource_version.to_string());
        if let Some(err) = state.watch_errors.pop_front() {
            return Err(err);
        }
        match state.watch_scripts.pop_front() {
            Some(script) if script.hold_open => {
                Ok(stream::iter(script.items).chain(stream::pending()).boxed())
            }
            Some(script) => Ok(stream::iter(script.items).boxed()),
            // Nothing scripted: an idle connection that never closes
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PodClientError> {
        let mut state = self.state();
        state.get_calls += 1;
        if let Some(err) = state.get_errors.pop_front() {
            return Err(err);
        }
        state
            .pods
            .get(&PodKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| PodClientError::NotFound(format!("pods \"{name}\" not found")))
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, PodClientError> {
        let mut state = self.state();
        state.replace_calls += 1;
        if let Some(err) = state.replace_errors.pop_front() {
            return Err(err);
        }
        let key = PodKey::new(
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        if state.always_conflict {
            return Err(PodClientError::Conflict(format!("{key} has been modified")));
        }
        let current_version = match state.pods.get(&key) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(PodClientError::NotFound(format!("pods \"{}\" not found", key.name))),
        };
        if pod.metadata.resource_version != current_version {
            return Err(PodClientError::Conflict(format!(
                "{key} has been modified; please apply your changes to the latest version"
            )));
        }
        let mut updated = pod.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.pods.insert(key, updated.clone());
        Ok(updated)
    }
}
