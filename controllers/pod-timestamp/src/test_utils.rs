//! Test utilities for unit testing the watcher, reconciler and controller
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::config::ControllerConfig;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use crate::shutdown::{self, ShutdownTrigger};
#[cfg(test)]
use chrono::{DateTime, Utc};
#[cfg(test)]
use pod_client::{MockPodClient, Pod, PodKey, PodSnapshot};
#[cfg(test)]
use std::collections::BTreeMap;
#[cfg(test)]
use std::sync::Arc;

/// Default configuration with a small worker pool
#[cfg(test)]
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        worker_count: 4,
        ..ControllerConfig::default()
    }
}

/// Helper to create a test pod created at `created`
#[cfg(test)]
pub fn test_pod(namespace: &str, name: &str, created: DateTime<Utc>) -> Pod {
    pod_client::mock::pod(namespace, name, created)
}

/// Helper to create a snapshot without going through a client
#[cfg(test)]
pub fn snapshot(namespace: &str, name: &str, created: DateTime<Utc>) -> PodSnapshot {
    PodSnapshot {
        key: PodKey::new(namespace, name),
        creation_timestamp: Some(created),
        annotations: BTreeMap::new(),
        resource_version: Some("1".to_string()),
    }
}

/// Helper to create a reconciler over a mock client.
///
/// The trigger must be kept alive for as long as shutdown should be possible.
#[cfg(test)]
pub fn test_reconciler(client: &MockPodClient, config: ControllerConfig) -> (Reconciler, ShutdownTrigger) {
    let (trigger, signal) = shutdown::channel();
    let reconciler = Reconciler::new(Arc::new(client.clone()), Arc::new(config), signal);
    (reconciler, trigger)
}
