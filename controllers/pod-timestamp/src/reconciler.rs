//! Reconciliation logic for newly created pods.
//!
//! Each `Added` pod that passes the namespace filter and the age guard is
//! stamped with `annotation_key = <unix seconds>` after the configured delay.
//! The write is a read-modify-write against the freshest copy of the pod and
//! relies on `resourceVersion` for optimistic concurrency: a conflicting
//! update is retried from the fetch a bounded number of times.
//!
//! Work is split in two so the expensive half never runs on the watch loop:
//! - `admit` (type, namespace and age checks) is pure and runs when the event
//!   is delivered
//! - `annotate` (delay, fetch, merge, update) runs on a worker

use crate::config::ControllerConfig;
use crate::shutdown::ShutdownSignal;
use crate::watcher::LifecycleEvent;
use chrono::{DateTime, Utc};
use pod_client::{PodClientError, PodClientTrait, PodKey, PodSnapshot, merge_annotation};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why an event was not acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Only `Added` events trigger annotation
    NotAdded(&'static str),
    /// Namespace does not contain the configured substring
    NamespaceFiltered,
    /// Pod existed before the watch caught up (backlog replay)
    TooOld { age_secs: i64 },
    /// Pod has no creation timestamp to judge its age by
    MissingCreationTimestamp,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAdded(kind) => write!(f, "{kind} event"),
            Self::NamespaceFiltered => write!(f, "namespace filtered"),
            Self::TooOld { age_secs } => write!(f, "created {age_secs}s ago"),
            Self::MissingCreationTimestamp => write!(f, "no creation timestamp"),
        }
    }
}

/// Why an admitted pod could not be annotated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailReason {
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("update failed: {0}")]
    UpdateFailed(String),
    #[error("update conflicted {attempts} times")]
    ConflictRetriesExhausted { attempts: u32 },
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    /// Written on the given get/update attempt
    Annotated { attempts: u32 },
    Failed(FailReason),
}

/// Annotates newly created pods.
pub struct Reconciler {
    client: Arc<dyn PodClientTrait>,
    config: Arc<ControllerConfig>,
    shutdown: ShutdownSignal,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        client: Arc<dyn PodClientTrait>,
        config: Arc<ControllerConfig>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            client,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Admission checks against the wall clock. No API calls.
    ///
    /// A rejected event is finished: the error is its `Outcome::Skipped`.
    /// An admitted pod gets its final outcome from [`Reconciler::annotate`].
    pub fn admit<'a>(&self, event: &'a LifecycleEvent) -> Result<&'a PodSnapshot, Outcome> {
        self.admit_at(event, Utc::now())
    }

    /// Admission checks as of `now`.
    pub fn admit_at<'a>(
        &self,
        event: &'a LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<&'a PodSnapshot, Outcome> {
        self.check(event, now).map_err(|reason| {
            match event.snapshot() {
                Some(pod) => debug!(
                    event = "skipped",
                    namespace = %pod.key.namespace,
                    pod = %pod.key.name,
                    reason = %reason,
                    "Skipping pod"
                ),
                None => debug!(event = "skipped", reason = %reason, "Skipping event"),
            }
            Outcome::Skipped(reason)
        })
    }

    fn check<'a>(
        &self,
        event: &'a LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<&'a PodSnapshot, SkipReason> {
        let LifecycleEvent::Added(pod) = event else {
            return Err(SkipReason::NotAdded(event.kind()));
        };

        if !self.config.matches_namespace(&pod.key.namespace) {
            return Err(SkipReason::NamespaceFiltered);
        }

        let created = pod
            .creation_timestamp
            .ok_or(SkipReason::MissingCreationTimestamp)?;
        let age = now.signed_duration_since(created);
        // A threshold too large for chrono can never be exceeded
        if let Ok(threshold) = chrono::Duration::from_std(self.config.age_threshold) {
            if age > threshold {
                return Err(SkipReason::TooOld {
                    age_secs: age.num_seconds(),
                });
            }
        }
        Ok(pod)
    }

    /// Wait until `not_before`, then stamp the pod with the current time.
    ///
    /// The pod is re-fetched after the wait since the delivered snapshot may
    /// be stale. Fetch failures (usually: pod already deleted) are final.
    /// Conflicting updates restart from the fetch, up to
    /// `conflict_retries` get/update pairs in total.
    pub async fn annotate(&self, key: &PodKey, not_before: Instant) -> Outcome {
        info!(event = "started", namespace = %key.namespace, pod = %key.name, "Pod created");

        if !self.pause_until(not_before).await {
            return self.cancelled(key);
        }

        let retries = self.config.conflict_retries;
        for attempt in 1..=retries {
            let mut pod = match self.client.get_pod(&key.namespace, &key.name).await {
                Ok(pod) => pod,
                Err(e) => {
                    warn!(
                        event = "failed",
                        namespace = %key.namespace,
                        pod = %key.name,
                        stage = "fetch",
                        reason = %e,
                        "Failed to fetch pod"
                    );
                    return Outcome::Failed(FailReason::FetchFailed(e.to_string()));
                }
            };

            let stamp = Utc::now().timestamp().to_string();
            merge_annotation(&mut pod, &self.config.annotation_key, &stamp);

            match self.client.replace_pod(&pod).await {
                Ok(_) => {
                    info!(
                        event = "annotated",
                        namespace = %key.namespace,
                        pod = %key.name,
                        annotation = %self.config.annotation_key,
                        value = %stamp,
                        attempts = attempt,
                        "Pod annotation updated"
                    );
                    return Outcome::Annotated { attempts: attempt };
                }
                Err(PodClientError::Conflict(msg)) if attempt < retries => {
                    info!(
                        event = "retried",
                        namespace = %key.namespace,
                        pod = %key.name,
                        attempt,
                        reason = %msg,
                        "Pod changed during update, retrying"
                    );
                    if !self.pause_until(Instant::now() + self.config.conflict_backoff).await {
                        return self.cancelled(key);
                    }
                }
                Err(PodClientError::Conflict(msg)) => {
                    warn!(
                        event = "failed",
                        namespace = %key.namespace,
                        pod = %key.name,
                        stage = "update",
                        reason = %msg,
                        attempts = attempt,
                        "Giving up after repeated update conflicts"
                    );
                }
                Err(e) => {
                    warn!(
                        event = "failed",
                        namespace = %key.namespace,
                        pod = %key.name,
                        stage = "update",
                        reason = %e,
                        "Failed to update pod"
                    );
                    return Outcome::Failed(FailReason::UpdateFailed(e.to_string()));
                }
            }
        }

        Outcome::Failed(FailReason::ConflictRetriesExhausted { attempts: retries })
    }

    /// Sleep until `deadline` unless shutdown comes first. Returns `false`
    /// when interrupted.
    async fn pause_until(&self, deadline: Instant) -> bool {
        if self.shutdown.is_shutdown() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => true,
            () = self.shutdown.recv() => false,
        }
    }

    fn cancelled(&self, key: &PodKey) -> Outcome {
        info!(
            event = "failed",
            namespace = %key.namespace,
            pod = %key.name,
            reason = "shutdown",
            "Annotation cancelled"
        );
        Outcome::Failed(FailReason::Cancelled)
    }
}
