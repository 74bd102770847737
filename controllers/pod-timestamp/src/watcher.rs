//! Cluster-wide pod watcher.
//!
//! [`Watcher::subscribe`] turns the Pod API's list and watch calls into one
//! lazy, unbounded stream of [`LifecycleEvent`]s that survives connection
//! loss:
//!
//! - The first subscription (and any re-list) lists every pod and replays
//!   each one as a synthetic `Added`, then watches from the list's version.
//! - The resumption token follows every delivered object and bookmark, so a
//!   reconnect picks up where the last session stopped.
//! - `410 Gone` drops the token and forces a re-list. A re-list that
//!   follows another one with no watch event in between is backed off.
//! - Network failures and server errors surface as
//!   [`StreamError::Transient`] and are retried after an exponential,
//!   jittered backoff; authentication failures surface as
//!   [`StreamError::Auth`] and end the stream.
//! - Undecodable items surface as [`StreamError::Malformed`]; the session
//!   keeps going.

use crate::backoff::ExponentialBackoff;
use crate::config::ControllerConfig;
use futures::stream::{self, Stream, StreamExt};
use pod_client::{Pod, PodClientError, PodClientTrait, PodEventStream, PodSnapshot, PodWatchEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Stream-level failures reported to the consumer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Credentials rejected; the stream ends after this
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Connection lost or API unavailable; the watcher reconnects
    #[error("transient watch failure: {0}")]
    Transient(String),
    /// One item could not be decoded; it was skipped
    #[error("malformed watch event: {0}")]
    Malformed(String),
}

/// One element of the pod lifecycle stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Added(PodSnapshot),
    Modified(PodSnapshot),
    Deleted(PodSnapshot),
    /// Progress marker; carries the new resumption token
    Bookmark(String),
    Error(StreamError),
}

impl LifecycleEvent {
    /// The pod this event is about, if any.
    pub fn snapshot(&self) -> Option<&PodSnapshot> {
        match self {
            Self::Added(pod) | Self::Modified(pod) | Self::Deleted(pod) => Some(pod),
            Self::Bookmark(_) | Self::Error(_) => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "Added",
            Self::Modified(_) => "Modified",
            Self::Deleted(_) => "Deleted",
            Self::Bookmark(_) => "Bookmark",
            Self::Error(_) => "Error",
        }
    }
}

/// What the watch loop does next.
enum Phase {
    /// List everything and restart the watch from the list's version
    Relist,
    /// Open a watch from the current resumption token
    Connect,
    /// Reading an open watch session
    Watching(PodEventStream),
    /// Waiting out a backoff before `then`
    Sleeping(Duration, Box<Phase>),
    /// Terminal
    Done,
}

/// Watches pods in all namespaces.
pub struct Watcher {
    client: Arc<dyn PodClientTrait>,
    backoff: ExponentialBackoff,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(client: Arc<dyn PodClientTrait>, config: &ControllerConfig) -> Self {
        Self {
            client,
            backoff: ExponentialBackoff::new(config.backoff_initial, config.backoff_max),
        }
    }

    /// Start the subscription.
    ///
    /// Nothing happens until the stream is polled; dropping it closes the
    /// underlying connection.
    pub fn subscribe(self) -> impl Stream<Item = LifecycleEvent> + Send + 'static {
        let state = WatchLoop {
            client: self.client,
            backoff: self.backoff,
            resource_version: None,
            phase: Phase::Relist,
            pending: VecDeque::new(),
            session_delivered: false,
            relisted: false,
        };
        stream::unfold(state, |mut state| async move {
            let event = state.next_event().await?;
            Some((event, state))
        })
    }
}

struct WatchLoop {
    client: Arc<dyn PodClientTrait>,
    backoff: ExponentialBackoff,
    /// Resumption token; `None` forces a re-list
    resource_version: Option<String>,
    phase: Phase,
    /// Events produced but not yet handed out (re-list replay)
    pending: VecDeque<LifecycleEvent>,
    /// Whether the current watch session delivered anything
    session_delivered: bool,
    /// A re-list completed and no watch event has arrived since
    relisted: bool,
}

impl WatchLoop {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Relist if self.relisted => {
                    self.relisted = false;
                    let delay = self.backoff.next_backoff();
                    warn!("Re-listing again without a watch event in between, waiting {:?}", delay);
                    self.phase = Phase::Sleeping(delay, Box::new(Phase::Relist));
                }
                Phase::Relist => self.relist().await,
                Phase::Connect => self.connect().await,
                Phase::Sleeping(delay, then) => {
                    tokio::time::sleep(delay).await;
                    self.phase = *then;
                }
                Phase::Watching(mut stream) => match stream.next().await {
                    Some(Ok(event)) => {
                        self.phase = Phase::Watching(stream);
                        self.on_watch_event(event);
                    }
                    Some(Err(PodClientError::Malformed(msg))) => {
                        warn!("Skipping malformed watch event: {}", msg);
                        self.phase = Phase::Watching(stream);
                        self.pending.push_back(LifecycleEvent::Error(StreamError::Malformed(msg)));
                    }
                    Some(Err(e)) => {
                        drop(stream);
                        self.fail(e, Phase::Connect);
                    }
                    None => {
                        drop(stream);
                        self.on_closed();
                    }
                },
            }
        }
    }

    async fn relist(&mut self) {
        info!("Listing pods in all namespaces");
        match self.client.list_pods().await {
            Ok(list) => {
                info!(
                    "Listed {} pods at resourceVersion {}",
                    list.items.len(),
                    list.resource_version.as_deref().unwrap_or("<none>")
                );
                for pod in list.items {
                    self.deliver(pod, LifecycleEvent::Added);
                }
                // Items carry older versions than the list itself
                self.resource_version = list.resource_version;
                self.phase = Phase::Connect;
                self.relisted = true;
            }
            Err(e) => self.fail(e, Phase::Relist),
        }
    }

    async fn connect(&mut self) {
        let Some(version) = self.resource_version.clone() else {
            self.phase = Phase::Relist;
            return;
        };
        debug!("Watching pods from resourceVersion {}", version);
        match self.client.watch_pods(&version).await {
            Ok(stream) => {
                self.session_delivered = false;
                self.phase = Phase::Watching(stream);
            }
            Err(e) => self.fail(e, Phase::Connect),
        }
    }

    fn on_watch_event(&mut self, event: PodWatchEvent) {
        if !matches!(event, PodWatchEvent::Error(_)) {
            self.relisted = false;
        }
        match event {
            PodWatchEvent::Added(pod) => self.deliver(pod, LifecycleEvent::Added),
            PodWatchEvent::Modified(pod) => self.deliver(pod, LifecycleEvent::Modified),
            PodWatchEvent::Deleted(pod) => self.deliver(pod, LifecycleEvent::Deleted),
            PodWatchEvent::Bookmark { resource_version } => {
                debug!("Watch bookmark at resourceVersion {}", resource_version);
                self.resource_version = Some(resource_version.clone());
                self.mark_delivered();
                self.pending.push_back(LifecycleEvent::Bookmark(resource_version));
            }
            PodWatchEvent::Error(status) => {
                // The server ends the session after an ERROR event; `fail`
                // replaces the phase and drops the stream
                self.fail(status.into(), Phase::Connect);
            }
        }
    }

    fn deliver(&mut self, pod: Pod, wrap: fn(PodSnapshot) -> LifecycleEvent) {
        match PodSnapshot::from_pod(&pod) {
            Ok(snapshot) => {
                if let Some(version) = &snapshot.resource_version {
                    self.resource_version = Some(version.clone());
                }
                self.mark_delivered();
                self.pending.push_back(wrap(snapshot));
            }
            Err(e) => {
                warn!("Skipping malformed pod: {}", e);
                self.pending.push_back(LifecycleEvent::Error(StreamError::Malformed(e.to_string())));
            }
        }
    }

    fn mark_delivered(&mut self) {
        self.session_delivered = true;
        self.backoff.reset();
    }

    /// The server closed the session cleanly.
    fn on_closed(&mut self) {
        if self.session_delivered {
            debug!("Watch session closed by server, reconnecting");
            self.phase = Phase::Connect;
        } else {
            let delay = self.backoff.next_backoff();
            debug!("Idle watch session closed by server, reconnecting in {:?}", delay);
            self.phase = Phase::Sleeping(delay, Box::new(Phase::Connect));
        }
    }

    /// Decide how to continue after a failed call or an in-stream error.
    fn fail(&mut self, err: PodClientError, retry: Phase) {
        match err {
            PodClientError::Auth(msg) | PodClientError::Config(msg) => {
                error!("Pod watch authentication failed, giving up: {}", msg);
                self.phase = Phase::Done;
                self.pending.push_back(LifecycleEvent::Error(StreamError::Auth(msg)));
            }
            PodClientError::Expired(msg) => {
                info!("Watch resourceVersion expired ({}), re-listing", msg);
                self.resource_version = None;
                self.phase = Phase::Relist;
            }
            other => {
                // This sleep already throttles the next re-list
                self.relisted = false;
                let delay = self.backoff.next_backoff();
                warn!(
                    "Pod watch failed (attempt {}), retrying in {:?}: {}",
                    self.backoff.attempts(),
                    delay,
                    other
                );
                self.phase = Phase::Sleeping(delay, Box::new(retry));
                self.pending
                    .push_back(LifecycleEvent::Error(StreamError::Transient(other.to_string())));
            }
        }
    }
}
