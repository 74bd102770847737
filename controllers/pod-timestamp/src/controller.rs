//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watcher to the
//! reconciler, and the `Dispatcher` that runs annotations off the watch loop.
//!
//! The watch loop is the single, ordered consumer of pod events. It runs the
//! cheap admission checks itself and hands admitted pods to a fixed pool of
//! workers. A pod always lands on the same worker (hash of namespace/name),
//! so work for one pod is never reordered or run twice at once. Each job
//! carries the instant it may start (`delivered + delay`); since those are
//! monotonic within a queue, one pod's delay never stacks on another's.
//!
//! Every event ends in one `Outcome`: skipped at admission, or annotated or
//! failed on a worker. The totals are logged when the controller stops.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::{Outcome, Reconciler};
use crate::shutdown::ShutdownSignal;
use crate::watcher::{LifecycleEvent, StreamError, Watcher};
use futures::StreamExt;
use pod_client::{KubePodClient, PodClientTrait, PodKey};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Running totals of reconciliation outcomes.
#[derive(Debug, Default)]
pub struct OutcomeTally {
    skipped: AtomicU64,
    annotated: AtomicU64,
    failed: AtomicU64,
}

impl OutcomeTally {
    pub fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Skipped(_) => &self.skipped,
            Outcome::Annotated { .. } => &self.annotated,
            Outcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn annotated(&self) -> u64 {
        self.annotated.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// A pod waiting for its annotation.
#[derive(Debug)]
struct Job {
    key: PodKey,
    not_before: Instant,
}

/// Fixed pool of annotation workers keyed by pod identity.
pub struct Dispatcher {
    queues: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `worker_count` workers, each with its own bounded queue.
    pub fn spawn(reconciler: Arc<Reconciler>, tally: Arc<OutcomeTally>) -> Self {
        let config = reconciler.config();
        let mut queues = Vec::with_capacity(config.worker_count);
        let mut workers = Vec::with_capacity(config.worker_count);

        for id in 0..config.worker_count {
            let (tx, rx) = mpsc::channel(config.worker_queue_depth);
            queues.push(tx);
            workers.push(tokio::spawn(run_worker(id, reconciler.clone(), tally.clone(), rx)));
        }

        Self { queues, workers }
    }

    /// Worker index a pod is routed to.
    pub fn worker_for(&self, key: &PodKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slots = self.queues.len().max(1) as u64;
        // Remainder is below `slots`, which came from a usize
        usize::try_from(hasher.finish() % slots).unwrap_or(0)
    }

    /// Queue a pod for annotation. Waits while the target queue is full.
    pub async fn dispatch(&self, key: PodKey, not_before: Instant) -> Result<(), ControllerError> {
        let worker = self.worker_for(&key);
        debug!("Routing {} to worker {}", key, worker);
        self.queues[worker]
            .send(Job { key, not_before })
            .await
            .map_err(|e| ControllerError::Shutdown(format!("worker {worker} stopped, dropped {}", e.0.key)))
    }

    /// Close every queue and wait up to `grace` for workers to drain;
    /// anything still running afterwards is aborted.
    pub async fn shutdown(self, grace: Duration) {
        let Self { queues, workers } = self;
        drop(queues);

        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(grace, futures::future::join_all(workers)).await {
            Ok(_) => info!("All annotation workers stopped"),
            Err(_) => {
                warn!("Annotation workers still busy after {:?}, aborting", grace);
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }

    /// Drop all queued and in-flight work immediately.
    pub async fn abort(self) {
        let Self { queues, workers } = self;
        drop(queues);

        for handle in &workers {
            handle.abort();
        }
        futures::future::join_all(workers).await;
        info!("Annotation workers aborted");
    }
}

async fn run_worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    tally: Arc<OutcomeTally>,
    mut rx: mpsc::Receiver<Job>,
) {
    debug!("Annotation worker {} started", id);
    while let Some(job) = rx.recv().await {
        let outcome = reconciler.annotate(&job.key, job.not_before).await;
        debug!("Worker {} finished {}: {:?}", id, job.key, outcome);
        tally.record(&outcome);
    }
    debug!("Annotation worker {} stopped", id);
}

/// Main controller for pod annotation.
pub struct Controller {
    watcher: Watcher,
    reconciler: Arc<Reconciler>,
    tally: Arc<OutcomeTally>,
    shutdown: ShutdownSignal,
}

impl Controller {
    /// Creates a new controller instance connected to the cluster.
    pub async fn new(config: ControllerConfig, shutdown: ShutdownSignal) -> Result<Self, ControllerError> {
        info!("Initializing Pod Timestamp Controller");

        let client = match &config.kubeconfig {
            Some(path) => KubePodClient::from_kubeconfig(path).await?,
            None => KubePodClient::try_default().await?,
        };

        Ok(Self::with_client(Arc::new(client), Arc::new(config), shutdown))
    }

    /// Creates a controller over any Pod API client.
    pub fn with_client(
        client: Arc<dyn PodClientTrait>,
        config: Arc<ControllerConfig>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let watcher = Watcher::new(client.clone(), &config);
        let reconciler = Arc::new(Reconciler::new(client, config, shutdown.clone()));
        Self {
            watcher,
            reconciler,
            tally: Arc::new(OutcomeTally::default()),
            shutdown,
        }
    }

    /// Runs the controller until shutdown or a fatal watch error.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Pod Timestamp Controller running");

        let Self {
            watcher,
            reconciler,
            tally,
            shutdown,
        } = self;
        let delay = reconciler.config().delay;
        let grace = reconciler.config().shutdown_grace;
        let dispatcher = Dispatcher::spawn(reconciler.clone(), tally.clone());
        let mut events = Box::pin(watcher.subscribe());

        let result = loop {
            let event = tokio::select! {
                () = shutdown.recv() => {
                    info!("Shutdown requested, closing pod watch");
                    break Ok(());
                }
                event = events.next() => event,
            };

            match event {
                None => break Err(ControllerError::Watch("pod event stream ended".to_string())),
                Some(LifecycleEvent::Error(StreamError::Auth(msg))) => {
                    error!("Pod watch rejected credentials: {}", msg);
                    break Err(ControllerError::Auth(msg));
                }
                Some(LifecycleEvent::Error(e)) => {
                    // Already logged with detail by the watcher
                    debug!("Pod watch reported: {}", e);
                }
                Some(event) => match reconciler.admit(&event) {
                    Ok(pod) => {
                        let not_before = Instant::now() + delay;
                        if let Err(e) = dispatcher.dispatch(pod.key.clone(), not_before).await {
                            break Err(e);
                        }
                    }
                    Err(skipped) => tally.record(&skipped),
                },
            }
        };

        // Closes the watch connection
        drop(events);
        match &result {
            Ok(()) => dispatcher.shutdown(grace).await,
            // Pending work would only run into the same failure
            Err(_) => dispatcher.abort().await,
        }
        info!(
            annotated = tally.annotated(),
            skipped = tally.skipped(),
            failed = tally.failed(),
            "Pod Timestamp Controller stopped"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use crate::test_utils::*;
    use chrono::Utc;
    use pod_client::{MockPodClient, PodClientError, PodWatchEvent};

    fn stamped(client: &MockPodClient, namespace: &str, name: &str) -> bool {
        client
            .stored_pod(namespace, name)
            .and_then(|pod| pod.metadata.annotations)
            .is_some_and(|annotations| annotations.contains_key("timestamp"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_pod_always_routes_to_same_worker() {
        let client = MockPodClient::new();
        let (reconciler, _trigger) = test_reconciler(&client, test_config());
        let dispatcher = Dispatcher::spawn(Arc::new(reconciler), Arc::default());

        let key = PodKey::new("prod-a", "web-1");
        let first = dispatcher.worker_for(&key);
        for _ in 0..10 {
            assert_eq!(dispatcher.worker_for(&key), first);
        }
        assert!(first < 4);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_run_concurrently_across_pods() {
        let client = MockPodClient::new();
        let config = ControllerConfig {
            worker_count: 1,
            ..test_config()
        };
        let (reconciler, _trigger) = test_reconciler(&client, config);
        let reconciler = Arc::new(reconciler);
        let tally = Arc::new(OutcomeTally::default());
        let dispatcher = Dispatcher::spawn(reconciler, tally.clone());

        // Two pods on the single worker, delivered together: both are done
        // one delay after delivery, not two
        let start = Instant::now();
        for name in ["web-1", "web-2"] {
            client.insert_pod(test_pod("prod-a", name, Utc::now()));
            dispatcher
                .dispatch(PodKey::new("prod-a", name), start + Duration::from_secs(5))
                .await
                .unwrap();
        }
        dispatcher.shutdown(Duration::from_secs(60)).await;

        assert!(stamped(&client, "prod-a", "web-1"));
        assert!(stamped(&client, "prod-a", "web-2"));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(tally.annotated(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_past_grace_are_aborted() {
        let client = MockPodClient::new();
        client.insert_pod(test_pod("prod-a", "web-1", Utc::now()));
        // The trigger is never fired, so only the grace period ends the wait
        let (reconciler, _trigger) = test_reconciler(&client, test_config());
        let dispatcher = Dispatcher::spawn(Arc::new(reconciler), Arc::default());

        let start = Instant::now();
        dispatcher
            .dispatch(PodKey::new("prod-a", "web-1"), start + Duration::from_secs(60))
            .await
            .unwrap();
        dispatcher.shutdown(Duration::from_secs(1)).await;

        assert!(start.elapsed() < Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(client.get_calls(), 0);
        assert!(!stamped(&client, "prod-a", "web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_annotates_new_pods_until_shutdown() {
        let client = MockPodClient::new();
        let web = test_pod("prod-a", "web-1", Utc::now());
        let dns = test_pod("kube-system", "dns", Utc::now());
        let old = test_pod("prod-a", "old", Utc::now() - chrono::Duration::seconds(300));
        client.push_open_watch_session(vec![
            Ok(PodWatchEvent::Added(web.clone())),
            Ok(PodWatchEvent::Added(dns.clone())),
            Ok(PodWatchEvent::Added(old.clone())),
            Ok(PodWatchEvent::Modified(web.clone())),
        ]);
        let config = ControllerConfig {
            namespace_filter: "prod".to_string(),
            ..test_config()
        };
        let (trigger, signal) = shutdown::channel();
        let controller = Controller::with_client(Arc::new(client.clone()), Arc::new(config), signal);

        let tally = controller.tally.clone();
        let run = tokio::spawn(controller.run());
        // The pods show up in the API after the (empty) initial list
        tokio::time::sleep(Duration::from_secs(1)).await;
        for pod in [web, dns, old] {
            client.insert_pod(pod);
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        run.await.unwrap().unwrap();

        assert!(stamped(&client, "prod-a", "web-1"));
        assert!(!stamped(&client, "kube-system", "dns"));
        assert!(!stamped(&client, "prod-a", "old"));
        assert_eq!(client.get_calls(), 1);
        assert_eq!(client.replace_calls(), 1);
        assert_eq!(tally.annotated(), 1);
        // dns, old and the Modified web-1
        assert_eq!(tally.skipped(), 3);
        assert_eq!(tally.failed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_list_backlog_is_annotated_only_when_recent() {
        let client = MockPodClient::new();
        client.insert_pod(test_pod("prod-a", "fresh", Utc::now()));
        client.insert_pod(test_pod("prod-a", "stale", Utc::now() - chrono::Duration::seconds(3600)));
        let (trigger, signal) = shutdown::channel();
        let controller = Controller::with_client(Arc::new(client.clone()), Arc::new(test_config()), signal);

        let run = tokio::spawn(controller.run());
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        run.await.unwrap().unwrap();

        assert!(stamped(&client, "prod-a", "fresh"));
        assert!(!stamped(&client, "prod-a", "stale"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_on_auth_error() {
        let client = MockPodClient::new();
        client.fail_next_list(PodClientError::Auth("Unauthorized".to_string()));
        let (_trigger, signal) = shutdown::channel();
        let controller = Controller::with_client(Arc::new(client), Arc::new(test_config()), signal);

        let result = controller.run().await;

        assert!(matches!(result, Err(ControllerError::Auth(msg)) if msg == "Unauthorized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_drops_pending_annotations() {
        let client = MockPodClient::new();
        client.insert_pod(test_pod("prod-a", "web-1", Utc::now()));
        client.fail_next_watch(PodClientError::Auth("token expired".to_string()));
        let (_trigger, signal) = shutdown::channel();
        let controller = Controller::with_client(Arc::new(client.clone()), Arc::new(test_config()), signal);

        // web-1 is admitted from the initial list, then the watch is rejected
        let start = Instant::now();
        let result = controller.run().await;

        assert!(matches!(result, Err(ControllerError::Auth(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.get_calls(), 0);
        assert!(!stamped(&client, "prod-a", "web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_annotations() {
        let client = MockPodClient::new();
        client.insert_pod(test_pod("prod-a", "web-1", Utc::now()));
        let (trigger, signal) = shutdown::channel();
        let controller = Controller::with_client(Arc::new(client.clone()), Arc::new(test_config()), signal);

        let run = tokio::spawn(controller.run());
        // Inside the 5s delay
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
        run.await.unwrap().unwrap();

        assert!(!stamped(&client, "prod-a", "web-1"));
        assert_eq!(client.get_calls(), 0);
    }
}
