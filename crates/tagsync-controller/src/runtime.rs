//! Event pumps and the reconcile worker pool.
//!
//! One [`EventPump`] per cluster turns stream notifications into tag
//! requests on the shared [`WorkQueue`]; [`Controller::run`] drives a fixed
//! number of workers that pull keys and reconcile them.

use std::sync::Arc;

use tagsync_core::cluster::{ClusterSet, StreamEvent};
use tagsync_core::id::TagRequest;
use tokio::sync::{mpsc, watch};

use crate::config::ControllerConfig;
use crate::filter::RequestFilter;
use crate::mapper::TagEventMapper;
use crate::metrics::TimingGuard;
use crate::queue::WorkQueue;
use crate::reconciler::{CONTROLLER_NAME, PullSecretSource, ReconcilerOptions, SyncReconciler};

/// Feeds one cluster's stream notifications into the work queue.
#[derive(Debug, Clone)]
pub struct EventPump {
    cluster: String,
    mapper: TagEventMapper,
    queue: WorkQueue<TagRequest>,
}

impl EventPump {
    /// Creates a pump for `cluster`.
    #[must_use]
    pub fn new(cluster: impl Into<String>, mapper: TagEventMapper, queue: WorkQueue<TagRequest>) -> Self {
        Self {
            cluster: cluster.into(),
            mapper,
            queue,
        }
    }

    /// Enqueues the requests for one notification and returns how many
    /// were produced.
    pub fn handle(&self, event: &StreamEvent) -> usize {
        let requests = self.mapper.map(event);
        let count = requests.len();
        for request in requests {
            self.queue.add(request);
        }
        if count > 0 {
            tracing::trace!(cluster = %self.cluster, stream = %event.stream().identity(), count, "enqueued tag requests");
        }
        count
    }

    /// Drains `events` until the channel closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<StreamEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(&event);
        }
        tracing::debug!(cluster = %self.cluster, "event stream closed");
    }
}

/// The reconcile worker pool.
#[derive(Debug, Clone)]
pub struct Controller {
    reconciler: Arc<SyncReconciler>,
    queue: WorkQueue<TagRequest>,
    workers: usize,
}

impl Controller {
    /// Creates a controller with its own queue.
    #[must_use]
    pub fn new(reconciler: SyncReconciler, workers: usize) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: WorkQueue::new(CONTROLLER_NAME),
            workers: workers.max(1),
        }
    }

    /// Wires a controller from configuration.
    #[must_use]
    pub fn from_config(
        config: &ControllerConfig,
        clusters: ClusterSet,
        pull_secret: PullSecretSource,
    ) -> Self {
        let domains = config.registry_domains(&clusters);
        let reconciler = SyncReconciler::new(
            clusters,
            domains,
            pull_secret,
            ReconcilerOptions::from(config),
        );
        Self::new(reconciler, config.workers)
    }

    /// The queue workers pull from.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<TagRequest> {
        &self.queue
    }

    /// The reconciler workers run.
    #[must_use]
    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    /// Creates a pump for `cluster` feeding this controller's queue.
    #[must_use]
    pub fn event_pump(&self, cluster: impl Into<String>, filter: RequestFilter) -> EventPump {
        EventPump::new(cluster, TagEventMapper::filtered(filter), self.queue.clone())
    }

    /// Processes one key. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        process_next(&self.reconciler, &self.queue).await
    }

    /// Runs the workers until `shutdown` turns true or its sender is
    /// dropped, then shuts the queue down and waits for in-flight keys.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(workers = self.workers, "starting reconcile workers");
        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let reconciler = Arc::clone(&self.reconciler);
                let queue = self.queue.clone();
                tokio::spawn(async move { while process_next(&reconciler, &queue).await {} })
            })
            .collect();

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        self.queue.shut_down();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "reconcile worker panicked");
            }
        }
        tracing::info!("reconcile workers stopped");
    }
}

async fn process_next(reconciler: &SyncReconciler, queue: &WorkQueue<TagRequest>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let _timer = TimingGuard::new(|elapsed| {
        tracing::trace!(?elapsed, "processed work item");
    });

    match reconciler.reconcile(&key).await {
        Ok(_) => queue.forget(&key),
        Err(e) if e.is_terminal() => {
            tracing::warn!(request = %key, error = %e, "dropping request after terminal failure");
            queue.forget(&key);
        }
        Err(_) => queue.add_rate_limited(key.clone()),
    }
    queue.done(&key);
    true
}
