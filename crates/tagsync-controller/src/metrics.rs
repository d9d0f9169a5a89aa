//! Observability metrics for the synchronisation engine.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tagsync_imports_total` | Counter | `controller`, `cluster`, `namespace`, `image_stream`, `result` | Follower tag imports |
//! | `tagsync_reconcile_duration_seconds` | Histogram | `controller`, `result` | Duration of one reconcile |
//! | `tagsync_work_queue_depth` | Gauge | `queue` | Keys waiting in the work queue |
//! | `tagsync_mirror_tasks` | Gauge | `owner` | Pending mirror tasks |
//! | `tagsync_mirror_duration_seconds` | Histogram | `result` | Duration of one mirror batch |
//!
//! All calls are no-ops until a recorder (e.g. the Prometheus exporter) is
//! installed.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: follower tag imports by outcome.
    pub const IMPORTS_TOTAL: &str = "tagsync_imports_total";
    /// Histogram: reconcile duration in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "tagsync_reconcile_duration_seconds";
    /// Gauge: keys waiting in a work queue.
    pub const WORK_QUEUE_DEPTH: &str = "tagsync_work_queue_depth";
    /// Gauge: pending mirror tasks per owner.
    pub const MIRROR_TASKS: &str = "tagsync_mirror_tasks";
    /// Histogram: mirror batch duration in seconds.
    pub const MIRROR_DURATION_SECONDS: &str = "tagsync_mirror_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Controller name.
    pub const CONTROLLER: &str = "controller";
    /// Follower cluster name.
    pub const CLUSTER: &str = "cluster";
    /// Namespace of the stream.
    pub const NAMESPACE: &str = "namespace";
    /// Stream name.
    pub const IMAGE_STREAM: &str = "image_stream";
    /// Outcome (`success`, `failure`).
    pub const RESULT: &str = "result";
    /// Queue name.
    pub const QUEUE: &str = "queue";
    /// Mirror task owner.
    pub const OWNER: &str = "owner";
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and returns a render handle.
///
/// Safe to call more than once; later calls return the first handle.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if another recorder is already
/// installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::configuration(format!("failed to install prometheus recorder: {e}")))?;

    describe_counter!(names::IMPORTS_TOTAL, "Follower tag imports by outcome");
    describe_histogram!(
        names::RECONCILE_DURATION_SECONDS,
        "Duration of one tag reconcile in seconds"
    );
    describe_gauge!(names::WORK_QUEUE_DEPTH, "Keys waiting in the work queue");
    describe_gauge!(names::MIRROR_TASKS, "Pending mirror tasks per owner");
    describe_histogram!(
        names::MIRROR_DURATION_SECONDS,
        "Duration of one mirror batch in seconds"
    );

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Outcome label value.
#[must_use]
pub const fn result_label(ok: bool) -> &'static str {
    if ok { "success" } else { "failure" }
}

/// Handle for recording engine metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics;

impl SyncMetrics {
    /// Creates a metrics handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Counts one follower import attempt.
    pub fn count_import_result(
        &self,
        controller: &str,
        cluster: &str,
        namespace: &str,
        image_stream: &str,
        ok: bool,
    ) {
        counter!(
            names::IMPORTS_TOTAL,
            labels::CONTROLLER => controller.to_string(),
            labels::CLUSTER => cluster.to_string(),
            labels::NAMESPACE => namespace.to_string(),
            labels::IMAGE_STREAM => image_stream.to_string(),
            labels::RESULT => result_label(ok),
        )
        .increment(1);
    }

    /// Records how long one reconcile took.
    pub fn observe_reconcile(&self, controller: &str, ok: bool, duration: Duration) {
        histogram!(
            names::RECONCILE_DURATION_SECONDS,
            labels::CONTROLLER => controller.to_string(),
            labels::RESULT => result_label(ok),
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the work queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::WORK_QUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }

    /// Sets the number of pending mirror tasks for an owner.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_mirror_tasks(&self, owner: &str, count: usize) {
        gauge!(names::MIRROR_TASKS, labels::OWNER => owner.to_string()).set(count as f64);
    }

    /// Records how long one mirror batch took.
    pub fn observe_mirror(&self, ok: bool, duration: Duration) {
        histogram!(
            names::MIRROR_DURATION_SECONDS,
            labels::RESULT => result_label(ok),
        )
        .record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
