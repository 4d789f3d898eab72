//! Per-operation metrics tracking.
//!
//! An [`OperationTracker`] is acquired when a skopeo invocation starts and
//! released exactly once when it ends. Acquisition increments the in-flight
//! gauge and starts a [`HeartbeatSampler`]; release stops the sampler, removes
//! its gauges, decrements the in-flight gauge and records the outcome.
//!
//! Release is explicit through [`OperationTracker::finish`]. A tracker that is
//! dropped without finishing (early return, panic, cancelled future) releases
//! itself with [`ErrorKind::Aborted`], so the in-flight gauge can never leak.
//!
//! When metrics are disabled the tracker is an inert shell and every call is a
//! no-op.

mod heartbeat;

pub use heartbeat::{HeartbeatReading, HeartbeatSampler, SamplerState, DEFAULT_HEARTBEAT_INTERVAL};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metrics::{ErrorKind, MetricsRegistry, OperationStatus, OperationSummary, TransportKind};
use crate::progress::{Operation, ProgressInfo};

/// Tracker settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Heartbeat sampling period.
    pub heartbeat_interval: Duration,
    /// When false, trackers are inert.
    pub metrics_enabled: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            metrics_enabled: true,
        }
    }
}

impl TrackerConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }
}

/// Transports involved in an operation, for the source/destination counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationLabels {
    pub source: Option<TransportKind>,
    pub destination: Option<TransportKind>,
}

impl OperationLabels {
    pub fn new(source: Option<&str>, destination: Option<&str>) -> Self {
        Self {
            source: source.map(TransportKind::from_reference),
            destination: destination.map(TransportKind::from_reference),
        }
    }
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ErrorKind),
}

impl Outcome {
    pub fn status(&self) -> OperationStatus {
        match self {
            Outcome::Success => OperationStatus::Success,
            Outcome::Failure(_) => OperationStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgressMark {
    at: Instant,
    percent: f64,
}

/// Mutable state shared between a tracker and its heartbeat sampler.
///
/// Counters are atomics; the last-progress pair sits behind one lock so a
/// reader never sees a timestamp from one update and a percentage from another.
#[derive(Debug)]
pub struct TrackerState {
    start: Instant,
    blob_count: AtomicU64,
    bytes_total: AtomicU64,
    last_progress: Mutex<ProgressMark>,
}

impl TrackerState {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            blob_count: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            last_progress: Mutex::new(ProgressMark {
                at: start,
                percent: 0.0,
            }),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn blob_count(&self) -> u64 {
        self.blob_count.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    /// Count one finished blob. Unknown sizes add nothing to the byte total.
    pub fn add_blob(&self, size: Option<u64>) {
        self.blob_count.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = size {
            self.bytes_total.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Record that parser progress was observed at `at`.
    pub fn mark_progress(&self, at: Instant, percent: f64) {
        *self.last_progress.lock() = ProgressMark { at, percent };
    }

    /// Timestamp and percentage of the last recorded progress.
    pub fn last_progress(&self) -> (Instant, f64) {
        let mark = *self.last_progress.lock();
        (mark.at, mark.percent)
    }
}

struct ActiveTracker {
    metrics: Arc<MetricsRegistry>,
    id: String,
    labels: OperationLabels,
    state: Arc<TrackerState>,
    sampler: HeartbeatSampler,
}

/// Scoped metrics for one skopeo invocation.
pub struct OperationTracker {
    operation: Operation,
    active: Option<ActiveTracker>,
}

impl OperationTracker {
    /// Begin tracking an operation.
    ///
    /// Returns an inert tracker when `metrics` is `None` or metrics are
    /// disabled in `config`.
    pub fn acquire(
        metrics: Option<&Arc<MetricsRegistry>>,
        config: &TrackerConfig,
        operation: Operation,
        labels: OperationLabels,
    ) -> Self {
        let metrics = match metrics {
            Some(metrics) if config.metrics_enabled => Arc::clone(metrics),
            _ => return Self::disabled(operation),
        };

        let id = metrics.next_operation_id(operation);
        let state = Arc::new(TrackerState::new(Instant::now()));
        metrics.operation_started(operation);

        let sampler = {
            let metrics = Arc::clone(&metrics);
            let id = id.clone();
            HeartbeatSampler::start(Arc::clone(&state), config.heartbeat_interval, move |reading| {
                metrics.publish_heartbeat(operation, &id, &reading);
            })
        };

        debug!(operation = %operation, operation_id = %id, "operation tracker acquired");

        Self {
            operation,
            active: Some(ActiveTracker {
                metrics,
                id,
                labels,
                state,
                sampler,
            }),
        }
    }

    /// A tracker that records nothing.
    pub fn disabled(operation: Operation) -> Self {
        Self {
            operation,
            active: None,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Heartbeat label value, when enabled.
    pub fn operation_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.id.as_str())
    }

    /// Blobs counted so far.
    pub fn blob_count(&self) -> u64 {
        self.active
            .as_ref()
            .map_or(0, |active| active.state.blob_count())
    }

    /// Known blob bytes counted so far.
    pub fn bytes_total(&self) -> u64 {
        self.active
            .as_ref()
            .map_or(0, |active| active.state.bytes_total())
    }

    /// Count one finished blob.
    pub fn add_blob(&self, size: Option<u64>) {
        if let Some(active) = &self.active {
            active.state.add_blob(size);
            active.metrics.record_blob(self.operation, size);
        }
    }

    /// Note that the parser advanced. Resets staleness.
    pub fn record_progress(&self, info: &ProgressInfo) {
        if let Some(active) = &self.active {
            active.state.mark_progress(Instant::now(), info.percent());
        }
    }

    /// Release the tracker with an explicit outcome.
    pub fn finish(mut self, outcome: Outcome) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: Outcome) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        // Joined before clearing, so no tick can republish the gauges.
        active.sampler.stop();
        active.metrics.clear_heartbeat(self.operation, &active.id);

        let summary = OperationSummary {
            status: outcome.status(),
            duration: active.state.start_time().elapsed(),
            blob_count: active.state.blob_count(),
            bytes_total: active.state.bytes_total(),
            source: active.labels.source,
            destination: active.labels.destination,
        };
        active.metrics.operation_finished(self.operation, &summary);
        if let Outcome::Failure(kind) = outcome {
            active.metrics.record_error(self.operation, kind);
        }

        debug!(
            operation = %self.operation,
            operation_id = %active.id,
            status = %summary.status,
            blobs = summary.blob_count,
            duration_ms = summary.duration.as_millis() as u64,
            "operation tracker released"
        );
    }
}

impl Drop for OperationTracker {
    fn drop(&mut self) {
        if self.active.is_some() {
            warn!(operation = %self.operation, "operation tracker dropped without release");
            self.release(Outcome::Failure(ErrorKind::Aborted));
        }
    }
}

impl std::fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationTracker")
            .field("operation", &self.operation)
            .field("operation_id", &self.operation_id())
            .finish()
    }
}
