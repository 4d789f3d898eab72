//! Prometheus metrics for skopeo operations.
//!
//! A single [`MetricsRegistry`] is constructed at startup and shared by
//! `Arc` with every tracker. All updates go through the prometheus
//! primitives' own atomics, so callers never lock.
//!
//! # Metric Families
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `skopeo_operations_total` | counter | operation, status |
//! | `skopeo_operation_errors_total` | counter | operation, error_type |
//! | `skopeo_operation_duration_seconds` | histogram | operation |
//! | `skopeo_blobs_processed_total` | counter | operation, status |
//! | `skopeo_blob_size_bytes` | histogram | operation |
//! | `skopeo_operation_blob_count` | histogram | operation, status |
//! | `skopeo_operation_transferred_bytes` | histogram | operation, status |
//! | `skopeo_active_operations` | gauge | operation |
//! | `skopeo_source_operations_total` | counter | source_type, operation |
//! | `skopeo_destination_operations_total` | counter | destination_type, operation |
//! | `skopeo_active_operation_duration_seconds` | gauge | operation, operation_id |
//! | `skopeo_operation_speed_blobs_per_second` | gauge | operation, operation_id |
//! | `skopeo_operation_stale_seconds` | gauge | operation, operation_id |
//! | `skopeo_operation_last_progress_percent` | gauge | operation, operation_id |
//! | `skopeo_wrapper_info` | gauge | version |
//!
//! Heartbeat gauges are removed when their operation is released.

mod labels;

pub use labels::{ErrorKind, OperationStatus, TransportKind};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

use crate::progress::Operation;
use crate::tracker::HeartbeatReading;

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Errors raised while building or rendering the registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric definition or registration failed.
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Encoded output was not valid UTF-8.
    #[error("Metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

const BLOB_SIZE_BUCKETS: &[f64] = &[
    1024.0,
    10_240.0,
    102_400.0,
    1_048_576.0,
    10_485_760.0,
    104_857_600.0,
    1_073_741_824.0,
];

const BLOB_COUNT_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0];

const TRANSFERRED_BYTES_BUCKETS: &[f64] = &[
    1_048_576.0,
    10_485_760.0,
    104_857_600.0,
    1_073_741_824.0,
    10_737_418_240.0,
];

/// Everything recorded when an operation is released.
#[derive(Debug, Clone)]
pub struct OperationSummary {
    pub status: OperationStatus,
    pub duration: Duration,
    pub blob_count: u64,
    pub bytes_total: u64,
    pub source: Option<TransportKind>,
    pub destination: Option<TransportKind>,
}

/// Process-wide metrics for skopeo operations.
pub struct MetricsRegistry {
    registry: Registry,

    operations_total: IntCounterVec,
    operation_errors_total: IntCounterVec,
    operation_duration_seconds: HistogramVec,
    blobs_processed_total: IntCounterVec,
    blob_size_bytes: HistogramVec,
    operation_blob_count: HistogramVec,
    operation_transferred_bytes: HistogramVec,
    active_operations: IntGaugeVec,
    source_operations_total: IntCounterVec,
    destination_operations_total: IntCounterVec,

    active_duration_seconds: GaugeVec,
    speed_blobs_per_second: GaugeVec,
    stale_seconds: GaugeVec,
    last_progress_percent: GaugeVec,

    next_operation_id: AtomicU64,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("next_operation_id", &self.next_operation_id)
            .finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Build and register every metric family on a fresh registry.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            Opts::new("skopeo_operations_total", "Total number of skopeo operations"),
            &["operation", "status"],
        )?;
        let operation_errors_total = IntCounterVec::new(
            Opts::new(
                "skopeo_operation_errors_total",
                "Total number of failed skopeo operations by error kind",
            ),
            &["operation", "error_type"],
        )?;
        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "skopeo_operation_duration_seconds",
                "Duration of skopeo operations in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        let blobs_processed_total = IntCounterVec::new(
            Opts::new("skopeo_blobs_processed_total", "Total number of processed blobs"),
            &["operation", "status"],
        )?;
        let blob_size_bytes = HistogramVec::new(
            HistogramOpts::new("skopeo_blob_size_bytes", "Size of processed blobs in bytes")
                .buckets(BLOB_SIZE_BUCKETS.to_vec()),
            &["operation"],
        )?;
        let operation_blob_count = HistogramVec::new(
            HistogramOpts::new(
                "skopeo_operation_blob_count",
                "Number of blobs processed per operation",
            )
            .buckets(BLOB_COUNT_BUCKETS.to_vec()),
            &["operation", "status"],
        )?;
        let operation_transferred_bytes = HistogramVec::new(
            HistogramOpts::new(
                "skopeo_operation_transferred_bytes",
                "Known blob bytes processed per operation",
            )
            .buckets(TRANSFERRED_BYTES_BUCKETS.to_vec()),
            &["operation", "status"],
        )?;
        let active_operations = IntGaugeVec::new(
            Opts::new("skopeo_active_operations", "Number of skopeo operations in flight"),
            &["operation"],
        )?;
        let source_operations_total = IntCounterVec::new(
            Opts::new("skopeo_source_operations_total", "Operations by source transport"),
            &["source_type", "operation"],
        )?;
        let destination_operations_total = IntCounterVec::new(
            Opts::new(
                "skopeo_destination_operations_total",
                "Operations by destination transport",
            ),
            &["destination_type", "operation"],
        )?;

        let active_duration_seconds = GaugeVec::new(
            Opts::new(
                "skopeo_active_operation_duration_seconds",
                "Elapsed time of an in-flight operation",
            ),
            &["operation", "operation_id"],
        )?;
        let speed_blobs_per_second = GaugeVec::new(
            Opts::new(
                "skopeo_operation_speed_blobs_per_second",
                "Blob throughput of an in-flight operation",
            ),
            &["operation", "operation_id"],
        )?;
        let stale_seconds = GaugeVec::new(
            Opts::new(
                "skopeo_operation_stale_seconds",
                "Seconds since an in-flight operation last reported progress",
            ),
            &["operation", "operation_id"],
        )?;
        let last_progress_percent = GaugeVec::new(
            Opts::new(
                "skopeo_operation_last_progress_percent",
                "Last approximate progress percentage of an in-flight operation",
            ),
            &["operation", "operation_id"],
        )?;

        let version_info = IntGaugeVec::new(
            Opts::new("skopeo_wrapper_info", "skopeo-wrapper build information"),
            &["version"],
        )?;
        version_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_errors_total.clone()))?;
        registry.register(Box::new(operation_duration_seconds.clone()))?;
        registry.register(Box::new(blobs_processed_total.clone()))?;
        registry.register(Box::new(blob_size_bytes.clone()))?;
        registry.register(Box::new(operation_blob_count.clone()))?;
        registry.register(Box::new(operation_transferred_bytes.clone()))?;
        registry.register(Box::new(active_operations.clone()))?;
        registry.register(Box::new(source_operations_total.clone()))?;
        registry.register(Box::new(destination_operations_total.clone()))?;
        registry.register(Box::new(active_duration_seconds.clone()))?;
        registry.register(Box::new(speed_blobs_per_second.clone()))?;
        registry.register(Box::new(stale_seconds.clone()))?;
        registry.register(Box::new(last_progress_percent.clone()))?;
        registry.register(Box::new(version_info))?;

        Ok(Self {
            registry,
            operations_total,
            operation_errors_total,
            operation_duration_seconds,
            blobs_processed_total,
            blob_size_bytes,
            operation_blob_count,
            operation_transferred_bytes,
            active_operations,
            source_operations_total,
            destination_operations_total,
            active_duration_seconds,
            speed_blobs_per_second,
            stale_seconds,
            last_progress_percent,
            next_operation_id: AtomicU64::new(1),
        })
    }

    /// The underlying prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Allocate a process-unique identifier for heartbeat gauges.
    pub fn next_operation_id(&self, operation: Operation) -> String {
        let id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", operation.as_str(), id)
    }

    /// An operation entered flight.
    pub fn operation_started(&self, operation: Operation) {
        self.active_operations
            .with_label_values(&[operation.as_str()])
            .inc();
    }

    /// An operation left flight. Must be paired with exactly one
    /// [`operation_started`](Self::operation_started).
    pub fn operation_finished(&self, operation: Operation, summary: &OperationSummary) {
        let op = operation.as_str();
        let status = summary.status.as_str();

        self.active_operations.with_label_values(&[op]).dec();
        self.operations_total.with_label_values(&[op, status]).inc();
        self.operation_duration_seconds
            .with_label_values(&[op])
            .observe(summary.duration.as_secs_f64());
        self.operation_blob_count
            .with_label_values(&[op, status])
            .observe(summary.blob_count as f64);
        if summary.bytes_total > 0 {
            self.operation_transferred_bytes
                .with_label_values(&[op, status])
                .observe(summary.bytes_total as f64);
        }

        if let Some(source) = summary.source {
            self.source_operations_total
                .with_label_values(&[source.as_str(), op])
                .inc();
        }
        if let Some(destination) = summary.destination {
            self.destination_operations_total
                .with_label_values(&[destination.as_str(), op])
                .inc();
        }
    }

    /// Count a failure by kind.
    pub fn record_error(&self, operation: Operation, kind: ErrorKind) {
        self.operation_errors_total
            .with_label_values(&[operation.as_str(), kind.as_str()])
            .inc();
    }

    /// Count one finished blob and sample its size when known.
    pub fn record_blob(&self, operation: Operation, size: Option<u64>) {
        let op = operation.as_str();
        self.blobs_processed_total
            .with_label_values(&[op, OperationStatus::Success.as_str()])
            .inc();
        if let Some(size) = size.filter(|size| *size > 0) {
            self.blob_size_bytes
                .with_label_values(&[op])
                .observe(size as f64);
        }
    }

    /// Publish one heartbeat sample for an in-flight operation.
    pub fn publish_heartbeat(&self, operation: Operation, id: &str, reading: &HeartbeatReading) {
        let labels = [operation.as_str(), id];
        self.active_duration_seconds
            .with_label_values(&labels)
            .set(reading.elapsed.as_secs_f64());
        self.speed_blobs_per_second
            .with_label_values(&labels)
            .set(reading.blobs_per_second);
        self.stale_seconds
            .with_label_values(&labels)
            .set(reading.staleness.as_secs_f64());
        self.last_progress_percent
            .with_label_values(&labels)
            .set(reading.last_percent);
    }

    /// Drop the heartbeat series of a released operation.
    pub fn clear_heartbeat(&self, operation: Operation, id: &str) {
        let labels = [operation.as_str(), id];
        // Absent series are fine: the sampler may never have ticked.
        let _ = self.active_duration_seconds.remove_label_values(&labels);
        let _ = self.speed_blobs_per_second.remove_label_values(&labels);
        let _ = self.stale_seconds.remove_label_values(&labels);
        let _ = self.last_progress_percent.remove_label_values(&labels);
    }

    /// Render the text exposition format.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Flat `name{labels} -> value` view of every sample, for debugging.
    pub fn snapshot(&self) -> MetricsResult<BTreeMap<String, f64>> {
        let text = self.encode_text()?;
        let samples = text
            .lines()
            .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
            .filter_map(|line| {
                let (key, value) = line.rsplit_once(' ')?;
                Some((key.to_string(), value.parse::<f64>().ok()?))
            })
            .collect();
        Ok(samples)
    }

    /// Current `skopeo_operations_total` for a label pair.
    pub fn operations_total(&self, operation: Operation, status: OperationStatus) -> u64 {
        self.operations_total
            .with_label_values(&[operation.as_str(), status.as_str()])
            .get()
    }

    /// Current `skopeo_blobs_processed_total` for a label pair.
    pub fn blobs_processed_total(&self, operation: Operation, status: OperationStatus) -> u64 {
        self.blobs_processed_total
            .with_label_values(&[operation.as_str(), status.as_str()])
            .get()
    }

    /// Current `skopeo_operation_errors_total` for a label pair.
    pub fn errors_total(&self, operation: Operation, kind: ErrorKind) -> u64 {
        self.operation_errors_total
            .with_label_values(&[operation.as_str(), kind.as_str()])
            .get()
    }

    /// Current `skopeo_active_operations` for an operation type.
    pub fn active_operations(&self, operation: Operation) -> i64 {
        self.active_operations
            .with_label_values(&[operation.as_str()])
            .get()
    }

    /// Number of duration samples recorded for an operation type.
    pub fn duration_samples(&self, operation: Operation) -> u64 {
        self.operation_duration_seconds
            .with_label_values(&[operation.as_str()])
            .get_sample_count()
    }

    /// Current `skopeo_operation_stale_seconds` for an in-flight operation.
    ///
    /// Reads the rendered samples so a removed series is not recreated.
    pub fn stale_seconds(&self, operation: Operation, id: &str) -> Option<f64> {
        let key = format!(
            "skopeo_operation_stale_seconds{{operation=\"{}\",operation_id=\"{}\"}}",
            operation.as_str(),
            id
        );
        self.snapshot().ok()?.get(&key).copied()
    }

    /// Whether heartbeat series exist for an operation.
    pub fn has_heartbeat(&self, operation: Operation, id: &str) -> bool {
        self.stale_seconds(operation, id).is_some()
    }
}
