//! skopeo-wrapper - progress parsing and metrics for skopeo image transfers
//!
//! This library runs the `skopeo` binary, turns its stderr chatter into
//! structured progress, and records Prometheus metrics for every operation,
//! including a periodic heartbeat that makes stalled transfers visible.
//!
//! # Modules
//!
//! - [`progress`] - progress model and the stderr line parser
//! - [`metrics`] - process-wide Prometheus registry
//! - [`tracker`] - per-operation tracking and the heartbeat sampler
//! - [`skopeo`] - async runner for skopeo subcommands
//! - [`config`] - ini-file configuration
//! - [`logging`] - tracing subscriber setup for binaries
//! - `server` - `/metrics` HTTP endpoint (feature `metrics-server`)

pub mod config;
pub mod logging;
pub mod metrics;
pub mod progress;
#[cfg(feature = "metrics-server")]
pub mod server;
pub mod skopeo;
pub mod tracker;

pub use config::WrapperConfig;
pub use metrics::MetricsRegistry;
pub use progress::{ProgressInfo, ProgressParser};
pub use skopeo::{CommandOutput, ImageExistence, SkopeoWrapper};
pub use tracker::OperationTracker;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
