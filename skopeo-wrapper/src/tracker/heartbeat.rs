//! Background heartbeat sampling for in-flight operations.
//!
//! The sampler runs on its own thread and wakes on a fixed period, whether or
//! not skopeo has printed anything new. Each tick turns the shared
//! [`TrackerState`] into a [`HeartbeatReading`] and hands it to a publish
//! function. A growing staleness alongside a growing duration is how a
//! monitoring system spots a stalled transfer.
//!
//! # State Machine
//!
//! ```text
//! start() ──► Running ──stop()──► Stopped (terminal)
//! ```
//!
//! `stop()` sends on a channel and joins the thread, so no publish can happen
//! after it returns.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::TrackerState;

/// Default sampling period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Derived liveness values for one operation at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatReading {
    /// Time since the operation was acquired.
    pub elapsed: Duration,
    /// Finished blobs divided by elapsed seconds; 0 when no time has passed.
    pub blobs_per_second: f64,
    /// Time since the last recorded parser progress.
    pub staleness: Duration,
    /// Last recorded approximate percentage.
    pub last_percent: f64,
}

impl HeartbeatReading {
    /// Compute a reading from tracker state as of `now`.
    pub fn from_state(state: &TrackerState, now: Instant) -> Self {
        let elapsed = now.saturating_duration_since(state.start_time());
        let (last_at, last_percent) = state.last_progress();
        let blobs_per_second = if elapsed.is_zero() {
            0.0
        } else {
            state.blob_count() as f64 / elapsed.as_secs_f64()
        };

        Self {
            elapsed,
            blobs_per_second,
            staleness: now.saturating_duration_since(last_at),
            last_percent,
        }
    }
}

/// Lifecycle state of a [`HeartbeatSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Running,
    Stopped,
}

/// Periodic sampler bound to one tracker.
#[derive(Debug)]
pub struct HeartbeatSampler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    state: SamplerState,
}

impl HeartbeatSampler {
    /// Start sampling `state` every `interval`.
    ///
    /// If the thread cannot be spawned the sampler starts out `Stopped`; the
    /// operation still runs, only without heartbeat gauges.
    pub fn start<F>(state: Arc<TrackerState>, interval: Duration, mut publish: F) -> Self
    where
        F: FnMut(HeartbeatReading) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("skopeo-heartbeat".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        publish(HeartbeatReading::from_state(&state, Instant::now()));
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => {
                debug!(interval_ms = interval.as_millis() as u64, "heartbeat sampler started");
                Self {
                    stop_tx: Some(stop_tx),
                    handle: Some(handle),
                    state: SamplerState::Running,
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn heartbeat sampler");
                Self {
                    stop_tx: None,
                    handle: None,
                    state: SamplerState::Stopped,
                }
            }
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Stop sampling and wait for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The thread may already be gone; the join below still applies.
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("heartbeat sampler panicked");
            }
        }
        self.state = SamplerState::Stopped;
    }
}

impl Drop for HeartbeatSampler {
    fn drop(&mut self) {
        self.stop();
    }
}
