//! Integration tests for the skopeo runner.
//!
//! Each test writes a small shell script standing in for skopeo and drives
//! [`SkopeoWrapper`] against it, checking the returned output, the progress
//! callback sequence, and the metrics left behind.
//!
//! Run with: `cargo test --test skopeo_runner_integration`

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use skopeo_wrapper::config::WrapperConfig;
use skopeo_wrapper::metrics::{ErrorKind, MetricsRegistry, OperationStatus};
use skopeo_wrapper::progress::{Operation, ProgressInfo, Step};
use skopeo_wrapper::skopeo::{ImageExistence, SkopeoWrapper};

// ============================================================================
// Helper Functions
// ============================================================================

const LAYER: &str = "sha256:af6eaf76a39c2d3e7e0b8a0420486e3df33c4027d696c076a99a3d0ac09026af";
const CONFIG: &str = "sha256:392fa14dddd0d6cc0fb7e5d4e6b2dd61f1e1e1d2b0c1a0c2b4c6d3d4e5f60718";

/// Write an executable fake skopeo with the given shell body.
fn fake_skopeo(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("skopeo");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Wrapper with a fresh registry and a fast heartbeat.
fn wrapper(skopeo: PathBuf) -> (SkopeoWrapper, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let config = WrapperConfig::default()
        .with_skopeo_path(skopeo)
        .with_heartbeat_interval(Duration::from_millis(50));
    (SkopeoWrapper::new(config, Some(Arc::clone(&metrics))), metrics)
}

fn copy_script() -> String {
    format!(
        "cat >&2 <<'EOF'\n\
         Getting image source signatures\n\
         Copying blob {layer}\n\
         Copying blob {layer} done\n\
         Copying config {config}\n\
         Writing manifest to image destination\n\
         EOF\n\
         echo \"$@\"\n\
         exit 0",
        layer = LAYER,
        config = CONFIG
    )
}

// ============================================================================
// Integration Tests
// ============================================================================

#[tokio::test]
async fn test_copy_success_reports_every_step() {
    let dir = TempDir::new().unwrap();
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, &copy_script()));

    let mut steps = Vec::new();
    let mut record = |info: &ProgressInfo| steps.push(info.current_step);
    let output = skopeo
        .copy(
            "docker://alpine:latest",
            "dir:/tmp/alpine",
            None,
            Some(&mut record),
        )
        .await;

    assert!(output.success, "stderr: {}", output.stderr);
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.error_kind, None);
    assert_eq!(output.stdout.trim(), "copy docker://alpine:latest dir:/tmp/alpine");

    // One callback per recognized line, then the terminal snapshot.
    assert_eq!(
        steps,
        vec![
            Step::GettingSignatures,
            Step::CopyingBlob,
            Step::CopyingBlob,
            Step::CopyingConfig,
            Step::WritingManifest,
            Step::Done,
        ]
    );

    let progress = &output.progress;
    assert!(progress.completed);
    assert_eq!(progress.percent(), 100.0);
    assert_eq!(progress.blobs.len(), 2);
    assert!(progress.blobs.iter().all(|blob| blob.is_done()));

    assert_eq!(metrics.active_operations(Operation::Copy), 0);
    assert_eq!(
        metrics.operations_total(Operation::Copy, OperationStatus::Success),
        1
    );
    assert_eq!(
        metrics.blobs_processed_total(Operation::Copy, OperationStatus::Success),
        2
    );

    let text = metrics.encode_text().unwrap();
    assert!(text.contains(
        "skopeo_source_operations_total{operation=\"copy\",source_type=\"docker\"} 1"
    ));
    assert!(text.contains(
        "skopeo_destination_operations_total{destination_type=\"dir\",operation=\"copy\"} 1"
    ));
}

#[tokio::test]
async fn test_retry_warning_does_not_fail_copy() {
    let dir = TempDir::new().unwrap();
    let script = format!(
        "cat >&2 <<'EOF'\n\
         Getting image source signatures\n\
         time=\"2024-01-01T00:00:00Z\" level=warning msg=\"Failed, retrying in 1s ... (1/3). Error: copying blob: connection reset by peer\"\n\
         Copying blob {layer} done\n\
         Copying config {config}\n\
         Writing manifest to image destination\n\
         EOF\n\
         exit 0",
        layer = LAYER,
        config = CONFIG
    );
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, &script));

    let output = skopeo
        .copy("docker://alpine:latest", "dir:/tmp/alpine", None, None)
        .await;

    assert!(output.success, "stderr: {}", output.stderr);
    assert_eq!(output.error_kind, None);
    assert!(output.stderr.contains("level=warning"));
    assert_eq!(output.progress.current_step, Step::Done);
    assert!(output.progress.error.is_none());
    assert_eq!(output.progress.blobs.len(), 2);
    assert!(output.progress.manifest_written);

    assert_eq!(
        metrics.operations_total(Operation::Copy, OperationStatus::Success),
        1
    );
    assert_eq!(
        metrics.operations_total(Operation::Copy, OperationStatus::Error),
        0
    );
    assert_eq!(
        metrics.blobs_processed_total(Operation::Copy, OperationStatus::Success),
        2
    );
}

#[tokio::test]
async fn test_two_copies_accumulate_counters() {
    let dir = TempDir::new().unwrap();
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, &copy_script()));

    for _ in 0..2 {
        let output = skopeo
            .copy("docker://alpine:latest", "dir:/tmp/alpine", None, None)
            .await;
        assert!(output.success);
    }

    assert_eq!(
        metrics.operations_total(Operation::Copy, OperationStatus::Success),
        2
    );
    assert_eq!(
        metrics.blobs_processed_total(Operation::Copy, OperationStatus::Success),
        4
    );
    assert_eq!(metrics.duration_samples(Operation::Copy), 2);
    assert_eq!(metrics.active_operations(Operation::Copy), 0);
}

#[tokio::test]
async fn test_inspect_returns_stdout() {
    let dir = TempDir::new().unwrap();
    let script = "echo '{\"Name\": \"docker.io/library/alpine\", \"Layers\": []}'";
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, script));

    let output = skopeo.inspect("docker://alpine:latest", None, None).await;

    assert!(output.success);
    let json: serde_json::Value = serde_json::from_str(&output.stdout).unwrap();
    assert_eq!(json["Name"], "docker.io/library/alpine");
    assert_eq!(
        metrics.operations_total(Operation::Inspect, OperationStatus::Success),
        1
    );
}

#[tokio::test]
async fn test_tool_error_line_fails_operation() {
    let dir = TempDir::new().unwrap();
    let script = "echo 'Error: unauthorized: authentication required' >&2\nexit 1";
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, script));

    let mut last = None;
    let mut record = |info: &ProgressInfo| last = Some(info.clone());
    let output = skopeo
        .inspect("docker://private/app:1", None, Some(&mut record))
        .await;

    assert!(!output.success);
    assert_eq!(output.exit_code, Some(1));
    assert_eq!(output.error_kind, Some(ErrorKind::Unauthorized));
    assert!(output.stderr.contains("authentication required"));

    let last = last.unwrap();
    assert_eq!(last.current_step, Step::Error);
    assert_eq!(
        last.error.as_deref(),
        Some("Error: unauthorized: authentication required")
    );

    assert_eq!(metrics.active_operations(Operation::Inspect), 0);
    assert_eq!(
        metrics.errors_total(Operation::Inspect, ErrorKind::Unauthorized),
        1
    );
    assert_eq!(
        metrics.operations_total(Operation::Inspect, OperationStatus::Error),
        1
    );
}

#[tokio::test]
async fn test_nonzero_exit_without_error_line() {
    let dir = TempDir::new().unwrap();
    let script = "echo 'Getting image source signatures' >&2\nexit 3";
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, script));

    let output = skopeo.delete("docker://registry/app:old", None, None).await;

    assert!(!output.success);
    assert_eq!(output.exit_code, Some(3));
    assert_eq!(output.error_kind, Some(ErrorKind::ProcessExit));
    assert_eq!(
        output.progress.error.as_deref(),
        Some("process exited with code 3")
    );
    assert_eq!(
        metrics.errors_total(Operation::Delete, ErrorKind::ProcessExit),
        1
    );
}

#[tokio::test]
async fn test_timeout_kills_and_releases() {
    let dir = TempDir::new().unwrap();
    let script = "echo 'Getting image source signatures' >&2\nexec sleep 10";
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, script));

    let started = Instant::now();
    let output = skopeo
        .copy(
            "docker://alpine:latest",
            "dir:/tmp/alpine",
            Some(Duration::from_millis(300)),
            None,
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!output.success);
    assert_eq!(output.error_kind, Some(ErrorKind::Timeout));
    assert!(output.stderr.contains("operation timed out"));
    assert_eq!(output.progress.current_step, Step::Error);

    assert_eq!(metrics.active_operations(Operation::Copy), 0);
    assert_eq!(metrics.errors_total(Operation::Copy, ErrorKind::Timeout), 1);
}

#[tokio::test]
async fn test_config_default_timeout_applies() {
    let dir = TempDir::new().unwrap();
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, "exec sleep 10"));
    let config = skopeo
        .config()
        .clone()
        .with_default_timeout(Some(Duration::from_millis(200)));
    let skopeo = SkopeoWrapper::new(config, Some(Arc::clone(&metrics)));

    let output = skopeo.manifest_digest("docker://alpine:latest", None, None).await;

    assert_eq!(output.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(
        metrics.errors_total(Operation::ManifestDigest, ErrorKind::Timeout),
        1
    );
}

#[tokio::test]
async fn test_missing_binary_is_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let (skopeo, metrics) = wrapper(dir.path().join("does-not-exist"));

    let output = skopeo.inspect("docker://alpine:latest", None, None).await;

    assert!(!output.success);
    assert_eq!(output.exit_code, None);
    assert_eq!(output.error_kind, Some(ErrorKind::SpawnFailed));
    assert!(output.stderr.contains("failed to start"));
    assert_eq!(metrics.active_operations(Operation::Inspect), 0);
    assert_eq!(
        metrics.errors_total(Operation::Inspect, ErrorKind::SpawnFailed),
        1
    );
}

#[tokio::test]
async fn test_image_exists_classification() {
    let dir = TempDir::new().unwrap();

    let (skopeo, _) = wrapper(fake_skopeo(&dir, "echo '{}'"));
    assert_eq!(
        skopeo.image_exists("docker://alpine:latest", None, None).await,
        ImageExistence::Exists
    );

    let (skopeo, metrics) = wrapper(fake_skopeo(
        &dir,
        "echo 'Error: manifest unknown: manifest unknown' >&2\nexit 1",
    ));
    assert_eq!(
        skopeo.image_exists("docker://alpine:nope", None, None).await,
        ImageExistence::Missing
    );
    // A definitive "no" is a successful probe.
    assert_eq!(
        metrics.operations_total(Operation::ImageExists, OperationStatus::Success),
        1
    );

    let (skopeo, metrics) = wrapper(fake_skopeo(
        &dir,
        "echo 'Error: unauthorized: authentication required' >&2\nexit 1",
    ));
    let existence = skopeo.image_exists("docker://private/app", None, None).await;
    assert!(matches!(existence, ImageExistence::Unauthorized(_)));
    assert_eq!(
        metrics.errors_total(Operation::ImageExists, ErrorKind::Unauthorized),
        1
    );

    let (skopeo, _) = wrapper(fake_skopeo(&dir, "exit 1"));
    assert_eq!(
        skopeo.image_exists("docker://alpine:gone", None, None).await,
        ImageExistence::Missing
    );
}

#[tokio::test]
async fn test_heartbeat_removed_after_slow_copy() {
    let dir = TempDir::new().unwrap();
    let script = format!(
        "echo 'Getting image source signatures' >&2\n\
         sleep 0.3\n\
         echo 'Copying blob {}' >&2\n\
         sleep 0.3\n\
         echo 'Writing manifest to image destination' >&2",
        LAYER
    );
    let (skopeo, metrics) = wrapper(fake_skopeo(&dir, &script));

    let output = skopeo
        .copy("docker://alpine:latest", "dir:/tmp/alpine", None, None)
        .await;
    assert!(output.success);

    // Heartbeat series only exist while an operation is in flight.
    let samples = metrics.snapshot().unwrap();
    assert!(
        !samples
            .keys()
            .any(|key| key.starts_with("skopeo_operation_stale_seconds{")),
        "heartbeat series left behind"
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    let samples = metrics.snapshot().unwrap();
    assert!(!samples
        .keys()
        .any(|key| key.starts_with("skopeo_active_operation_duration_seconds{")));
}

#[tokio::test]
async fn test_disabled_metrics_record_nothing() {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let config = WrapperConfig::default()
        .with_skopeo_path(fake_skopeo(&dir, &copy_script()))
        .with_metrics_enabled(false);
    let skopeo = SkopeoWrapper::new(config, Some(Arc::clone(&metrics)));

    let output = skopeo
        .copy("docker://alpine:latest", "dir:/tmp/alpine", None, None)
        .await;

    assert!(output.success);
    assert_eq!(output.progress.blobs.len(), 2);
    assert_eq!(
        metrics.operations_total(Operation::Copy, OperationStatus::Success),
        0
    );
    assert_eq!(
        metrics.blobs_processed_total(Operation::Copy, OperationStatus::Success),
        0
    );
}
