//! Async runner for the skopeo binary.
//!
//! Every call spawns one skopeo process, feeds its stderr through a
//! [`ProgressParser`] line by line, and wraps the whole run in an
//! [`OperationTracker`]. Callers get a [`CommandOutput`] back whatever
//! happened: spawn failures, timeouts and non-zero exits are reported in it
//! rather than as `Err`, matching how skopeo itself reports failures as text.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skopeo_wrapper::config::WrapperConfig;
//! use skopeo_wrapper::metrics::MetricsRegistry;
//! use skopeo_wrapper::skopeo::SkopeoWrapper;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Arc::new(MetricsRegistry::new()?);
//! let skopeo = SkopeoWrapper::new(WrapperConfig::default(), Some(metrics));
//!
//! let mut print = |info: &skopeo_wrapper::progress::ProgressInfo| println!("{}", info.summary());
//! let output = skopeo
//!     .copy("docker://alpine:latest", "dir:/tmp/alpine", None, Some(&mut print))
//!     .await;
//! assert!(output.success);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::config::WrapperConfig;
use crate::metrics::{ErrorKind, MetricsRegistry};
use crate::progress::{Operation, ProgressInfo, ProgressParser};
use crate::tracker::{OperationLabels, OperationTracker, Outcome};

/// Callback invoked with every recognized progress update, then once more
/// with the terminal snapshot.
pub type ProgressCallback<'a> = dyn FnMut(&ProgressInfo) + Send + 'a;

/// Failures of the process itself, as opposed to errors skopeo reports.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while reading skopeo output: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl RunError {
    /// Metrics label for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Spawn { .. } => ErrorKind::SpawnFailed,
            RunError::Io(_) => ErrorKind::ToolError,
            RunError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Result of one skopeo invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    /// Process exit code; `None` if it never ran, timed out, or was signalled.
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Raw stderr, plus a trailing line for runner-level failures.
    pub stderr: String,
    /// Failure category; `None` on success.
    pub error_kind: Option<ErrorKind>,
    /// Terminal progress snapshot.
    pub progress: ProgressInfo,
}

impl CommandOutput {
    /// How the tracker should record this run.
    pub fn outcome(&self) -> Outcome {
        match self.error_kind {
            None if self.success => Outcome::Success,
            kind => Outcome::Failure(kind.unwrap_or(ErrorKind::ToolError)),
        }
    }
}

/// Answer of [`SkopeoWrapper::image_exists`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageExistence {
    Exists,
    Missing,
    /// Registry rejected the credentials; carries skopeo's stderr.
    Unauthorized(String),
    /// Registry refused access; carries skopeo's stderr.
    Forbidden(String),
    /// Any other failure; carries skopeo's stderr.
    Failed(String),
}

impl ImageExistence {
    /// Classify the output of an `inspect` probe.
    pub fn from_output(output: &CommandOutput) -> Self {
        if output.success {
            return ImageExistence::Exists;
        }

        let stderr = output.stderr.trim();
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("manifest unknown")
            || lower.contains("error reading manifest")
            || lower.contains("repository not found")
        {
            ImageExistence::Missing
        } else if lower.contains("unauthorized") {
            ImageExistence::Unauthorized(stderr.to_string())
        } else if lower.contains("forbidden") {
            ImageExistence::Forbidden(stderr.to_string())
        } else if stderr.is_empty() {
            ImageExistence::Missing
        } else {
            ImageExistence::Failed(stderr.to_string())
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, ImageExistence::Exists)
    }

    /// Whether the probe gave a yes/no answer.
    pub fn is_definitive(&self) -> bool {
        matches!(self, ImageExistence::Exists | ImageExistence::Missing)
    }
}

/// Runs skopeo subcommands with progress parsing and metrics.
#[derive(Debug, Clone)]
pub struct SkopeoWrapper {
    config: WrapperConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl SkopeoWrapper {
    pub fn new(config: WrapperConfig, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// `skopeo copy <source> <destination>`
    pub async fn copy(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
        callback: Option<&mut ProgressCallback<'_>>,
    ) -> CommandOutput {
        let labels = OperationLabels::new(Some(source), Some(destination));
        let (output, tracker) = self
            .run(Operation::Copy, &[source, destination], labels, timeout, callback)
            .await;
        tracker.finish(output.outcome());
        output
    }

    /// `skopeo inspect <image>`
    pub async fn inspect(
        &self,
        image: &str,
        timeout: Option<Duration>,
        callback: Option<&mut ProgressCallback<'_>>,
    ) -> CommandOutput {
        self.run_single(Operation::Inspect, image, timeout, callback).await
    }

    /// `skopeo delete <image>`
    pub async fn delete(
        &self,
        image: &str,
        timeout: Option<Duration>,
        callback: Option<&mut ProgressCallback<'_>>,
    ) -> CommandOutput {
        self.run_single(Operation::Delete, image, timeout, callback).await
    }

    /// `skopeo manifest-digest <image>`
    pub async fn manifest_digest(
        &self,
        image: &str,
        timeout: Option<Duration>,
        callback: Option<&mut ProgressCallback<'_>>,
    ) -> CommandOutput {
        self.run_single(Operation::ManifestDigest, image, timeout, callback).await
    }

    /// Probe an image with `skopeo inspect`.
    ///
    /// A definitive "missing" answer is a successful probe as far as metrics
    /// are concerned.
    pub async fn image_exists(
        &self,
        image: &str,
        timeout: Option<Duration>,
        callback: Option<&mut ProgressCallback<'_>>,
    ) -> ImageExistence {
        let labels = OperationLabels::new(Some(image), None);
        let (output, tracker) = self
            .run(Operation::ImageExists, &[image], labels, timeout, callback)
            .await;

        let existence = ImageExistence::from_output(&output);
        let outcome = if existence.is_definitive() {
            Outcome::Success
        } else {
            output.outcome()
        };
        tracker.finish(outcome);

        debug!(image, ?existence, "image existence probed");
        existence
    }

    async fn run_single(
        &self,
        operation: Operation,
        image: &str,
        timeout: Option<Duration>,
        callback: Option<&mut ProgressCallback<'_>>,
    ) -> CommandOutput {
        let labels = OperationLabels::new(Some(image), None);
        let (output, tracker) = self.run(operation, &[image], labels, timeout, callback).await;
        tracker.finish(output.outcome());
        output
    }

    /// Run one subcommand. The returned tracker is still held; the caller
    /// decides the outcome and releases it.
    async fn run(
        &self,
        operation: Operation,
        args: &[&str],
        labels: OperationLabels,
        timeout: Option<Duration>,
        mut callback: Option<&mut ProgressCallback<'_>>,
    ) -> (CommandOutput, OperationTracker) {
        let tracker = OperationTracker::acquire(
            self.metrics.as_ref(),
            &self.config.tracker_config(),
            operation,
            labels,
        );
        let mut parser = ProgressParser::new(operation);
        let limit = timeout.or(self.config.default_timeout);
        let started = Instant::now();

        info!(
            operation = %operation,
            args = ?args,
            timeout_secs = ?limit.map(|t| t.as_secs()),
            "starting skopeo"
        );

        let mut stdout = Vec::new();
        let mut stderr_lines = Vec::new();
        let result = self
            .execute(
                operation,
                args,
                limit,
                &mut parser,
                &tracker,
                callback.as_deref_mut(),
                &mut stdout,
                &mut stderr_lines,
            )
            .await;

        let (exit_code, error_kind) = match result {
            Ok(status) if status.success() => {
                parser.finish();
                (status.code(), parser.progress().error.as_deref().map(ErrorKind::classify))
            }
            Ok(status) => {
                let kind = match parser.progress().error.as_deref() {
                    Some(error) => ErrorKind::classify(error),
                    None => {
                        let message = match status.code() {
                            Some(code) => format!("process exited with code {}", code),
                            None => "process terminated by signal".to_string(),
                        };
                        parser.fail(message);
                        ErrorKind::ProcessExit
                    }
                };
                (status.code(), Some(kind))
            }
            Err(e) => {
                let message = e.to_string();
                stderr_lines.push(message.clone());
                parser.fail(message);
                (None, Some(e.kind()))
            }
        };

        // Blobs finished by `finish()` above.
        for blob in parser.take_finished_blobs() {
            tracker.add_blob(blob.size);
        }
        if let Some(callback) = callback.as_deref_mut() {
            callback(parser.progress());
        }

        let output = CommandOutput {
            success: error_kind.is_none(),
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: stderr_lines.join("\n"),
            error_kind,
            progress: parser.into_progress(),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match output.error_kind {
            None => info!(
                operation = %operation,
                blobs = output.progress.blobs.len(),
                elapsed_ms,
                "skopeo finished"
            ),
            Some(kind) => warn!(
                operation = %operation,
                error_kind = %kind,
                exit_code = ?output.exit_code,
                elapsed_ms,
                "skopeo failed"
            ),
        }

        (output, tracker)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        operation: Operation,
        args: &[&str],
        limit: Option<Duration>,
        parser: &mut ProgressParser,
        tracker: &OperationTracker,
        callback: Option<&mut ProgressCallback<'_>>,
        stdout_buf: &mut Vec<u8>,
        stderr_lines: &mut Vec<String>,
    ) -> Result<ExitStatus, RunError> {
        let program = &self.config.skopeo_path;
        let mut child = Command::new(program)
            .arg(operation.subcommand())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let streams = {
            let child = &mut child;
            async move {
                tokio::try_join!(
                    read_all(stdout, stdout_buf),
                    pump_stderr(stderr, parser, tracker, callback, stderr_lines),
                )?;
                child.wait().await
            }
        };

        let waited = match limit {
            Some(limit) => tokio::time::timeout(limit, streams)
                .await
                .map_err(|_| limit),
            None => Ok(streams.await),
        };

        match waited {
            Ok(status) => Ok(status?),
            Err(limit) => {
                warn!(operation = %operation, timeout_secs = limit.as_secs(), "skopeo timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill skopeo");
                }
                Err(RunError::Timeout(limit))
            }
        }
    }
}

async fn read_all<R>(reader: Option<R>, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if let Some(mut reader) = reader {
        reader.read_to_end(buf).await?;
    }
    Ok(())
}

/// Feed stderr into the parser, in line order, until end-of-stream.
async fn pump_stderr(
    stderr: Option<ChildStderr>,
    parser: &mut ProgressParser,
    tracker: &OperationTracker,
    mut callback: Option<&mut ProgressCallback<'_>>,
    lines_out: &mut Vec<String>,
) -> io::Result<()> {
    let Some(stderr) = stderr else {
        return Ok(());
    };

    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(info) = parser.parse_line(&line) {
            tracker.record_progress(info);
            if let Some(callback) = callback.as_deref_mut() {
                callback(info);
            }
        }
        for blob in parser.take_finished_blobs() {
            tracker.add_blob(blob.size);
        }
        lines_out.push(line);
    }
    Ok(())
}
