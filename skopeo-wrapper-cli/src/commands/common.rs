//! Common types and utilities shared across CLI commands.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use skopeo_wrapper::metrics::MetricsRegistry;
use skopeo_wrapper::progress::{Operation, ProgressInfo};
use skopeo_wrapper::skopeo::{CommandOutput, SkopeoWrapper};
use skopeo_wrapper::WrapperConfig;

use crate::error::CliError;

/// Options shared by every skopeo-backed subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct RunOpts {
    /// Show a progress bar
    #[arg(long)]
    pub progress: bool,

    /// Print every progress update as a JSON line on stderr
    #[arg(long, conflicts_with = "progress")]
    pub progress_json: bool,

    /// Timeout in seconds (overrides the configured default)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl RunOpts {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Everything a command needs to run.
pub struct Context {
    pub skopeo: SkopeoWrapper,
    pub metrics: Option<Arc<MetricsRegistry>>,
    /// Dump the metrics exposition to stdout after the command.
    pub print_metrics: bool,
}

impl Context {
    /// Build the wrapper, with a registry only when metrics are enabled.
    pub fn new(config: WrapperConfig, print_metrics: bool) -> Result<Self, CliError> {
        let metrics = if config.metrics_enabled {
            Some(Arc::new(MetricsRegistry::new()?))
        } else {
            None
        };
        let skopeo = SkopeoWrapper::new(config, metrics.clone());

        Ok(Self {
            skopeo,
            metrics,
            print_metrics,
        })
    }

    /// Print the metrics exposition if requested.
    pub fn report_metrics(&self) -> Result<(), CliError> {
        if !self.print_metrics {
            return Ok(());
        }
        match &self.metrics {
            Some(metrics) => print!("{}", metrics.encode_text()?),
            None => eprintln!("Metrics are disabled; nothing to print"),
        }
        Ok(())
    }
}

/// Run `fut` unless Ctrl-C arrives first.
///
/// Dropping the operation future kills skopeo and releases its tracker.
pub async fn interruptible<F: Future>(fut: F) -> Result<F::Output, CliError> {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal support; never interrupt.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        output = fut => Ok(output),
        _ = ctrl_c => Err(CliError::Interrupted),
    }
}

/// Progress bar driven by parser updates.
pub struct ProgressDisplay {
    bar: ProgressBar,
}

impl ProgressDisplay {
    pub fn new(operation: Operation) -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!("{} starting", operation));
        Self { bar }
    }

    pub fn update(&self, info: &ProgressInfo) {
        self.bar.set_position(info.percent().round() as u64);
        self.bar.set_message(info.summary());
    }

    pub fn finish(&self, output: &CommandOutput) {
        if output.success {
            self.bar.finish_with_message(output.progress.summary());
        } else {
            self.bar.abandon_with_message(output.progress.summary());
        }
    }
}

/// Where progress updates go.
pub enum ProgressSink {
    None,
    Bar(ProgressDisplay),
    JsonLines,
}

impl ProgressSink {
    pub fn for_opts(opts: &RunOpts, operation: Operation) -> Self {
        if opts.progress {
            ProgressSink::Bar(ProgressDisplay::new(operation))
        } else if opts.progress_json {
            ProgressSink::JsonLines
        } else {
            ProgressSink::None
        }
    }

    pub fn update(&self, info: &ProgressInfo) {
        match self {
            ProgressSink::None => {}
            ProgressSink::Bar(display) => display.update(info),
            ProgressSink::JsonLines => match serde_json::to_string(info) {
                Ok(line) => eprintln!("{}", line),
                Err(e) => tracing::warn!(error = %e, "failed to serialize progress"),
            },
        }
    }

    pub fn finish(&self, output: &CommandOutput) {
        if let ProgressSink::Bar(display) = self {
            display.finish(output);
        }
    }
}

/// Turn a failed output into the error reported to the user.
pub fn operation_failed(operation: Operation, output: &CommandOutput) -> CliError {
    let message = match output.stderr.trim() {
        "" => output
            .progress
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
        stderr => stderr.to_string(),
    };
    CliError::OperationFailed {
        operation: operation.as_str(),
        message,
    }
}

/// Print a green success line.
pub fn print_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}
