//! skopeo-wrapper CLI - Command-line interface
//!
//! This binary runs skopeo through the skopeo-wrapper library, adding progress
//! display and Prometheus metrics.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;
use skopeo_wrapper::logging::{init_logging, LoggingGuard};
use skopeo_wrapper::WrapperConfig;

use commands::common::Context;
use commands::image::ImageCommand;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "skopeo-wrapper")]
#[command(version, about = "skopeo with progress reporting and Prometheus metrics")]
#[command(after_help = "Examples:\n  \
    skopeo-wrapper copy docker://alpine:latest dir:/tmp/alpine --progress\n  \
    skopeo-wrapper inspect docker://ubuntu:22.04 --json\n  \
    skopeo-wrapper exists docker://nginx:latest")]
struct Cli {
    /// Configuration file (default: <config dir>/skopeo-wrapper/config.ini)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the skopeo executable
    #[arg(long, global = true, value_name = "PATH")]
    skopeo_path: Option<PathBuf>,

    /// Disable metrics collection
    #[arg(long, global = true)]
    disable_metrics: bool,

    /// Heartbeat sampling period in seconds
    #[arg(long, global = true, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_interval: Option<u64>,

    /// Default timeout in seconds for every operation
    #[arg(long = "default-timeout", global = true, value_name = "SECS")]
    default_timeout: Option<u64>,

    /// Log level directive (overridden by RUST_LOG)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Print the metrics exposition after the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    /// Serve /metrics on this address while the command runs
    #[cfg(feature = "metrics-server")]
    #[arg(long, global = true, value_name = "ADDR")]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(flatten)]
    Image(ImageCommand),

    /// Serve /metrics and /health until interrupted
    #[cfg(feature = "metrics-server")]
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: std::net::SocketAddr,
    },
}

impl Cli {
    /// File settings with command-line overrides applied.
    fn resolve_config(&self) -> Result<WrapperConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => WrapperConfig::load(path)?,
            None => WrapperConfig::load_default()?,
        };

        if let Some(path) = &self.skopeo_path {
            config = config.with_skopeo_path(path.clone());
        }
        if self.disable_metrics {
            config = config.with_metrics_enabled(false);
        }
        if let Some(secs) = self.heartbeat_interval {
            config = config.with_heartbeat_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.default_timeout {
            config = config.with_default_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(level) = &self.log_level {
            config = config.with_log_level(level.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("✗").red().bold(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.resolve_config()?;
    let _logging: LoggingGuard = init_logging(&config.log_level, cli.log_file.as_deref())?;

    let ctx = Context::new(config, cli.print_metrics)?;

    match cli.command {
        Commands::Image(command) => {
            #[cfg(feature = "metrics-server")]
            let background = match (cli.metrics_addr, ctx.metrics.clone()) {
                (Some(addr), Some(metrics)) => {
                    Some(commands::serve::BackgroundServer::start(metrics, addr))
                }
                _ => None,
            };

            let result = commands::image::run(&ctx, command).await;

            #[cfg(feature = "metrics-server")]
            if let Some(server) = background {
                server.stop().await;
            }

            result?;
        }

        #[cfg(feature = "metrics-server")]
        Commands::Serve { addr } => {
            commands::serve::run(ctx.metrics.clone(), addr).await?;
        }
    }

    ctx.report_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_copy_with_globals() {
        let cli = Cli::try_parse_from([
            "skopeo-wrapper",
            "--skopeo-path",
            "/opt/skopeo",
            "--disable-metrics",
            "copy",
            "docker://alpine:latest",
            "dir:/tmp/alpine",
            "--progress",
            "--timeout",
            "60",
        ])
        .unwrap();

        assert_eq!(cli.skopeo_path, Some(PathBuf::from("/opt/skopeo")));
        assert!(cli.disable_metrics);
        match cli.command {
            Commands::Image(ImageCommand::Copy {
                source,
                destination,
                opts,
            }) => {
                assert_eq!(source, "docker://alpine:latest");
                assert_eq!(destination, "dir:/tmp/alpine");
                assert!(opts.progress);
                assert_eq!(opts.timeout, Some(60));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_inspect_json() {
        let cli =
            Cli::try_parse_from(["skopeo-wrapper", "inspect", "docker://ubuntu:22.04", "--json"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Image(ImageCommand::Inspect { json: true, .. })
        ));
    }

    #[test]
    fn test_parse_manifest_digest_name() {
        let cli =
            Cli::try_parse_from(["skopeo-wrapper", "manifest-digest", "docker://alpine"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Image(ImageCommand::ManifestDigest { .. })
        ));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let result = Cli::try_parse_from([
            "skopeo-wrapper",
            "--heartbeat-interval",
            "0",
            "exists",
            "docker://alpine",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("config.ini");
        std::fs::write(&file, "[skopeo]\npath = /from/file\n[logging]\nlevel = debug\n").unwrap();

        let cli = Cli::try_parse_from([
            "skopeo-wrapper",
            "--config",
            file.to_str().unwrap(),
            "--heartbeat-interval",
            "2",
            "--default-timeout",
            "45",
            "delete",
            "docker://registry/app:old",
        ])
        .unwrap();

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.skopeo_path, PathBuf::from("/from/file"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.default_timeout, Some(Duration::from_secs(45)));
        assert!(config.metrics_enabled);
    }
}
