//! Image subcommands backed by skopeo.

use clap::Subcommand;
use skopeo_wrapper::progress::{Operation, ProgressInfo};
use skopeo_wrapper::skopeo::{CommandOutput, ImageExistence};

use super::common::{
    interruptible, operation_failed, print_success, Context, ProgressSink, RunOpts,
};
use crate::error::CliError;

/// Image operations.
#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// Copy an image between locations
    Copy {
        /// Source image reference (e.g. docker://alpine:latest)
        source: String,
        /// Destination reference (e.g. dir:/tmp/alpine)
        destination: String,
        #[command(flatten)]
        opts: RunOpts,
    },

    /// Show image metadata
    Inspect {
        /// Image reference
        image: String,
        /// Pretty-print the JSON output
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        opts: RunOpts,
    },

    /// Delete an image
    Delete {
        /// Image reference
        image: String,
        #[command(flatten)]
        opts: RunOpts,
    },

    /// Print the manifest digest of an image
    ManifestDigest {
        /// Image reference
        image: String,
        #[command(flatten)]
        opts: RunOpts,
    },

    /// Check whether an image exists (prints "true" or "false")
    Exists {
        /// Image reference
        image: String,
        #[command(flatten)]
        opts: RunOpts,
    },
}

/// Run an image subcommand.
pub async fn run(ctx: &Context, command: ImageCommand) -> Result<(), CliError> {
    match command {
        ImageCommand::Copy {
            source,
            destination,
            opts,
        } => {
            let sink = ProgressSink::for_opts(&opts, Operation::Copy);
            let mut update = |info: &ProgressInfo| sink.update(info);
            let output = interruptible(ctx.skopeo.copy(
                &source,
                &destination,
                opts.timeout(),
                Some(&mut update),
            ))
            .await?;
            sink.finish(&output);

            ensure_success(Operation::Copy, &output)?;
            print_success(&format!("Copied {} to {}", source, destination));
        }

        ImageCommand::Inspect { image, json, opts } => {
            let sink = ProgressSink::for_opts(&opts, Operation::Inspect);
            let mut update = |info: &ProgressInfo| sink.update(info);
            let output =
                interruptible(ctx.skopeo.inspect(&image, opts.timeout(), Some(&mut update)))
                    .await?;
            sink.finish(&output);

            ensure_success(Operation::Inspect, &output)?;
            if json {
                println!("{}", pretty_json(&output.stdout));
            } else {
                print!("{}", output.stdout);
            }
        }

        ImageCommand::Delete { image, opts } => {
            let sink = ProgressSink::for_opts(&opts, Operation::Delete);
            let mut update = |info: &ProgressInfo| sink.update(info);
            let output =
                interruptible(ctx.skopeo.delete(&image, opts.timeout(), Some(&mut update)))
                    .await?;
            sink.finish(&output);

            ensure_success(Operation::Delete, &output)?;
            print_success(&format!("Deleted {}", image));
        }

        ImageCommand::ManifestDigest { image, opts } => {
            let sink = ProgressSink::for_opts(&opts, Operation::ManifestDigest);
            let mut update = |info: &ProgressInfo| sink.update(info);
            let output = interruptible(ctx.skopeo.manifest_digest(
                &image,
                opts.timeout(),
                Some(&mut update),
            ))
            .await?;
            sink.finish(&output);

            ensure_success(Operation::ManifestDigest, &output)?;
            println!("{}", output.stdout.trim());
        }

        ImageCommand::Exists { image, opts } => {
            let existence =
                interruptible(ctx.skopeo.image_exists(&image, opts.timeout(), None)).await?;
            match existence {
                ImageExistence::Exists => println!("true"),
                ImageExistence::Missing => println!("false"),
                ImageExistence::Unauthorized(text) => {
                    return Err(CliError::OperationFailed {
                        operation: Operation::ImageExists.as_str(),
                        message: format!("unauthorized access: {}", text),
                    })
                }
                ImageExistence::Forbidden(text) => {
                    return Err(CliError::OperationFailed {
                        operation: Operation::ImageExists.as_str(),
                        message: format!("access forbidden: {}", text),
                    })
                }
                ImageExistence::Failed(text) => {
                    return Err(CliError::OperationFailed {
                        operation: Operation::ImageExists.as_str(),
                        message: text,
                    })
                }
            }
        }
    }

    Ok(())
}

fn ensure_success(operation: Operation, output: &CommandOutput) -> Result<(), CliError> {
    if output.success {
        Ok(())
    } else {
        Err(operation_failed(operation, output))
    }
}

/// Re-indent JSON, or return the text unchanged if it is not JSON.
fn pretty_json(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| text.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty_json_reindents() {
        let pretty = pretty_json("{\"Name\":\"alpine\",\"Layers\":[]}");
        assert!(pretty.contains("\n  \"Name\": \"alpine\""));
    }

    #[test]
    fn test_pretty_json_passes_through_text() {
        assert_eq!(pretty_json("not json\n"), "not json");
    }
}
