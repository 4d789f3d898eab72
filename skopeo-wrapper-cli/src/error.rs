//! CLI error type and exit codes.

use std::fmt;

use skopeo_wrapper::config::ConfigError;
use skopeo_wrapper::logging::LoggingError;
use skopeo_wrapper::metrics::MetricsError;
#[cfg(feature = "metrics-server")]
use skopeo_wrapper::server::ServerError;

/// Exit code for a failed command.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code when the user interrupts with Ctrl-C.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Errors surfaced to the user by the CLI.
#[derive(Debug)]
pub enum CliError {
    /// Configuration file could not be loaded
    Config(ConfigError),
    /// Logging could not be initialized
    Logging(LoggingError),
    /// Metrics registry could not be built or rendered
    Metrics(MetricsError),
    /// Metrics server failed
    #[cfg(feature = "metrics-server")]
    Server(ServerError),
    /// skopeo ran but the operation failed
    OperationFailed {
        operation: &'static str,
        message: String,
    },
    /// Invalid combination of arguments
    InvalidArgument(String),
    /// Ctrl-C
    Interrupted,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "Configuration error: {}", e),
            CliError::Logging(e) => write!(f, "Logging error: {}", e),
            CliError::Metrics(e) => write!(f, "Metrics error: {}", e),
            #[cfg(feature = "metrics-server")]
            CliError::Server(e) => write!(f, "{}", e),
            CliError::OperationFailed { operation, message } => {
                write!(f, "{} failed: {}", operation, message)
            }
            CliError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            CliError::Interrupted => write!(f, "Operation interrupted by user"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Metrics(e) => Some(e),
            #[cfg(feature = "metrics-server")]
            CliError::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<MetricsError> for CliError {
    fn from(e: MetricsError) -> Self {
        CliError::Metrics(e)
    }
}

#[cfg(feature = "metrics-server")]
impl From<ServerError> for CliError {
    fn from(e: ServerError) -> Self {
        CliError::Server(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Interrupted.exit_code(), 130);
        assert_eq!(
            CliError::OperationFailed {
                operation: "copy",
                message: "boom".to_string()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_display() {
        let err = CliError::OperationFailed {
            operation: "inspect",
            message: "Error: manifest unknown".to_string(),
        };
        assert_eq!(err.to_string(), "inspect failed: Error: manifest unknown");
        assert_eq!(
            CliError::Interrupted.to_string(),
            "Operation interrupted by user"
        );
    }
}
