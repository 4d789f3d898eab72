//! Label values used by the metrics registry.

use serde::Serialize;
use std::fmt;

/// Terminal status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Error,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category of an operation.
///
/// Lets operators tell a known failure apart from unparsed tool output while
/// the raw diagnostics are still returned verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Registry rejected the credentials.
    Unauthorized,
    /// Registry refused access.
    Forbidden,
    /// Tag or digest does not exist.
    ManifestUnknown,
    /// Repository does not exist.
    NotFound,
    /// Any other error line reported by skopeo.
    ToolError,
    /// skopeo exited non-zero without a recognizable error line.
    ProcessExit,
    /// The configured timeout elapsed.
    Timeout,
    /// skopeo could not be started.
    SpawnFailed,
    /// The tracker was dropped without an explicit release.
    Aborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::ManifestUnknown => "manifest_unknown",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::ProcessExit => "process_exit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::Aborted => "aborted",
        }
    }

    /// Classify an error line reported by skopeo.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopeo_wrapper::metrics::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::classify("Error: manifest unknown"), ErrorKind::ManifestUnknown);
    /// assert_eq!(ErrorKind::classify("Error: something odd"), ErrorKind::ToolError);
    /// ```
    pub fn classify(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("unauthorized") || lower.contains("authentication required") {
            ErrorKind::Unauthorized
        } else if lower.contains("forbidden") || lower.contains("denied") {
            ErrorKind::Forbidden
        } else if lower.contains("manifest unknown") || lower.contains("error reading manifest") {
            ErrorKind::ManifestUnknown
        } else if lower.contains("repository not found") || lower.contains("name unknown") {
            ErrorKind::NotFound
        } else {
            ErrorKind::ToolError
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image transport named by the prefix of an image reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Docker,
    Dir,
    Oci,
    ContainersStorage,
    DockerArchive,
    OciArchive,
    DockerDaemon,
    Unknown,
}

impl TransportKind {
    /// Extract the transport from a reference such as `docker://alpine:latest`
    /// or `dir:/tmp/alpine`.
    pub fn from_reference(reference: &str) -> Self {
        let Some((scheme, _)) = reference.split_once(':') else {
            return TransportKind::Unknown;
        };
        match scheme {
            "docker" => TransportKind::Docker,
            "dir" => TransportKind::Dir,
            "oci" => TransportKind::Oci,
            "containers-storage" => TransportKind::ContainersStorage,
            "docker-archive" => TransportKind::DockerArchive,
            "oci-archive" => TransportKind::OciArchive,
            "docker-daemon" => TransportKind::DockerDaemon,
            _ => TransportKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Docker => "docker",
            TransportKind::Dir => "dir",
            TransportKind::Oci => "oci",
            TransportKind::ContainersStorage => "containers_storage",
            TransportKind::DockerArchive => "docker_archive",
            TransportKind::OciArchive => "oci_archive",
            TransportKind::DockerDaemon => "docker_daemon",
            TransportKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_reference() {
        assert_eq!(TransportKind::from_reference("docker://alpine:latest"), TransportKind::Docker);
        assert_eq!(TransportKind::from_reference("dir:/tmp/alpine"), TransportKind::Dir);
        assert_eq!(TransportKind::from_reference("oci://alpine:latest"), TransportKind::Oci);
        assert_eq!(
            TransportKind::from_reference("containers-storage://alpine:latest"),
            TransportKind::ContainersStorage
        );
        assert_eq!(
            TransportKind::from_reference("docker-archive:/tmp/a.tar"),
            TransportKind::DockerArchive
        );
        assert_eq!(TransportKind::from_reference("unknown://alpine"), TransportKind::Unknown);
        assert_eq!(TransportKind::from_reference("alpine"), TransportKind::Unknown);
    }

    #[test]
    fn test_transport_labels() {
        assert_eq!(TransportKind::ContainersStorage.as_str(), "containers_storage");
        assert_eq!(TransportKind::OciArchive.to_string(), "oci_archive");
    }

    #[test]
    fn test_classify_error_lines() {
        assert_eq!(
            ErrorKind::classify("Error: unauthorized: authentication required"),
            ErrorKind::Unauthorized
        );
        assert_eq!(ErrorKind::classify("denied: requested access"), ErrorKind::Forbidden);
        assert_eq!(
            ErrorKind::classify("Error reading manifest latest"),
            ErrorKind::ManifestUnknown
        );
        assert_eq!(ErrorKind::classify("repository not found"), ErrorKind::NotFound);
        assert_eq!(ErrorKind::classify("Error: dial tcp: timeout"), ErrorKind::ToolError);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(OperationStatus::Success.as_str(), "success");
        assert_eq!(OperationStatus::Error.to_string(), "error");
    }
}
