//! Progress model for skopeo transfers.
//!
//! skopeo reports progress as human-oriented chatter on stderr. The
//! [`ProgressParser`] turns that stream into a [`ProgressInfo`] snapshot that
//! callers receive once per recognized line.
//!
//! # Step Ordering
//!
//! ```text
//! Pending ─► GettingSignatures ─► CopyingBlob ≈ CopyingConfig ─► WritingManifest
//!                                                                    │
//!                                              (older skopeo only)   ▼
//!                                     Done ◄── StoringSignatures ◄───┤
//!                                      ▲                             │
//!                                      └─────────────────────────────┘
//! Any step ──[error line]──► Error (terminal)
//! ```
//!
//! Percentages are a fixed lookup by step. skopeo does not expose total bytes
//! up front, so they are approximate and only useful as a coarse indicator.

mod parser;

pub use parser::ProgressParser;

use serde::Serialize;
use std::fmt;

/// Number of hex characters shown by [`Digest::short`].
pub const SHORT_DIGEST_LEN: usize = 12;

/// Kind of skopeo invocation being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// `skopeo copy`
    Copy,
    /// `skopeo inspect`
    Inspect,
    /// `skopeo delete`
    Delete,
    /// `skopeo manifest-digest`
    ManifestDigest,
    /// `skopeo inspect` used as an existence probe.
    ImageExists,
}

impl Operation {
    /// Label value used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Inspect => "inspect",
            Operation::Delete => "delete",
            Operation::ManifestDigest => "manifest_digest",
            Operation::ImageExists => "image_exists",
        }
    }

    /// The skopeo subcommand that implements this operation.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Inspect | Operation::ImageExists => "inspect",
            Operation::Delete => "delete",
            Operation::ManifestDigest => "manifest-digest",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer step reported by skopeo.
///
/// Not every step occurs on every skopeo version; `StoringSignatures` in
/// particular is absent on newer releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// No line recognized yet.
    Pending,
    GettingSignatures,
    CopyingBlob,
    CopyingConfig,
    WritingManifest,
    StoringSignatures,
    Done,
    Error,
}

impl Step {
    /// Position in the step order. `CopyingBlob` and `CopyingConfig` share a
    /// rank because skopeo may interleave them.
    pub fn ordinal(&self) -> u8 {
        match self {
            Step::Pending => 0,
            Step::GettingSignatures => 1,
            Step::CopyingBlob | Step::CopyingConfig => 2,
            Step::WritingManifest => 3,
            Step::StoringSignatures => 4,
            Step::Done => 5,
            Step::Error => 6,
        }
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Done | Step::Error)
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Step::Pending => "pending",
            Step::GettingSignatures => "getting_signatures",
            Step::CopyingBlob => "copying_blob",
            Step::CopyingConfig => "copying_config",
            Step::WritingManifest => "writing_manifest",
            Step::StoringSignatures => "storing_signatures",
            Step::Done => "done",
            Step::Error => "error",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Output dialect of the skopeo binary.
///
/// Older skopeo prints blob sizes and a trailing "Storing signatures" step;
/// newer releases print neither. The dialect only changes the percentage
/// reported while the manifest is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolDialect {
    /// Decide from the lines seen so far.
    #[default]
    Auto,
    /// Sized blob lines, followed by "Storing signatures".
    Legacy,
    /// No sizes, no signature step.
    Modern,
}

impl ToolDialect {
    /// Percent reported for `WritingManifest` under this dialect.
    ///
    /// `Auto` is treated as `Modern` until resolved.
    pub fn manifest_percent(&self) -> f64 {
        match self {
            ToolDialect::Legacy => 90.0,
            ToolDialect::Modern | ToolDialect::Auto => 85.0,
        }
    }
}

/// Content digest as printed by skopeo, e.g. `sha256:<64 hex>`.
///
/// The full token is authoritative for equality. Some skopeo versions print
/// an abbreviated bare hex digest, which is accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Parse a digest token, returning `None` if it is not one.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopeo_wrapper::progress::Digest;
    ///
    /// let digest = Digest::parse("sha256:af6eaf76a39c2d3e7e0b8a0420486e3df33c4027d696c076a99a3d0ac09026af").unwrap();
    /// assert_eq!(digest.algorithm(), Some("sha256"));
    /// assert_eq!(digest.short(), "af6eaf76a39c");
    ///
    /// assert!(Digest::parse("signatures").is_none());
    /// ```
    pub fn parse(token: &str) -> Option<Self> {
        let hex = match token.split_once(':') {
            Some((algorithm, hex)) => {
                let valid_algorithm = !algorithm.is_empty()
                    && algorithm
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
                if !valid_algorithm {
                    return None;
                }
                hex
            }
            None => token,
        };

        if hex.len() < SHORT_DIGEST_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        Some(Self(token.to_ascii_lowercase()))
    }

    /// The full digest token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Algorithm prefix, if the token carried one.
    pub fn algorithm(&self) -> Option<&str> {
        self.0.split_once(':').map(|(algorithm, _)| algorithm)
    }

    /// Hex part of the digest.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, hex)| hex)
    }

    /// First 12 hex characters, for display only.
    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..hex.len().min(SHORT_DIGEST_LEN)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    /// Filesystem layer.
    Layer,
    /// Image configuration.
    Config,
}

/// Transfer status of a single blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobStatus {
    #[default]
    Pending,
    InProgress,
    Done,
}

/// One content-addressed blob observed in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobRecord {
    pub digest: Digest,
    pub kind: BlobKind,
    /// Byte count, when the skopeo version prints it.
    pub size: Option<u64>,
    pub status: BlobStatus,
}

impl BlobRecord {
    /// A blob that skopeo has just started copying.
    pub fn new(digest: Digest, kind: BlobKind) -> Self {
        Self {
            digest,
            kind,
            size: None,
            status: BlobStatus::InProgress,
        }
    }

    /// Whether the record can no longer change.
    pub fn is_done(&self) -> bool {
        self.status == BlobStatus::Done
    }

    /// Record a size seen on a later line. Done records are left untouched.
    fn update_size(&mut self, size: Option<u64>) {
        if self.is_done() {
            return;
        }
        if let Some(size) = size {
            self.size = Some(size);
        }
    }

    /// Returns `true` if this call moved the blob to `Done`.
    fn mark_done(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.status = BlobStatus::Done;
        true
    }
}

/// Aggregated parse state of one skopeo invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressInfo {
    pub operation: Operation,
    pub current_step: Step,
    /// Index into `blobs` of the most recently touched record.
    pub current_blob: Option<usize>,
    /// Blobs in discovery order; digests are unique.
    pub blobs: Vec<BlobRecord>,
    pub manifest_written: bool,
    pub signatures_stored: bool,
    /// Verbatim error line. Once set, `completed` is true.
    pub error: Option<String>,
    pub completed: bool,
    /// Configured dialect.
    pub dialect: ToolDialect,
    #[serde(skip)]
    legacy_detected: bool,
}

impl ProgressInfo {
    /// Fresh state for an operation.
    pub fn new(operation: Operation, dialect: ToolDialect) -> Self {
        Self {
            operation,
            current_step: Step::Pending,
            current_blob: None,
            blobs: Vec::new(),
            manifest_written: false,
            signatures_stored: false,
            error: None,
            completed: false,
            dialect,
            legacy_detected: false,
        }
    }

    /// The blob most recently touched by the parser.
    pub fn current_blob(&self) -> Option<&BlobRecord> {
        self.current_blob.and_then(|index| self.blobs.get(index))
    }

    /// Look up a blob by its full digest.
    pub fn blob(&self, digest: &str) -> Option<&BlobRecord> {
        self.blob_index(digest).map(|index| &self.blobs[index])
    }

    /// Number of layer blobs (config excluded).
    pub fn layer_count(&self) -> usize {
        self.blobs
            .iter()
            .filter(|blob| blob.kind == BlobKind::Layer)
            .count()
    }

    /// Sum of all known blob sizes.
    pub fn known_bytes(&self) -> u64 {
        self.blobs.iter().filter_map(|blob| blob.size).sum()
    }

    /// Whether the operation ended with an error.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Dialect after auto-detection.
    pub fn effective_dialect(&self) -> ToolDialect {
        match self.dialect {
            ToolDialect::Auto if self.legacy_detected => ToolDialect::Legacy,
            ToolDialect::Auto => ToolDialect::Modern,
            dialect => dialect,
        }
    }

    /// Approximate completion percentage derived from the current step.
    pub fn percent(&self) -> f64 {
        match self.current_step {
            Step::Pending | Step::Error => 0.0,
            Step::GettingSignatures => 10.0,
            Step::CopyingBlob => 50.0,
            Step::CopyingConfig => 75.0,
            Step::WritingManifest => self.effective_dialect().manifest_percent(),
            Step::StoringSignatures => 95.0,
            Step::Done => 100.0,
        }
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return format!("{}: {}", Step::Error, error);
        }

        let mut line = format!("{}: {:.1}%", self.current_step, self.percent());
        if let Some(blob) = self.current_blob() {
            line.push_str(&format!(" (blob {}", blob.digest.short()));
            if let Some(size) = blob.size {
                line.push_str(&format!(", {} bytes", size));
            }
            line.push(')');
        }
        line
    }

    fn blob_index(&self, digest: &str) -> Option<usize> {
        self.blobs
            .iter()
            .position(|blob| blob.digest.as_str() == digest)
    }

    /// Moves to `step` unless that would go backwards. Returns whether the
    /// step changed.
    fn advance_to(&mut self, step: Step) -> bool {
        if step.ordinal() < self.current_step.ordinal() {
            return false;
        }
        self.current_step = step;
        true
    }

    /// Creates or updates the record for `digest` and makes it current.
    fn touch_blob(&mut self, digest: Digest, kind: BlobKind, size: Option<u64>) -> usize {
        if size.is_some() {
            self.legacy_detected = true;
        }

        let index = match self.blob_index(digest.as_str()) {
            Some(index) => {
                self.blobs[index].update_size(size);
                index
            }
            None => {
                let mut record = BlobRecord::new(digest, kind);
                record.size = size;
                self.blobs.push(record);
                self.blobs.len() - 1
            }
        };
        self.current_blob = Some(index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "sha256:af6eaf76a39c2d3e7e0b8a0420486e3df33c4027d696c076a99a3d0ac09026af";

    #[test]
    fn test_digest_parse_full() {
        let digest = Digest::parse(SHA).unwrap();
        assert_eq!(digest.algorithm(), Some("sha256"));
        assert_eq!(digest.hex().len(), 64);
        assert_eq!(digest.short(), "af6eaf76a39c");
        assert_eq!(digest.to_string(), SHA);
    }

    #[test]
    fn test_digest_parse_bare_hex() {
        let digest = Digest::parse("4abcf2066143").unwrap();
        assert_eq!(digest.algorithm(), None);
        assert_eq!(digest.short(), "4abcf2066143");
    }

    #[test]
    fn test_digest_rejects_non_hex() {
        assert!(Digest::parse("sha256:not-a-digest").is_none());
        assert!(Digest::parse("sha256:abc").is_none());
        assert!(Digest::parse(":af6eaf76a39c2d3e").is_none());
        assert!(Digest::parse("signatures").is_none());
    }

    #[test]
    fn test_step_ordinals() {
        assert!(Step::Pending.ordinal() < Step::GettingSignatures.ordinal());
        assert_eq!(Step::CopyingBlob.ordinal(), Step::CopyingConfig.ordinal());
        assert!(Step::WritingManifest.ordinal() < Step::StoringSignatures.ordinal());
        assert!(Step::StoringSignatures.ordinal() < Step::Done.ordinal());
        assert!(Step::Done.is_terminal());
        assert!(Step::Error.is_terminal());
        assert!(!Step::WritingManifest.is_terminal());
    }

    #[test]
    fn test_operation_labels() {
        assert_eq!(Operation::ManifestDigest.as_str(), "manifest_digest");
        assert_eq!(Operation::ManifestDigest.subcommand(), "manifest-digest");
        assert_eq!(Operation::ImageExists.subcommand(), "inspect");
    }

    #[test]
    fn test_advance_never_regresses() {
        let mut info = ProgressInfo::new(Operation::Copy, ToolDialect::Auto);
        assert!(info.advance_to(Step::WritingManifest));
        assert!(!info.advance_to(Step::CopyingBlob));
        assert_eq!(info.current_step, Step::WritingManifest);
    }

    #[test]
    fn test_touch_blob_deduplicates() {
        let mut info = ProgressInfo::new(Operation::Copy, ToolDialect::Auto);
        let first = info.touch_blob(Digest::parse(SHA).unwrap(), BlobKind::Layer, None);
        let second = info.touch_blob(Digest::parse(SHA).unwrap(), BlobKind::Layer, Some(42));

        assert_eq!(first, second);
        assert_eq!(info.blobs.len(), 1);
        assert_eq!(info.blobs[0].size, Some(42));
        assert_eq!(info.current_blob().unwrap().digest.as_str(), SHA);
    }

    #[test]
    fn test_done_blob_is_immutable() {
        let mut record = BlobRecord::new(Digest::parse(SHA).unwrap(), BlobKind::Layer);
        assert!(record.mark_done());
        assert!(!record.mark_done());
        record.update_size(Some(10));
        assert_eq!(record.size, None);
    }

    #[test]
    fn test_manifest_percent_by_dialect() {
        let mut info = ProgressInfo::new(Operation::Copy, ToolDialect::Auto);
        info.current_step = Step::WritingManifest;
        assert_eq!(info.percent(), 85.0);

        info.legacy_detected = true;
        assert_eq!(info.effective_dialect(), ToolDialect::Legacy);
        assert_eq!(info.percent(), 90.0);

        let mut modern = ProgressInfo::new(Operation::Copy, ToolDialect::Modern);
        modern.legacy_detected = true;
        modern.current_step = Step::WritingManifest;
        assert_eq!(modern.percent(), 85.0);
    }

    #[test]
    fn test_summary_includes_short_digest() {
        let mut info = ProgressInfo::new(Operation::Copy, ToolDialect::Auto);
        info.advance_to(Step::CopyingBlob);
        info.touch_blob(Digest::parse(SHA).unwrap(), BlobKind::Layer, Some(1234));

        let summary = info.summary();
        assert!(summary.starts_with("copying_blob: 50.0%"));
        assert!(summary.contains("af6eaf76a39c"));
        assert!(summary.contains("1234 bytes"));
    }
}
