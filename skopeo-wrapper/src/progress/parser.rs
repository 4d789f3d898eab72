//! Line-oriented parser for skopeo's stderr chatter.
//!
//! Each recognized line advances the owning [`ProgressInfo`]. Matchers are
//! tried in a fixed order so a line matching several shapes always resolves
//! the same way:
//!
//! 1. `Getting image source signatures`
//! 2. `Copying blob <digest>[ <size> bytes][ done|skipped...]`
//! 3. `Copying config <digest>`
//! 4. `Writing manifest to image destination`
//! 5. `Storing signatures`
//! 6. terminal error lines: a line starting with `Error:`, `FATA[` or another
//!    error prefix (`unauthorized`, `manifest unknown`, ...), or a
//!    `level=fatal` log line
//!
//! Step phrases and error prefixes only match at the start of a line.
//! Warning-level log lines (`level=warning`, `WARN[`) are never errors, even
//! when they quote one: skopeo prints them before retrying.
//! Anything else is ignored so unknown skopeo versions never break parsing.
//! Completion is end-of-stream without an error, not "all steps observed".

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::{BlobKind, BlobRecord, Digest, Operation, ProgressInfo, Step, ToolDialect};

/// Line prefixes (lowercase) of a tool-reported terminal error.
const ERROR_PREFIXES: &[&str] = &[
    "error",
    "fatal",
    "fata[",
    "unauthorized",
    "forbidden",
    "denied",
    "manifest unknown",
    "not found",
];

/// Log-level markers (lowercase) of a fatal log line anywhere in the line.
const FATAL_LEVELS: &[&str] = &["level=fatal", "level=panic"];

/// Log-level markers (lowercase) of non-fatal chatter, in key=value form.
const NON_FATAL_LEVELS: &[&str] = &["level=warning", "level=warn", "level=info", "level=debug"];

/// Line prefixes (lowercase) of non-fatal chatter in logrus text form.
const NON_FATAL_PREFIXES: &[&str] = &["warn[", "info[", "debu["];

/// Whether a lowercased, trimmed line is a terminal error.
fn is_terminal_error(lower: &str) -> bool {
    if NON_FATAL_LEVELS.iter().any(|level| lower.contains(level))
        || NON_FATAL_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
    {
        return false;
    }
    FATAL_LEVELS.iter().any(|level| lower.contains(level))
        || ERROR_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}

/// Matches `Copying blob|config <token><rest>`.
fn copy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Group 1: blob|config, group 2: digest token, group 3: remainder
        Regex::new(r"(?i)^copying\s+(blob|config)\s+(\S+)(.*)$").unwrap()
    })
}

/// Matches an optional byte count, with or without parentheses.
fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\(?\s*(\d+)\s*bytes?\s*\)?").unwrap())
}

/// Stateful parser for one skopeo invocation.
///
/// # Example
///
/// ```
/// use skopeo_wrapper::progress::{Operation, ProgressParser, Step};
///
/// let mut parser = ProgressParser::new(Operation::Copy);
/// parser.parse_line("Getting image source signatures");
/// parser.parse_line("Writing manifest to image destination");
///
/// let info = parser.finish();
/// assert_eq!(info.current_step, Step::Done);
/// assert!(info.completed);
/// ```
#[derive(Debug, Clone)]
pub struct ProgressParser {
    info: ProgressInfo,
    /// Indices of blobs that reached `Done` since the last drain.
    finished: Vec<usize>,
}

impl ProgressParser {
    /// Create a parser that auto-detects the skopeo dialect.
    pub fn new(operation: Operation) -> Self {
        Self::with_dialect(operation, ToolDialect::Auto)
    }

    /// Create a parser for a known skopeo dialect.
    pub fn with_dialect(operation: Operation, dialect: ToolDialect) -> Self {
        Self {
            info: ProgressInfo::new(operation, dialect),
            finished: Vec::new(),
        }
    }

    /// Current snapshot.
    pub fn progress(&self) -> &ProgressInfo {
        &self.info
    }

    /// Consume the parser, keeping the final snapshot.
    pub fn into_progress(self) -> ProgressInfo {
        self.info
    }

    /// Feed one line of skopeo stderr.
    ///
    /// Returns the updated snapshot if the line was recognized, or `None` for
    /// blank, unknown, or post-terminal lines.
    pub fn parse_line(&mut self, line: &str) -> Option<&ProgressInfo> {
        if self.info.completed {
            return None;
        }

        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let lower = line.to_ascii_lowercase();

        let recognized = if lower.starts_with("getting image source signatures") {
            self.info.advance_to(Step::GettingSignatures);
            true
        } else if let Some(captures) = copy_pattern().captures(line) {
            self.on_copy_line(&captures[1], &captures[2], &captures[3])
        } else if lower.starts_with("writing manifest to image destination") {
            self.on_manifest();
            true
        } else if lower.starts_with("storing signatures") {
            self.info.signatures_stored = true;
            self.info.legacy_detected = true;
            self.info.advance_to(Step::StoringSignatures);
            true
        } else if is_terminal_error(&lower) {
            warn!(operation = %self.info.operation, line, "skopeo reported an error");
            self.set_error(line.to_string());
            true
        } else {
            false
        };

        if !recognized {
            return None;
        }

        debug!(
            operation = %self.info.operation,
            step = %self.info.current_step,
            blobs = self.info.blobs.len(),
            "progress advanced"
        );
        Some(&self.info)
    }

    /// Mark end-of-stream.
    ///
    /// Without a prior error the operation becomes `Done` at 100%; after an
    /// error the snapshot is returned unchanged.
    pub fn finish(&mut self) -> &ProgressInfo {
        if !self.info.completed {
            self.finish_all_blobs();
            self.info.current_step = Step::Done;
            self.info.completed = true;
        }
        &self.info
    }

    /// Record a failure that did not come from a stderr line, such as a
    /// non-zero exit or a timeout. The first error wins.
    pub fn fail(&mut self, message: impl Into<String>) -> &ProgressInfo {
        if !self.info.completed {
            self.set_error(message.into());
        }
        &self.info
    }

    /// Take the blobs that finished since the last call, in completion order.
    pub fn take_finished_blobs(&mut self) -> Vec<BlobRecord> {
        std::mem::take(&mut self.finished)
            .into_iter()
            .map(|index| self.info.blobs[index].clone())
            .collect()
    }

    fn on_copy_line(&mut self, kind: &str, token: &str, rest: &str) -> bool {
        let Some(digest) = Digest::parse(token) else {
            return false;
        };
        let kind = if kind.eq_ignore_ascii_case("config") {
            BlobKind::Config
        } else {
            BlobKind::Layer
        };
        let size = size_pattern()
            .captures(rest)
            .and_then(|captures| captures[1].parse::<u64>().ok());

        let index = self.info.touch_blob(digest, kind, size);

        let rest = rest.to_ascii_lowercase();
        if rest.contains("done") || rest.contains("skipped") || rest.contains("already exists") {
            self.finish_blob(index);
        }

        match kind {
            // Only the first layer moves the step; later layers may follow
            // the config without regressing it.
            BlobKind::Layer => {
                if self.info.current_step.ordinal() < Step::CopyingBlob.ordinal() {
                    self.info.advance_to(Step::CopyingBlob);
                }
            }
            BlobKind::Config => {
                self.info.advance_to(Step::CopyingConfig);
            }
        }
        true
    }

    fn on_manifest(&mut self) {
        self.info.manifest_written = true;
        self.info.advance_to(Step::WritingManifest);
        // skopeo writes the manifest only after every blob is in place
        self.finish_all_blobs();
    }

    fn set_error(&mut self, message: String) {
        self.info.error = Some(message);
        self.info.current_step = Step::Error;
        self.info.completed = true;
    }

    fn finish_blob(&mut self, index: usize) {
        if self.info.blobs[index].mark_done() {
            self.finished.push(index);
        }
    }

    fn finish_all_blobs(&mut self) {
        for index in 0..self.info.blobs.len() {
            self.finish_blob(index);
        }
    }
}
