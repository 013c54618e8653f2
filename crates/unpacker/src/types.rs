//! Type definitions for unpack requests and their results.

use crate::error::{JailViolation, UnpackError};
use crate::source::SourceFile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Quota enforced on everything a single tool run writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JailLimits {
    /// Maximum total bytes in the output tree (default: 1 GiB)
    pub max_total_bytes: Option<u64>,

    /// Maximum number of regular files in the output tree (default: 10 000)
    pub max_files: Option<u64>,
}

impl Default for JailLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: Some(1024 * 1024 * 1024), // 1 GiB
            max_files: Some(10_000),
        }
    }
}

/// Settings for [`crate::ZipJail`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    /// Confinement wrapper invoked as `wrapper <archive> <dir> -- <tool> <args>`.
    /// When unset, `zipjail` is looked up on `PATH`.
    pub wrapper: Option<PathBuf>,

    /// Refuse to run when no wrapper can be found (default). Switching this
    /// off leaves only the supervisor checks, which do not stop direct writes
    /// outside the output directory; meant for development hosts.
    pub require_wrapper: bool,

    /// Wall-clock limit for one tool run (in seconds)
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// How often the output tree is measured while the tool runs (in milliseconds)
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Output quota
    pub limits: JailLimits,

    /// `PATH` handed to the child; its environment is otherwise empty
    pub path: String,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            wrapper: None,
            require_wrapper: true,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            limits: JailLimits::default(),
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

/// Settings for [`crate::Unpacker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackConfig {
    /// Parent directory for output directories and temporary archive copies.
    /// Defaults to the system temp directory.
    pub work_dir: Option<PathBuf>,

    /// Explicit path of the `7z` binary; looked up on `PATH` when unset
    pub sevenzip: Option<PathBuf>,

    /// Maximum nesting depth followed by [`crate::Unpacker::unpack_recursive`]
    pub max_depth: usize,

    /// Jail settings
    pub jail: JailConfig,
}

impl Default for UnpackConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            sevenzip: None,
            max_depth: 4,
            jail: JailConfig::default(),
        }
    }
}

impl UnpackConfig {
    /// Loads a JSON configuration file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, UnpackError> {
        if !path.exists() {
            return Err(UnpackError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

/// One regular file recovered from an archive.
#[derive(Debug, Serialize)]
pub struct ExtractedEntry {
    /// Path of the file relative to the output directory
    pub relative_path: PathBuf,

    /// Location of the content on disk, inside the owning outcome's output directory
    pub path: PathBuf,

    /// Size in bytes
    pub size: u64,

    /// Lowercase hex SHA-256 of the content
    pub sha256: String,

    /// Whether this content was already seen earlier in the session
    pub is_duplicate: bool,

    /// Name of the handler that claims this file, if it is itself an archive
    pub nested_format: Option<String>,

    /// Result of unpacking this file, when recursion reached it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Box<UnpackOutcome>>,
}

impl ExtractedEntry {
    /// Reads the entry's content.
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    /// Wraps the entry as a source for a nested unpack.
    pub fn to_source(&self) -> SourceFile {
        SourceFile::from_path(&self.path)
    }
}

/// How an unpack request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnpackStatus {
    /// The tool ran to completion and the output was harvested.
    Extracted {
        /// Handler that performed the extraction
        handler: String,
    },

    /// No registered handler claimed the source.
    NoHandler,

    /// The jail stopped the tool.
    Rejected {
        /// Handler whose tool was stopped
        handler: String,
        /// What the tool attempted
        violation: JailViolation,
    },

    /// The tool exited unsuccessfully without violating any constraint.
    ToolFailed {
        /// Handler whose tool failed
        handler: String,
        /// Process exit code, if the tool ran at all
        exit_code: Option<i32>,
        /// Last diagnostic line from the tool
        message: String,
    },

    /// The tool succeeded but its output could not be read back.
    HarvestFailed {
        /// Handler whose output was unreadable
        handler: String,
        /// The I/O error encountered
        message: String,
    },
}

impl UnpackStatus {
    /// Whether the tool succeeded. An empty archive still counts.
    pub fn is_extracted(&self) -> bool {
        matches!(self, UnpackStatus::Extracted { .. })
    }
}

/// Discriminated result of an unpack request.
///
/// The output directory is owned by the outcome and removed when it is
/// dropped; call [`UnpackOutcome::keep`] to take it over.
#[derive(Debug, Serialize)]
pub struct UnpackOutcome {
    /// How the request ended
    #[serde(flatten)]
    pub status: UnpackStatus,

    /// Extracted files in lexicographic path order; empty unless extracted
    pub entries: Vec<ExtractedEntry>,

    #[serde(skip)]
    output_dir: Option<TempDir>,
}

impl UnpackOutcome {
    pub(crate) fn extracted(handler: &str, entries: Vec<ExtractedEntry>, output_dir: TempDir) -> Self {
        Self {
            status: UnpackStatus::Extracted {
                handler: handler.to_string(),
            },
            entries,
            output_dir: Some(output_dir),
        }
    }

    pub(crate) fn failed(status: UnpackStatus) -> Self {
        Self {
            status,
            entries: Vec::new(),
            output_dir: None,
        }
    }

    /// Directory holding the extracted files, while still owned by this outcome.
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_ref().map(TempDir::path)
    }

    /// Detaches the output directory so it survives this outcome.
    ///
    /// Nested outcomes keep their own directories; keep them separately.
    pub fn keep(&mut self) -> Option<PathBuf> {
        self.output_dir.take().map(TempDir::keep)
    }

    /// Visits every entry depth-first, including those of nested outcomes.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(usize, &'a ExtractedEntry)) {
        fn descend<'a>(
            outcome: &'a UnpackOutcome,
            depth: usize,
            visit: &mut dyn FnMut(usize, &'a ExtractedEntry),
        ) {
            for entry in &outcome.entries {
                visit(depth, entry);
                if let Some(children) = &entry.children {
                    descend(children, depth + 1, visit);
                }
            }
        }
        descend(self, 0, visit);
    }
}

// Helper modules for Duration serialization
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
