//! Error types for unpack operations.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors that abort the current unpack request.
///
/// Anything an archive can cause on its own (corruption, wrong password,
/// jail rejection) is reported through [`crate::UnpackStatus`] instead.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// Source file not found at the specified path.
    #[error("Source file not found: {0}")]
    NotFound(PathBuf),

    /// A scratch directory or temporary archive copy could not be created.
    #[error("Unable to allocate temporary storage: {0}")]
    TempAllocation(#[source] std::io::Error),

    /// An I/O error occurred while reading the source or a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Constraint violations detected by the jail.
///
/// These are security events: the archive tried to do something the jail
/// does not allow, so nothing it produced is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JailViolation {
    /// The tool did not finish within the wall-clock limit.
    #[error("Timed out after {0:?}")]
    Timeout(#[serde(with = "crate::types::duration_secs")] Duration),

    /// The output tree grew beyond the configured quota.
    #[error("Quota exceeded: {files} files, {bytes} bytes written")]
    QuotaExceeded {
        /// Regular files present when the quota tripped
        files: u64,
        /// Bytes present when the quota tripped
        bytes: u64,
    },

    /// The tool tried to place something outside the output directory.
    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    /// The confinement wrapper blocked a system call.
    #[error("Blocked system call during extraction")]
    BlockedSyscall,
}
