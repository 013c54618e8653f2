//! # Unpacker
//!
//! Jailed extraction of untrusted archives for malware analysis pipelines.
//!
//! Archive decoding is left to the external `7z` tool. This crate decides
//! which format a sample is, runs the tool confined to a fresh output
//! directory under a time limit and an output quota, and turns whatever the
//! tool wrote into an ordered list of entries with content fingerprints.
//! Identical payloads surfacing again during a recursive session are
//! flagged as duplicates.
//!
//! ## Supported Formats
//!
//! - ZIP (also misnamed files starting with `PK`)
//! - 7-Zip, ISO 9660 / UDF images, xz
//! - gzip
//! - LZH / LHA
//! - VHD / VHDX (reserved `[SYSTEM]` partitions are skipped)
//!
//! ## Example
//!
//! ```rust,no_run
//! use unpacker::{DuplicateSet, SourceFile, UnpackConfig, UnpackStatus, Unpacker};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let unpacker = Unpacker::with_zipjail(UnpackConfig::default());
//! let mut duplicates = DuplicateSet::new();
//!
//! let source = SourceFile::from_path("sample.zip");
//! let outcome = unpacker.unpack_recursive(&source, None, Some(&mut duplicates))?;
//!
//! match &outcome.status {
//!     UnpackStatus::Extracted { handler } => {
//!         for entry in &outcome.entries {
//!             println!("{} {} ({})", handler, entry.relative_path.display(), entry.sha256);
//!         }
//!     }
//!     other => println!("nothing extracted: {:?}", other),
//! }
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod harvest;
pub mod jail;
pub mod safety;
pub mod source;
pub mod types;

// Re-export main types
pub use dispatch::Unpacker;
pub use error::{JailViolation, UnpackError};
pub use handlers::{Handler, HandlerRegistry, Signature, Tool, Toolchain};
pub use harvest::DuplicateSet;
pub use jail::{Jail, JailResult, JailStatus, ToolInvocation, ZipJail};
pub use source::SourceFile;
pub use types::{
    ExtractedEntry, JailConfig, JailLimits, UnpackConfig, UnpackOutcome, UnpackStatus,
};

/// Unpack a single source with the default configuration.
///
/// # Arguments
///
/// * `source` - The archive to unpack
/// * `password` - Optional password; `"infected"` is tried for zip and 7z when absent
/// * `duplicates` - Optional session-wide duplicate set
///
/// # Errors
///
/// Returns an error only if scratch space cannot be allocated or the
/// on-disk source does not exist.
pub fn unpack(
    source: &SourceFile,
    password: Option<&str>,
    duplicates: Option<&mut DuplicateSet>,
) -> Result<UnpackOutcome, UnpackError> {
    Unpacker::with_zipjail(UnpackConfig::default()).unpack(source, password, duplicates)
}

/// Name of the first handler claiming `source`, without running anything.
pub fn identify(source: &SourceFile) -> Option<&'static str> {
    HandlerRegistry::default()
        .identify(source)
        .map(|handler| handler.name())
}
