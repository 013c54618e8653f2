//! Security checks applied to whatever the extraction tool leaves behind.
//!
//! The jail is the primary defense; these helpers re-check its output so a
//! misbehaving tool or a missing confinement wrapper cannot hand a
//! path-escaping entry or an archive bomb to the rest of the pipeline.

use crate::error::JailViolation;
use crate::types::JailLimits;
use std::fs::{self, FileType};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Kind of node found in an output tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Other special file types (device, socket, fifo, etc.)
    Other,
}

impl From<FileType> for EntryType {
    fn from(file_type: FileType) -> Self {
        if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::File
        } else {
            EntryType::Other
        }
    }
}

/// Running totals of what the tool has written so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputUsage {
    /// Number of regular files
    pub files: u64,
    /// Sum of regular file sizes in bytes
    pub bytes: u64,
}

/// Validates and normalizes a path relative to the output directory.
///
/// This function performs the following checks:
/// - Rejects absolute paths
/// - Rejects paths containing ".." components
/// - Normalizes the path to remove redundant separators and "." components
///
/// # Arguments
///
/// * `path` - Path of an entry, relative to the output directory
///
/// # Returns
///
/// Returns a normalized `PathBuf` if the path stays inside the output
/// directory, or [`JailViolation::PathEscape`] otherwise.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use unpacker::safety::validate_entry_path;
///
/// let safe_path = validate_entry_path(Path::new("dir/file.txt")).unwrap();
/// assert_eq!(safe_path, Path::new("dir/file.txt"));
///
/// assert!(validate_entry_path(Path::new("../../etc/passwd")).is_err());
/// assert!(validate_entry_path(Path::new("/etc/passwd")).is_err());
/// ```
pub fn validate_entry_path(path: &Path) -> Result<PathBuf, JailViolation> {
    if path.is_absolute() {
        return Err(JailViolation::PathEscape(format!(
            "absolute path: {}",
            path.display()
        )));
    }

    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => {
                // Some tools encode ".." inside a single component
                if part == ".." {
                    return Err(JailViolation::PathEscape(format!(
                        "'..' component: {}",
                        path.display()
                    )));
                }
                normalized.push(part);
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                return Err(JailViolation::PathEscape(format!(
                    "'..' component: {}",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(JailViolation::PathEscape(format!(
                    "absolute path: {}",
                    path.display()
                )));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(JailViolation::PathEscape(format!(
            "path normalizes to empty: {}",
            path.display()
        )));
    }

    Ok(normalized)
}

/// Reports whether a symlink at `link` (relative to the output directory)
/// pointing at `target` resolves outside the output directory.
///
/// Resolution is purely lexical; nothing on disk is followed.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use unpacker::safety::symlink_escapes;
///
/// assert!(!symlink_escapes(Path::new("a/link"), Path::new("../b.txt")));
/// assert!(symlink_escapes(Path::new("a/link"), Path::new("../../etc/passwd")));
/// assert!(symlink_escapes(Path::new("link"), Path::new("/etc/passwd")));
/// ```
pub fn symlink_escapes(link: &Path, target: &Path) -> bool {
    if target.has_root() {
        return true;
    }

    // Depth of the directory holding the link.
    let mut depth: usize = link
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count()
        })
        .unwrap_or(0);

    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }

    false
}

/// Checks the output usage against the configured quota.
///
/// # Examples
///
/// ```
/// use unpacker::safety::{check_quota, OutputUsage};
/// use unpacker::JailLimits;
///
/// let limits = JailLimits { max_total_bytes: Some(2000), max_files: Some(10) };
///
/// assert!(check_quota(OutputUsage { files: 1, bytes: 1000 }, &limits).is_ok());
/// assert!(check_quota(OutputUsage { files: 1, bytes: 3000 }, &limits).is_err());
/// assert!(check_quota(OutputUsage { files: 11, bytes: 0 }, &limits).is_err());
/// ```
pub fn check_quota(usage: OutputUsage, limits: &JailLimits) -> Result<(), JailViolation> {
    let over_bytes = limits
        .max_total_bytes
        .is_some_and(|max_bytes| usage.bytes > max_bytes);
    let over_files = limits.max_files.is_some_and(|max_files| usage.files > max_files);

    if over_bytes || over_files {
        return Err(JailViolation::QuotaExceeded {
            files: usage.files,
            bytes: usage.bytes,
        });
    }
    Ok(())
}

/// Gives the owner full access to `dir` and every directory below it, and
/// read/write access to every regular file, so the tree can be harvested
/// and removed whatever modes the tool left behind. Symlinks are not followed.
#[cfg(unix)]
pub fn unlock_tree(dir: &Path) -> io::Result<()> {
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        grant(&current, 0o700)?;
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                grant(&entry.path(), 0o600)?;
            }
        }
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn unlock_tree(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn grant(path: &Path, bits: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::symlink_metadata(path)?.permissions();
    if permissions.mode() & bits != bits {
        permissions.set_mode(permissions.mode() | bits);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
