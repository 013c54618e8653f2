//! Turns a populated output directory into extracted entries.

use crate::handlers::Handler;
use crate::safety::{validate_entry_path, EntryType};
use crate::types::ExtractedEntry;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Content fingerprints seen during one recursive unpack session.
///
/// Pass the same set to every call belonging to a session; it only grows.
#[derive(Debug, Clone, Default)]
pub struct DuplicateSet {
    seen: HashSet<String>,
}

impl DuplicateSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `fingerprint`; returns `true` if it was not seen before.
    pub fn insert(&mut self, fingerprint: &str) -> bool {
        if self.seen.contains(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.to_string())
    }

    /// Whether `fingerprint` was seen.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Number of distinct contents seen.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing was seen yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Builds one entry per regular file below `output_dir`, in lexicographic
/// path order.
///
/// Directories are descended into; symlinks and special files are skipped
/// and never followed. Paths the handler excludes are dropped. With a
/// duplicate set, content already present is marked `is_duplicate` but still
/// returned; without one, every entry counts as unique.
///
/// The set is only updated once the whole tree was read. On error it is
/// left exactly as it was.
pub fn harvest(
    output_dir: &Path,
    handler: &dyn Handler,
    duplicates: Option<&mut DuplicateSet>,
) -> io::Result<Vec<ExtractedEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(output_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;

        match EntryType::from(entry.file_type()) {
            EntryType::File => {}
            EntryType::Directory => continue,
            kind @ (EntryType::Symlink | EntryType::Other) => {
                debug!(path = ?entry.path(), ?kind, "skipping non-regular output entry");
                continue;
            }
        }

        let relative = entry.path().strip_prefix(output_dir).unwrap_or(entry.path());
        let relative_path = match validate_entry_path(relative) {
            Ok(path) => path,
            Err(violation) => {
                warn!(path = ?entry.path(), %violation, "skipping unsafe output path");
                continue;
            }
        };

        if handler.excludes(&relative_path) {
            debug!(path = ?relative_path, handler = handler.name(), "excluded by handler");
            continue;
        }

        let (sha256, size) = fingerprint(entry.path())?;
        entries.push(ExtractedEntry {
            relative_path,
            path: entry.path().to_path_buf(),
            size,
            sha256,
            is_duplicate: false,
            nested_format: None,
            children: None,
        });
    }

    if let Some(set) = duplicates {
        for entry in &mut entries {
            entry.is_duplicate = !set.insert(&entry.sha256);
        }
    }

    Ok(entries)
}

/// Streaming SHA-256 of a file, as lowercase hex, plus its size.
pub fn fingerprint(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{VhdHandler, ZipHandler};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn populate(dir: &Path, files: &[(&str, &[u8])]) {
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_harvest_sorted_regular_files() {
        let temp_dir = TempDir::new().unwrap();
        populate(
            temp_dir.path(),
            &[("b.txt", b"b"), ("a/z.txt", b"z"), ("a/c.txt", b"c"), ("empty/.keep", b"")],
        );

        let entries = harvest(temp_dir.path(), &ZipHandler, None).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(
            paths,
            [
                PathBuf::from("a/c.txt"),
                PathBuf::from("a/z.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("empty/.keep"),
            ]
        );
        assert!(entries.iter().all(|e| !e.is_duplicate));
    }

    #[test]
    fn test_harvest_fingerprint_and_size() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), &[("a.txt", b"hello")]);

        let entries = harvest(temp_dir.path(), &ZipHandler, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sha256, HELLO_SHA256);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].read().unwrap(), b"hello");
        assert_eq!(entries[0].path, temp_dir.path().join("a.txt"));
    }

    #[test]
    fn test_harvest_marks_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        populate(
            temp_dir.path(),
            &[("1.txt", b"same"), ("2.txt", b"same"), ("3.txt", b"other")],
        );

        let mut duplicates = DuplicateSet::new();
        let entries = harvest(temp_dir.path(), &ZipHandler, Some(&mut duplicates)).unwrap();

        let flags: Vec<_> = entries.iter().map(|e| e.is_duplicate).collect();
        assert_eq!(flags, [false, true, false]);
        assert_eq!(duplicates.len(), 2);
    }

    #[test]
    fn test_harvest_without_set_never_marks() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), &[("1.txt", b"same"), ("2.txt", b"same")]);

        let entries = harvest(temp_dir.path(), &ZipHandler, None).unwrap();
        assert!(entries.iter().all(|e| !e.is_duplicate));
    }

    #[test]
    fn test_harvest_applies_handler_exclusions() {
        let temp_dir = TempDir::new().unwrap();
        populate(
            temp_dir.path(),
            &[("[SYSTEM]/boot.ini", b"boot"), ("0.ntfs/payload.exe", b"MZ")],
        );

        let entries = harvest(temp_dir.path(), &VhdHandler, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, Path::new("0.ntfs/payload.exe"));
    }

    #[cfg(unix)]
    #[test]
    fn test_harvest_skips_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), &[("a.txt", b"a")]);
        std::os::unix::fs::symlink("/etc", temp_dir.path().join("etc")).unwrap();
        std::os::unix::fs::symlink("a.txt", temp_dir.path().join("b.txt")).unwrap();

        let entries = harvest(temp_dir.path(), &ZipHandler, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, Path::new("a.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_harvest_failure_leaves_set_untouched() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), &[("a.txt", b"a"), ("b/c.txt", b"c")]);
        let locked = temp_dir.path().join("b");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let privileged = fs::read_dir(&locked).is_ok();

        let mut duplicates = DuplicateSet::new();
        let result = harvest(temp_dir.path(), &ZipHandler, Some(&mut duplicates));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        // Permission bits do not bind this user
        if privileged {
            return;
        }

        // a.txt was fingerprinted before the walk failed on b/
        assert!(result.is_err());
        assert!(duplicates.is_empty());
    }

    #[test]
    fn test_duplicate_set_never_shrinks() {
        let mut set = DuplicateSet::new();
        assert!(set.is_empty());
        assert!(set.insert("abc"));
        assert!(!set.insert("abc"));
        assert!(set.contains("abc"));
        assert_eq!(set.len(), 1);
    }
}
