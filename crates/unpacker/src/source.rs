//! The archive being unpacked, either on disk or in memory.

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// An archive submitted for unpacking.
///
/// Either `filepath` or the one-shot `stream` is the ground truth. Contents
/// are read lazily and cached, so an in-memory stream is drained at most once.
/// A failed read is cached too: the source stays unusable afterwards.
pub struct SourceFile {
    filepath: Option<PathBuf>,
    filename: Option<String>,
    stream: RefCell<Option<Box<dyn Read>>>,
    contents: OnceCell<Result<Vec<u8>, LoadError>>,
}

/// Read failure kept in place of the contents.
#[derive(Debug, Clone)]
struct LoadError {
    kind: io::ErrorKind,
    message: String,
}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl SourceFile {
    /// A source backed by a file on disk.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            filepath: Some(path.into()),
            filename: None,
            stream: RefCell::new(None),
            contents: OnceCell::new(),
        }
    }

    /// A source backed by a readable stream. `filename` is only used for
    /// extension matching.
    pub fn from_reader(filename: Option<&str>, reader: impl Read + 'static) -> Self {
        Self {
            filepath: None,
            filename: filename.map(str::to_string),
            stream: RefCell::new(Some(Box::new(reader))),
            contents: OnceCell::new(),
        }
    }

    /// A source backed by bytes already in memory.
    pub fn from_bytes(filename: Option<&str>, bytes: Vec<u8>) -> Self {
        Self {
            filepath: None,
            filename: filename.map(str::to_string),
            stream: RefCell::new(None),
            contents: OnceCell::from(Ok(bytes)),
        }
    }

    /// Path on disk, if the source has one.
    pub fn filepath(&self) -> Option<&Path> {
        self.filepath.as_deref()
    }

    /// Name used for display and extension matching.
    pub fn filename(&self) -> Option<&str> {
        match &self.filepath {
            Some(path) => path.file_name().and_then(|n| n.to_str()),
            None => self.filename.as_deref(),
        }
    }

    /// Lowercase extension including the leading dot, e.g. `".zip"`.
    pub fn extension(&self) -> Option<String> {
        let name = self.filename()?;
        let ext = Path::new(name).extension()?.to_str()?;
        Some(format!(".{}", ext.to_lowercase()))
    }

    /// Full contents, read from disk or drained from the stream on first use.
    ///
    /// If that first read fails, every later call returns the same error.
    pub fn contents(&self) -> io::Result<&[u8]> {
        match self.contents.get_or_init(|| self.load().map_err(LoadError::from)) {
            Ok(contents) => Ok(contents.as_slice()),
            Err(e) => Err(io::Error::new(e.kind, e.message.clone())),
        }
    }

    fn load(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        match &self.filepath {
            Some(path) => {
                File::open(path)?.read_to_end(&mut buf)?;
            }
            None => {
                if let Some(mut stream) = self.stream.borrow_mut().take() {
                    stream.read_to_end(&mut buf)?;
                }
            }
        }
        Ok(buf)
    }

    /// At most `len` leading bytes. On-disk files are not read in full.
    pub fn header(&self, len: usize) -> io::Result<Vec<u8>> {
        if self.contents.get().is_none() {
            if let Some(path) = &self.filepath {
                let mut buf = Vec::with_capacity(len.min(64 * 1024));
                File::open(path)?.take(len as u64).read_to_end(&mut buf)?;
                return Ok(buf);
            }
        }

        let contents = self.contents()?;
        Ok(contents[..len.min(contents.len())].to_vec())
    }

    /// Writes the contents to a new, uniquely named temporary file.
    ///
    /// Every call creates a fresh file. The returned guard deletes it when
    /// dropped; the caller that asked for it owns it.
    pub fn temp_path(&self, suffix: &str, dir: Option<&Path>) -> io::Result<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("unpack-src-").suffix(suffix);
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        file.write_all(self.contents()?)?;
        file.flush()?;
        Ok(file.into_temp_path())
    }
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("filepath", &self.filepath)
            .field("filename", &self.filename)
            .field(
                "loaded",
                &self.contents.get().map(|c| c.as_ref().map(Vec::len).ok()),
            )
            .finish()
    }
}

/// Filesystem path of the archive handed to the tool.
///
/// Borrowed when the source already lives on disk; otherwise a temporary
/// copy that is removed when this value goes out of scope.
pub(crate) enum ArchivePath<'a> {
    Existing(&'a Path),
    Temporary(TempPath),
}

impl ArchivePath<'_> {
    pub(crate) fn path(&self) -> &Path {
        match self {
            ArchivePath::Existing(path) => *path,
            ArchivePath::Temporary(temp) => &**temp,
        }
    }

    pub(crate) fn is_temporary(&self) -> bool {
        matches!(self, ArchivePath::Temporary(_))
    }
}
