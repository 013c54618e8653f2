//! Archive format handlers and the priority-ordered registry that picks one.
//!
//! A handler decides whether it claims a source and how the external tool
//! must be invoked for it. It never touches the filesystem itself; the
//! [`crate::Unpacker`] owns the unpack lifecycle.

use crate::source::SourceFile;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Leading bytes identifying a format, found at a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Byte offset from the start of the file
    pub offset: usize,
    /// Expected bytes
    pub bytes: &'static [u8],
}

impl Signature {
    /// Signature `bytes` expected at `offset`.
    pub const fn at(offset: usize, bytes: &'static [u8]) -> Self {
        Self { offset, bytes }
    }

    /// Number of leading bytes needed to evaluate this signature.
    pub fn span(&self) -> usize {
        self.offset + self.bytes.len()
    }

    /// Whether `header` carries this signature.
    pub fn matches(&self, header: &[u8]) -> bool {
        header
            .get(self.offset..self.span())
            .is_some_and(|window| window == self.bytes)
    }
}

/// External programs a handler may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// The `7z` command-line archiver
    SevenZip,
}

impl Tool {
    fn binary_names(self) -> &'static [&'static str] {
        match self {
            Tool::SevenZip => &["7z", "7zz", "7za"],
        }
    }
}

/// Resolved locations of the external tools on this host.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    sevenzip: Option<PathBuf>,
}

impl Toolchain {
    /// Uses exactly the given binary locations, without probing.
    pub fn new(sevenzip: Option<PathBuf>) -> Self {
        Self { sevenzip }
    }

    /// Uses `explicit` when given, otherwise searches `PATH`.
    pub fn discover(explicit: Option<&Path>) -> Self {
        let sevenzip = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Tool::SevenZip
                .binary_names()
                .iter()
                .find_map(|name| which::which(name).ok()),
        };
        debug!(?sevenzip, "resolved extraction tools");
        Self { sevenzip }
    }

    /// Location of `tool`, if available.
    pub fn resolve(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::SevenZip => self.sevenzip.as_deref(),
        }
    }
}

/// One archive family.
///
/// Implementations are stateless; everything call-specific arrives as an
/// argument.
pub trait Handler: Send + Sync {
    /// Unique identifier.
    fn name(&self) -> &'static str;

    /// Recognized extensions, lowercase with the leading dot.
    fn exts(&self) -> &'static [&'static str];

    /// Recognized content signatures.
    fn magic(&self) -> &'static [Signature];

    /// Program performing the extraction.
    fn tool(&self) -> Tool {
        Tool::SevenZip
    }

    /// Suffix of the temporary copy made for in-memory sources.
    fn temp_suffix(&self) -> &'static str {
        ".7z"
    }

    /// Password used when the caller supplies none.
    fn default_password(&self) -> Option<&'static str> {
        None
    }

    /// Whether the backing tool is available.
    fn supported(&self, tools: &Toolchain) -> bool {
        tools.resolve(self.tool()).is_some()
    }

    /// Whether this handler claims `source`.
    fn handles(&self, source: &SourceFile) -> bool {
        matches_extension(self.exts(), source) || matches_magic(self.magic(), source)
    }

    /// Arguments for the tool: extraction verb, flags, then the archive path.
    fn extract_args(&self, password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString>;

    /// Whether a harvested path must be dropped from the result.
    fn excludes(&self, _relative_path: &Path) -> bool {
        false
    }
}

/// Whether the source's extension is one of `exts`.
pub fn matches_extension(exts: &[&str], source: &SourceFile) -> bool {
    source
        .extension()
        .is_some_and(|ext| exts.iter().any(|candidate| *candidate == ext))
}

/// Whether the source's leading bytes carry any of `magic`.
pub fn matches_magic(magic: &[Signature], source: &SourceFile) -> bool {
    let Some(span) = magic.iter().map(Signature::span).max() else {
        return false;
    };

    match source.header(span) {
        Ok(header) => magic.iter().any(|signature| signature.matches(&header)),
        Err(e) => {
            debug!(error = %e, "unable to read source header");
            false
        }
    }
}

/// Whether the source's leading bytes carry every one of `magic`.
pub fn matches_all_magic(magic: &[Signature], source: &SourceFile) -> bool {
    let Some(span) = magic.iter().map(Signature::span).max() else {
        return false;
    };

    match source.header(span) {
        Ok(header) => magic.iter().all(|signature| signature.matches(&header)),
        Err(e) => {
            debug!(error = %e, "unable to read source header");
            false
        }
    }
}

fn password_flag(password: Option<&str>) -> OsString {
    format!("-p{}", password.unwrap_or_default()).into()
}

fn output_flag(output_dir: &Path) -> OsString {
    let mut flag = OsString::from("-o");
    flag.push(output_dir);
    flag
}

fn encrypted_args(password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString> {
    vec![
        "x".into(),
        "-mmt=off".into(),
        password_flag(password),
        output_flag(output_dir),
        archive.into(),
    ]
}

fn plain_args(output_dir: &Path, archive: &Path) -> Vec<OsString> {
    vec!["x".into(), output_flag(output_dir), archive.into()]
}

/// Zip archives, including misnamed ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipHandler;

impl Handler for ZipHandler {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn exts(&self) -> &'static [&'static str] {
        &[".zip"]
    }

    fn magic(&self) -> &'static [Signature] {
        const MAGIC: &[Signature] = &[
            Signature::at(0, b"PK\x03\x04"),
            Signature::at(0, b"PK\x05\x06"),
            Signature::at(0, b"PK\x07\x08"),
        ];
        MAGIC
    }

    fn default_password(&self) -> Option<&'static str> {
        Some("infected")
    }

    fn handles(&self, source: &SourceFile) -> bool {
        // Any PK prefix counts, whatever the extension says
        matches_extension(self.exts(), source) || matches_magic(&[Signature::at(0, b"PK")], source)
    }

    fn extract_args(&self, password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString> {
        encrypted_args(password, output_dir, archive)
    }
}

/// 7z archives and the other containers 7z reads natively: ISO, UDF, xz.
#[derive(Debug, Clone, Copy, Default)]
pub struct SevenZipHandler;

impl Handler for SevenZipHandler {
    fn name(&self) -> &'static str {
        "7z"
    }

    fn exts(&self) -> &'static [&'static str] {
        &[".7z", ".iso", ".xz"]
    }

    fn magic(&self) -> &'static [Signature] {
        const MAGIC: &[Signature] = &[
            Signature::at(0, b"7z\xBC\xAF\x27\x1C"),
            Signature::at(0, b"\xFD7zXZ\x00"),
            Signature::at(0x8001, b"CD001"),
            Signature::at(0x8001, b"BEA01"),
        ];
        MAGIC
    }

    fn default_password(&self) -> Option<&'static str> {
        Some("infected")
    }

    fn extract_args(&self, password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString> {
        encrypted_args(password, output_dir, archive)
    }
}

/// Single-member gzip streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipHandler;

impl Handler for GzipHandler {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn exts(&self) -> &'static [&'static str] {
        &[".gzip", ".gz"]
    }

    fn magic(&self) -> &'static [Signature] {
        const MAGIC: &[Signature] = &[Signature::at(0, b"\x1F\x8B")];
        MAGIC
    }

    fn extract_args(&self, _password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString> {
        plain_args(output_dir, archive)
    }
}

/// LHA/LZH archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LzhHandler;

impl Handler for LzhHandler {
    fn name(&self) -> &'static str {
        "lzh"
    }

    fn exts(&self) -> &'static [&'static str] {
        &[".lzh", ".lha"]
    }

    fn magic(&self) -> &'static [Signature] {
        // Method id `-l??-` sits after the header size and checksum bytes
        const MAGIC: &[Signature] = &[Signature::at(2, b"-l"), Signature::at(6, b"-")];
        MAGIC
    }

    fn handles(&self, source: &SourceFile) -> bool {
        // Both halves of the method id must be present
        matches_extension(self.exts(), source) || matches_all_magic(self.magic(), source)
    }

    fn extract_args(&self, _password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString> {
        plain_args(output_dir, archive)
    }
}

/// Virtual hard disk images (VHD and VHDX).
#[derive(Debug, Clone, Copy, Default)]
pub struct VhdHandler;

impl VhdHandler {
    /// Reserved partition names left out of the extraction.
    pub const SYSTEM_PATTERN: &'static str = "[SYSTEM]*";
    const SYSTEM_PREFIX: &'static str = "[SYSTEM]";
}

impl Handler for VhdHandler {
    fn name(&self) -> &'static str {
        "vhd"
    }

    fn exts(&self) -> &'static [&'static str] {
        &[".vhd", ".vhdx"]
    }

    fn magic(&self) -> &'static [Signature] {
        const MAGIC: &[Signature] = &[
            Signature::at(0, b"conectix"),
            Signature::at(0, b"vhdxfile"),
        ];
        MAGIC
    }

    fn temp_suffix(&self) -> &'static str {
        ".vhd"
    }

    fn extract_args(&self, _password: Option<&str>, output_dir: &Path, archive: &Path) -> Vec<OsString> {
        vec![
            "x".into(),
            format!("-xr!{}", Self::SYSTEM_PATTERN).into(),
            output_flag(output_dir),
            archive.into(),
        ]
    }

    fn excludes(&self, relative_path: &Path) -> bool {
        // -xr! matches at any depth, so mirror that here
        relative_path.components().any(|component| match component {
            Component::Normal(part) => part
                .to_str()
                .is_some_and(|name| name.starts_with(Self::SYSTEM_PREFIX)),
            _ => false,
        })
    }
}

static BUILTIN: [&dyn Handler; 5] = [
    &ZipHandler,
    &SevenZipHandler,
    &GzipHandler,
    &LzhHandler,
    &VhdHandler,
];

/// Priority-ordered list of handlers.
///
/// Selection always walks the list front to back, so when several handlers
/// claim a file the earliest one wins.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<&'static dyn Handler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: BUILTIN.to_vec(),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|handler| handler.name()))
            .finish()
    }
}

impl HandlerRegistry {
    /// Registry with a custom priority order.
    pub fn new(handlers: Vec<&'static dyn Handler>) -> Self {
        Self { handlers }
    }

    /// Handlers in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &'static dyn Handler> + '_ {
        self.handlers.iter().copied()
    }

    /// Handler with the given name.
    pub fn get(&self, name: &str) -> Option<&'static dyn Handler> {
        self.iter().find(|handler| handler.name() == name)
    }

    /// First handler claiming `source`, whether or not its tool is installed.
    pub fn identify(&self, source: &SourceFile) -> Option<&'static dyn Handler> {
        self.iter().find(|handler| handler.handles(source))
    }

    /// First handler that claims `source` and can run on this host.
    pub fn select(&self, source: &SourceFile, tools: &Toolchain) -> Option<&'static dyn Handler> {
        self.iter().find(|handler| {
            if !handler.handles(source) {
                return false;
            }
            if !handler.supported(tools) {
                debug!(handler = handler.name(), "handler claims source but its tool is unavailable");
                return false;
            }
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[OsString]) -> Vec<String> {
        values.iter().map(|v| v.to_string_lossy().into_owned()).collect()
    }

    fn iso_image() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x8001];
        bytes.extend_from_slice(b"CD001\x01");
        bytes
    }

    #[test]
    fn test_signature_matches() {
        let signature = Signature::at(2, b"-lh5-");
        assert!(signature.matches(b"\x00\x00-lh5-rest"));
        assert!(!signature.matches(b"-lh5-"));
        // Too short
        assert!(!signature.matches(b"\x00\x00-lh"));
        assert_eq!(signature.span(), 7);
    }

    #[test]
    fn test_zip_handles_by_extension_and_magic() {
        let zip = ZipHandler;
        assert!(zip.handles(&SourceFile::from_bytes(Some("a.zip"), Vec::new())));
        assert!(zip.handles(&SourceFile::from_bytes(None, b"PK\x03\x04data".to_vec())));
        assert!(!zip.handles(&SourceFile::from_bytes(Some("a.txt"), b"hello".to_vec())));
    }

    #[test]
    fn test_zip_handles_misnamed_pk_stream() {
        let source = SourceFile::from_bytes(Some("sample.dat"), b"PK\x01\x02anything".to_vec());
        assert!(ZipHandler.handles(&source));
    }

    #[test]
    fn test_sevenzip_handles_iso_and_xz() {
        let handler = SevenZipHandler;
        assert!(handler.handles(&SourceFile::from_bytes(None, iso_image())));
        assert!(handler.handles(&SourceFile::from_bytes(None, b"\xFD7zXZ\x00\x00".to_vec())));
        assert!(handler.handles(&SourceFile::from_bytes(Some("disk.ISO"), Vec::new())));
    }

    #[test]
    fn test_lzh_and_vhd_magic() {
        assert!(LzhHandler.handles(&SourceFile::from_bytes(None, b"\x22\x5a-lh5-\x00".to_vec())));
        assert!(VhdHandler.handles(&SourceFile::from_bytes(None, b"conectix\x00\x00".to_vec())));
        assert!(GzipHandler.handles(&SourceFile::from_bytes(None, b"\x1F\x8B\x08".to_vec())));
    }

    #[test]
    fn test_lzh_matches_any_method_id() {
        for method in [b"-lh0-", b"-lh2-", b"-lh3-", b"-lh8-", b"-lhd-", b"-lzs-", b"-lz7-"] {
            let mut bytes = b"\x22\x5a".to_vec();
            bytes.extend_from_slice(method);
            bytes.push(0);
            assert!(LzhHandler.handles(&SourceFile::from_bytes(None, bytes)), "{:?}", method);
        }

        // Half a method id is not enough
        assert!(!LzhHandler.handles(&SourceFile::from_bytes(None, b"\x22\x5a-lh5x\x00".to_vec())));
        assert!(!LzhHandler.handles(&SourceFile::from_bytes(None, b"\x22\x5a-x--\x00".to_vec())));
        assert!(!LzhHandler.handles(&SourceFile::from_bytes(None, b"\x22\x5a-l".to_vec())));
    }

    #[test]
    fn test_zip_args_with_password() {
        let values = ZipHandler.extract_args(Some("infected"), Path::new("/out"), Path::new("/in/a.zip"));
        assert_eq!(args(&values), ["x", "-mmt=off", "-pinfected", "-o/out", "/in/a.zip"]);
    }

    #[test]
    fn test_sevenzip_args_without_password() {
        let values = SevenZipHandler.extract_args(None, Path::new("/out"), Path::new("/in/a.7z"));
        assert_eq!(args(&values), ["x", "-mmt=off", "-p", "-o/out", "/in/a.7z"]);
    }

    #[test]
    fn test_plain_args_ignore_password() {
        let values = GzipHandler.extract_args(Some("secret"), Path::new("/out"), Path::new("/in/a.gz"));
        assert_eq!(args(&values), ["x", "-o/out", "/in/a.gz"]);

        let values = LzhHandler.extract_args(None, Path::new("/out"), Path::new("/in/a.lzh"));
        assert_eq!(args(&values), ["x", "-o/out", "/in/a.lzh"]);
    }

    #[test]
    fn test_vhd_args_and_exclusion() {
        let vhd = VhdHandler;
        let values = vhd.extract_args(Some("ignored"), Path::new("/out"), Path::new("/in/a.vhd"));
        assert_eq!(args(&values), ["x", "-xr![SYSTEM]*", "-o/out", "/in/a.vhd"]);

        assert!(vhd.excludes(Path::new("[SYSTEM]/boot.ini")));
        assert!(vhd.excludes(Path::new("[SYSTEM] Reserved/x")));
        assert!(vhd.excludes(Path::new("0/[SYSTEM]/x")));
        assert!(!vhd.excludes(Path::new("0.ntfs/payload.exe")));
        assert!(!ZipHandler.excludes(Path::new("[SYSTEM]/boot.ini")));
    }

    #[test]
    fn test_default_passwords() {
        assert_eq!(ZipHandler.default_password(), Some("infected"));
        assert_eq!(SevenZipHandler.default_password(), Some("infected"));
        assert_eq!(GzipHandler.default_password(), None);
        assert_eq!(VhdHandler.default_password(), None);
    }

    #[test]
    fn test_registry_priority_order() {
        let registry = HandlerRegistry::default();
        let names: Vec<_> = registry.iter().map(|h| h.name()).collect();
        assert_eq!(names, ["zip", "7z", "gzip", "lzh", "vhd"]);

        // An ISO image that also starts with PK is claimed by zip first
        let mut bytes = b"PK".to_vec();
        bytes.extend_from_slice(&iso_image()[2..]);
        let source = SourceFile::from_bytes(Some("disk.iso"), bytes);
        assert_eq!(registry.identify(&source).map(|h| h.name()), Some("zip"));
    }

    #[test]
    fn test_registry_select_skips_unsupported() {
        let registry = HandlerRegistry::default();
        let source = SourceFile::from_bytes(Some("a.zip"), Vec::new());

        let missing = Toolchain::new(None);
        assert!(registry.select(&source, &missing).is_none());
        assert!(registry.identify(&source).is_some());

        let present = Toolchain::new(Some(PathBuf::from("/usr/bin/7z")));
        assert_eq!(registry.select(&source, &present).map(|h| h.name()), Some("zip"));
    }

    #[test]
    fn test_registry_no_match() {
        let registry = HandlerRegistry::default();
        let source = SourceFile::from_bytes(Some("notes.txt"), b"plain text".to_vec());
        assert!(registry.identify(&source).is_none());
        assert!(registry.get("rar").is_none());
        assert_eq!(registry.get("vhd").map(|h| h.name()), Some("vhd"));
    }
}
