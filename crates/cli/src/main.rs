//! Command-line interface for jailed archive extraction.
//!
//! This CLI tool unpacks samples through the `unpacker` library, prints what
//! came out and can copy the extracted files to a directory for inspection.

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use unpacker::{
    DuplicateSet, HandlerRegistry, SourceFile, Toolchain, UnpackConfig, UnpackError,
    UnpackOutcome, UnpackStatus, Unpacker,
};

#[derive(Parser)]
#[command(name = "unpack")]
#[command(version, about = "Unpack untrusted archives inside a jail", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unpack one or more archives
    Extract(ExtractArgs),

    /// Report which handler would claim a file
    Identify {
        /// File to identify
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct ExtractArgs {
    /// Archive files to unpack
    #[arg(required = true)]
    archives: Vec<PathBuf>,

    /// Password for encrypted archives ("infected" is tried for zip and 7z)
    #[arg(short, long)]
    password: Option<String>,

    /// Descend into nested archives
    #[arg(short, long)]
    recursive: bool,

    /// Copy extracted files into this directory
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wall-clock limit per tool run, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Output quota in bytes
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Output quota in files
    #[arg(long)]
    max_files: Option<u64>,

    /// Nesting levels followed with --recursive
    #[arg(long)]
    max_depth: Option<usize>,

    /// Path to the zipjail wrapper
    #[arg(long)]
    zipjail: Option<PathBuf>,

    /// Run the tool without zipjail when it is missing (development only;
    /// writes outside the output directory are not prevented)
    #[arg(long)]
    allow_unconfined: bool,

    /// Path to the 7z binary
    #[arg(long)]
    sevenzip: Option<PathBuf>,

    /// Also list and copy entries whose content was already seen
    #[arg(long)]
    include_duplicates: bool,
}

impl ExtractArgs {
    /// Configuration file (or defaults) with command-line overrides applied.
    fn config(&self) -> Result<UnpackConfig, UnpackError> {
        let mut config = match &self.config {
            Some(path) => UnpackConfig::from_json_file(path)?,
            None => UnpackConfig::default(),
        };

        if let Some(secs) = self.timeout {
            config.jail.timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = self.max_bytes {
            config.jail.limits.max_total_bytes = Some(bytes);
        }
        if let Some(files) = self.max_files {
            config.jail.limits.max_files = Some(files);
        }
        if let Some(depth) = self.max_depth {
            config.max_depth = depth;
        }
        if let Some(wrapper) = &self.zipjail {
            config.jail.wrapper = Some(wrapper.clone());
        }
        if self.allow_unconfined {
            config.jail.require_wrapper = false;
        }
        if let Some(sevenzip) = &self.sevenzip {
            config.sevenzip = Some(sevenzip.clone());
        }

        Ok(config)
    }
}

#[derive(Serialize)]
struct ArchiveReport<'a> {
    archive: &'a Path,
    #[serde(flatten)]
    outcome: &'a UnpackOutcome,
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Extract(args) => handle_extract(args),
        Commands::Identify { file, json } => handle_identify(file, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn handle_extract(args: ExtractArgs) -> Result<(), Box<dyn std::error::Error>> {
    let unpacker = Unpacker::with_zipjail(args.config()?);

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    // One session: identical payloads across all archives count once
    let mut duplicates = DuplicateSet::new();
    let mut reports = Vec::new();

    for archive in &args.archives {
        if interrupted.load(Ordering::SeqCst) {
            warn!("interrupted, skipping remaining archives");
            break;
        }

        let spinner = spinner(archive);
        let source = SourceFile::from_path(archive);
        let result = if args.recursive {
            unpacker.unpack_recursive(&source, args.password.as_deref(), Some(&mut duplicates))
        } else {
            unpacker.unpack(&source, args.password.as_deref(), Some(&mut duplicates))
        };
        spinner.finish_and_clear();
        let outcome = result?;

        if let Some(out) = &args.out {
            let dest = out.join(contents_dir(archive));
            let copied = copy_entries(&outcome, &dest, args.include_duplicates)?;
            info!(?archive, ?dest, copied, "copied extracted files");
        }

        if args.json {
            reports.push((archive, outcome));
        } else {
            print_outcome(archive, &outcome, args.include_duplicates);
        }
    }

    if args.json {
        let reports: Vec<_> = reports
            .iter()
            .map(|(archive, outcome)| ArchiveReport {
                archive: archive.as_path(),
                outcome,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    Ok(())
}

fn handle_identify(file: PathBuf, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !file.exists() {
        return Err(UnpackError::NotFound(file).into());
    }

    let source = SourceFile::from_path(&file);
    let handler = HandlerRegistry::default().identify(&source);
    let supported = handler.is_some_and(|h| h.supported(&Toolchain::discover(None)));

    if json {
        let report = serde_json::json!({
            "file": file,
            "handler": handler.map(|h| h.name()),
            "supported": supported,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match handler {
            Some(h) if supported => println!("{}: {}", file.display(), h.name()),
            Some(h) => println!("{}: {} (tool not installed)", file.display(), h.name()),
            None => println!("{}: unknown", file.display()),
        }
    }

    Ok(())
}

fn spinner(archive: &Path) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("unpacking {}", archive.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn print_outcome(archive: &Path, outcome: &UnpackOutcome, include_duplicates: bool) {
    match &outcome.status {
        UnpackStatus::Extracted { handler } => println!(
            "{}: {} entries ({})",
            archive.display(),
            outcome.entries.len(),
            handler
        ),
        UnpackStatus::NoHandler => println!("{}: not a supported archive", archive.display()),
        UnpackStatus::Rejected { handler, violation } => {
            println!("{}: rejected ({}): {}", archive.display(), handler, violation)
        }
        UnpackStatus::ToolFailed {
            handler, message, ..
        } => println!("{}: failed ({}): {}", archive.display(), handler, message),
        UnpackStatus::HarvestFailed { handler, message } => println!(
            "{}: output unreadable ({}): {}",
            archive.display(),
            handler,
            message
        ),
    }

    outcome.walk(&mut |depth, entry| {
        if entry.is_duplicate && !include_duplicates {
            return;
        }
        let mut notes = String::new();
        if let Some(format) = &entry.nested_format {
            notes.push_str(&format!(" [{}]", format));
        }
        if entry.is_duplicate {
            notes.push_str(" (duplicate)");
        }
        println!(
            "  {:indent$}{} {:>10} {}{}",
            "",
            entry.sha256,
            entry.size,
            entry.relative_path.display(),
            notes,
            indent = depth * 2
        );
    });
}

/// Directory name holding what came out of `archive`, e.g. `sample.zip.contents`.
fn contents_dir(archive: &Path) -> OsString {
    let mut name = archive
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("archive"));
    name.push(".contents");
    name
}

/// Copies entries below `dest`, nested results into `<entry>.contents`.
fn copy_entries(
    outcome: &UnpackOutcome,
    dest: &Path,
    include_duplicates: bool,
) -> std::io::Result<usize> {
    let mut copied = 0;

    for entry in &outcome.entries {
        let target = dest.join(&entry.relative_path);
        if !entry.is_duplicate || include_duplicates {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&entry.path, &target)?;
            copied += 1;
        }

        if let Some(children) = &entry.children {
            copied += copy_entries(children, &target.with_file_name(contents_dir(&target)), include_duplicates)?;
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extract_args(argv: &[&str]) -> ExtractArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Extract(args) => args,
            _ => panic!("expected extract"),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = extract_args(&[
            "unpack",
            "extract",
            "a.zip",
            "--timeout",
            "5",
            "--max-bytes",
            "1024",
            "--max-depth",
            "1",
            "--sevenzip",
            "/opt/7zz",
        ]);
        let config = args.config().unwrap();

        assert_eq!(config.jail.timeout, Duration::from_secs(5));
        assert_eq!(config.jail.limits.max_total_bytes, Some(1024));
        assert_eq!(config.jail.limits.max_files, Some(10_000));
        assert_eq!(config.max_depth, 1);
        assert_eq!(config.sevenzip, Some(PathBuf::from("/opt/7zz")));
        // Fails closed unless asked otherwise
        assert!(config.jail.require_wrapper);
    }

    #[test]
    fn test_allow_unconfined_flag() {
        let args = extract_args(&["unpack", "extract", "a.zip", "--allow-unconfined"]);
        assert!(!args.config().unwrap().jail.require_wrapper);
    }

    #[test]
    fn test_flags_override_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unpack.json");
        fs::write(
            &path,
            r#"{"max_depth": 2, "jail": {"timeout": 30, "require_wrapper": false}}"#,
        )
        .unwrap();

        let args = extract_args(&[
            "unpack",
            "extract",
            "a.zip",
            "--config",
            path.to_str().unwrap(),
            "--timeout",
            "7",
        ]);
        let config = args.config().unwrap();

        assert_eq!(config.max_depth, 2);
        assert_eq!(config.jail.timeout, Duration::from_secs(7));
        assert!(!config.jail.require_wrapper);
    }

    #[test]
    fn test_extract_requires_archives() {
        assert!(Cli::try_parse_from(["unpack", "extract"]).is_err());
    }

    #[test]
    fn test_contents_dir() {
        assert_eq!(contents_dir(Path::new("/samples/a.zip")), "a.zip.contents");
        assert_eq!(contents_dir(Path::new("/")), "archive.contents");
    }
}
