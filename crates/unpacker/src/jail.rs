//! Jailed execution of the extraction tool.
//!
//! [`Jail`] is the security boundary of the crate. The dispatcher hands it a
//! fresh output directory and a tool invocation and trusts the result: a
//! successful run means nothing was written outside the directory and the
//! quota held.
//!
//! [`ZipJail`] delegates OS-level confinement (syscall filtering, no network,
//! no writes outside the directory) to an external `zipjail` wrapper and
//! supervises the child itself for wall-clock time, output quota and escaping
//! links. Without the wrapper it refuses to run unless
//! [`JailConfig::require_wrapper`] was switched off; the supervisor alone
//! cannot see direct writes outside the directory.

use crate::error::JailViolation;
use crate::safety::{check_quota, symlink_escapes, EntryType, OutputUsage};
use crate::types::{JailConfig, JailLimits};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Diagnostics the confinement wrapper prints when it stops the tool.
const WRAPPER_DIAGNOSTICS: &[(&str, WrapperDiagnostic)] = &[
    (
        "Excessive writing caused incomplete unpacking!",
        WrapperDiagnostic::Quota,
    ),
    (
        "Detected potential out-of-directory write",
        WrapperDiagnostic::Escape,
    ),
    (
        "Blocked system call occurred during sandboxing!",
        WrapperDiagnostic::Syscall,
    ),
];

/// Keep at most this much of the tool's stderr.
const STDERR_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum WrapperDiagnostic {
    Quota,
    Escape,
    Syscall,
}

/// Program and arguments for one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Tool binary
    pub program: PathBuf,
    /// Verb, flags and archive path
    pub args: Vec<OsString>,
}

/// How a jailed run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JailStatus {
    /// The tool exited successfully within every constraint.
    Completed,
    /// A constraint was violated; the output is untrusted.
    Rejected(JailViolation),
    /// The tool failed on its own (wrong password, corrupt archive, missing binary).
    ToolFailed {
        /// Exit code, if the process ran at all
        exit_code: Option<i32>,
        /// Last diagnostic line
        message: String,
    },
}

/// Result of [`Jail::run`].
///
/// When [`JailResult::success`] is false, nothing in `output_dir` may be
/// used and the caller still has to remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailResult {
    /// Directory the tool was confined to
    pub output_dir: PathBuf,
    /// Outcome of the run
    pub status: JailStatus,
}

impl JailResult {
    /// Whether the tool completed within every constraint.
    pub fn success(&self) -> bool {
        matches!(self.status, JailStatus::Completed)
    }
}

/// Runs an extraction tool confined to one output directory.
///
/// Implementations never fail: misbehaving archives, timeouts and tool
/// errors all come back as a [`JailResult`].
pub trait Jail: Send + Sync {
    /// Runs `invocation` so that it can only write below `output_dir`.
    fn run(&self, archive: &Path, output_dir: &Path, invocation: &ToolInvocation) -> JailResult;
}

/// Subprocess jail built on the `zipjail` confinement wrapper.
///
/// Must not be called from inside an async runtime; it drives its own.
#[derive(Debug, Clone)]
pub struct ZipJail {
    config: JailConfig,
    wrapper: Option<PathBuf>,
}

impl ZipJail {
    /// Creates a jail, locating the wrapper on `PATH` unless configured.
    pub fn new(config: JailConfig) -> Self {
        let wrapper = config
            .wrapper
            .clone()
            .or_else(|| which::which("zipjail").ok());

        match (&wrapper, config.require_wrapper) {
            (Some(_), _) => {}
            (None, true) => warn!("no zipjail wrapper found; extraction tools will not be run"),
            (None, false) => warn!("no zipjail wrapper found; extraction tools run unconfined"),
        }

        Self { config, wrapper }
    }

    /// Confinement wrapper in use, if any.
    pub fn wrapper(&self) -> Option<&Path> {
        self.wrapper.as_deref()
    }

    /// Active configuration.
    pub fn config(&self) -> &JailConfig {
        &self.config
    }

    fn command(&self, archive: &Path, output_dir: &Path, invocation: &ToolInvocation) -> Command {
        let mut command = match &self.wrapper {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command
                    .arg(archive)
                    .arg(output_dir)
                    .arg("--")
                    .arg(&invocation.program);
                command
            }
            None => Command::new(&invocation.program),
        };

        command
            .args(&invocation.args)
            .current_dir(output_dir)
            .env_clear()
            .env("PATH", &self.config.path)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn supervise(&self, mut command: Command, output_dir: &Path) -> JailStatus {
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return JailStatus::ToolFailed {
                    exit_code: None,
                    message: format!("failed to start tool: {}", e),
                }
            }
        };

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_capped(stderr)));

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit: Result<std::io::Result<ExitStatus>, JailViolation> = loop {
            tokio::select! {
                status = child.wait() => break Ok(status),
                _ = &mut deadline => break Err(JailViolation::Timeout(self.config.timeout)),
                _ = ticker.tick() => {
                    if let Err(violation) = scan_output(output_dir, &self.config.limits) {
                        break Err(violation);
                    }
                }
            }
        };

        let status = match exit {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stop(&mut child, stderr_task).await;
                return JailStatus::ToolFailed {
                    exit_code: None,
                    message: format!("failed to wait for tool: {}", e),
                };
            }
            Err(violation) => {
                stop(&mut child, stderr_task).await;
                return JailStatus::Rejected(violation);
            }
        };

        let stderr = collect_stderr(stderr_task).await;

        if let Some(violation) = wrapper_violation(&stderr) {
            return JailStatus::Rejected(violation);
        }

        if !status.success() {
            return JailStatus::ToolFailed {
                exit_code: status.code(),
                message: last_line(&stderr),
            };
        }

        match scan_output(output_dir, &self.config.limits) {
            Ok(usage) => {
                debug!(files = usage.files, bytes = usage.bytes, "tool output within limits");
                JailStatus::Completed
            }
            Err(violation) => JailStatus::Rejected(violation),
        }
    }
}

impl Jail for ZipJail {
    fn run(&self, archive: &Path, output_dir: &Path, invocation: &ToolInvocation) -> JailResult {
        let result = |status| JailResult {
            output_dir: output_dir.to_path_buf(),
            status,
        };

        if self.wrapper.is_none() && self.config.require_wrapper {
            return result(JailStatus::ToolFailed {
                exit_code: None,
                message: "zipjail wrapper not available; refusing to run the tool unconfined"
                    .to_string(),
            });
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                return result(JailStatus::ToolFailed {
                    exit_code: None,
                    message: format!("failed to start supervisor: {}", e),
                })
            }
        };

        debug!(
            program = %invocation.program.display(),
            wrapper = ?self.wrapper,
            ?output_dir,
            timeout_secs = self.config.timeout.as_secs(),
            "running jailed tool"
        );

        let command = self.command(archive, output_dir, invocation);
        result(runtime.block_on(self.supervise(command, output_dir)))
    }
}

/// Measures the output tree and checks it against `limits`.
///
/// Symlinks are never followed; one that resolves outside `output_dir`, or
/// whose target cannot be read, counts as an escape attempt. So does a
/// regular file with several hard links. Scanning stops as soon as the quota
/// trips.
pub fn scan_output(output_dir: &Path, limits: &JailLimits) -> Result<OutputUsage, JailViolation> {
    let mut usage = OutputUsage::default();

    for entry in WalkDir::new(output_dir).min_depth(1).follow_links(false) {
        // Entries can vanish while the tool is still running
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable output entry");
                continue;
            }
        };

        match EntryType::from(entry.file_type()) {
            EntryType::File => {
                let metadata = entry.metadata().ok();
                if let Some(metadata) = &metadata {
                    if shares_inode(metadata) {
                        return Err(JailViolation::PathEscape(format!(
                            "hard link {}",
                            entry.path().display()
                        )));
                    }
                }
                usage.files += 1;
                usage.bytes += metadata.map(|m| m.len()).unwrap_or(0);
                check_quota(usage, limits)?;
            }
            EntryType::Symlink => {
                let relative = entry.path().strip_prefix(output_dir).unwrap_or(entry.path());
                if let Some(violation) = symlink_violation(relative, std::fs::read_link(entry.path())) {
                    return Err(violation);
                }
            }
            EntryType::Directory | EntryType::Other => {}
        }
    }

    Ok(usage)
}

fn symlink_violation(relative: &Path, target: std::io::Result<PathBuf>) -> Option<JailViolation> {
    match target {
        Ok(target) if symlink_escapes(relative, &target) => Some(JailViolation::PathEscape(format!(
            "symlink {} -> {}",
            relative.display(),
            target.display()
        ))),
        Ok(_) => None,
        // Removed by the tool since the directory was listed
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some(JailViolation::PathEscape(format!(
            "unreadable symlink {}: {}",
            relative.display(),
            e
        ))),
    }
}

/// A regular file with more than one link may alias a file outside the tree.
#[cfg(unix)]
fn shares_inode(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    metadata.nlink() > 1
}

#[cfg(not(unix))]
fn shares_inode(_metadata: &std::fs::Metadata) -> bool {
    false
}

fn wrapper_violation(stderr: &str) -> Option<JailViolation> {
    WRAPPER_DIAGNOSTICS
        .iter()
        .find(|(marker, _)| stderr.contains(marker))
        .map(|(marker, kind)| match kind {
            WrapperDiagnostic::Quota => JailViolation::QuotaExceeded { files: 0, bytes: 0 },
            WrapperDiagnostic::Escape => JailViolation::PathEscape(marker.to_string()),
            WrapperDiagnostic::Syscall => JailViolation::BlockedSyscall,
        })
}

fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("tool exited unsuccessfully")
        .to_string()
}

async fn read_capped(mut stderr: ChildStderr) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAP.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

async fn collect_stderr(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    // A grandchild may still hold the pipe open
    match tokio::time::timeout(Duration::from_secs(1), task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

async fn stop(child: &mut tokio::process::Child, stderr_task: Option<JoinHandle<Vec<u8>>>) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill jailed tool");
    }
    if let Some(task) = stderr_task {
        task.abort();
    }
}
