//! Supervisor behavior of `ZipJail`, exercised with shell scripts standing in
//! for the extraction tool.
#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use unpacker::{
    Jail, JailConfig, JailLimits, JailStatus, JailViolation, ToolInvocation, ZipJail,
};

fn shell(script: &str) -> ToolInvocation {
    ToolInvocation {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), script.into()],
    }
}

/// Development settings: no wrapper required, supervisor checks only.
fn unconfined() -> JailConfig {
    JailConfig {
        require_wrapper: false,
        ..JailConfig::default()
    }
}

/// A jail without the confinement wrapper, or `None` when one is installed
/// (the wrapper would refuse to run a shell).
fn jail(config: JailConfig) -> Option<ZipJail> {
    let jail = ZipJail::new(config);
    if jail.wrapper().is_some() {
        eprintln!("zipjail installed, skipping supervisor test");
        return None;
    }
    Some(jail)
}

fn run(jail: &ZipJail, script: &str) -> (TempDir, JailStatus) {
    let output_dir = TempDir::new().unwrap();
    let archive = output_dir.path().join("unused.zip");
    let result = jail.run(&archive, output_dir.path(), &shell(script));
    assert_eq!(result.output_dir, output_dir.path());
    (output_dir, result.status)
}

#[test]
fn test_successful_run() {
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    // The tool runs inside the output directory
    let (output_dir, status) = run(&jail, "echo hello > out.txt");

    assert_eq!(status, JailStatus::Completed);
    assert_eq!(fs::read(output_dir.path().join("out.txt")).unwrap(), b"hello\n");
}

#[test]
fn test_environment_is_cleared() {
    std::env::set_var("UNPACKER_TEST_SECRET", "leak");
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    let (output_dir, status) = run(&jail, "env > env.txt");

    assert_eq!(status, JailStatus::Completed);
    let env = fs::read_to_string(output_dir.path().join("env.txt")).unwrap();
    assert!(!env.contains("UNPACKER_TEST_SECRET"));
    assert!(env.contains("LC_ALL=C"));
}

#[test]
fn test_nonzero_exit_is_tool_failure() {
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    let (_output_dir, status) = run(&jail, "echo 'ERROR: Wrong password' >&2; exit 2");

    assert_eq!(
        status,
        JailStatus::ToolFailed {
            exit_code: Some(2),
            message: "ERROR: Wrong password".to_string(),
        }
    );
}

#[test]
fn test_missing_program_is_tool_failure() {
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    let output_dir = TempDir::new().unwrap();
    let invocation = ToolInvocation {
        program: PathBuf::from("/nonexistent/7z"),
        args: Vec::new(),
    };
    let result = jail.run(&output_dir.path().join("a.zip"), output_dir.path(), &invocation);

    assert!(matches!(
        result.status,
        JailStatus::ToolFailed { exit_code: None, .. }
    ));
}

#[test]
fn test_timeout_kills_tool() {
    let config = JailConfig {
        timeout: Duration::from_secs(1),
        ..unconfined()
    };
    let Some(jail) = jail(config) else {
        return;
    };

    let started = Instant::now();
    let (_output_dir, status) = run(&jail, "exec sleep 30");

    assert_eq!(
        status,
        JailStatus::Rejected(JailViolation::Timeout(Duration::from_secs(1)))
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_quota_stops_tool() {
    let config = JailConfig {
        limits: JailLimits {
            max_total_bytes: Some(1024),
            max_files: None,
        },
        ..unconfined()
    };
    let Some(jail) = jail(config) else {
        return;
    };

    let (_output_dir, status) = run(&jail, "head -c 4096 /dev/zero > bomb.bin");

    assert!(matches!(
        status,
        JailStatus::Rejected(JailViolation::QuotaExceeded { .. })
    ));
}

#[test]
fn test_file_count_quota() {
    let config = JailConfig {
        limits: JailLimits {
            max_total_bytes: None,
            max_files: Some(3),
        },
        ..unconfined()
    };
    let Some(jail) = jail(config) else {
        return;
    };

    let (_output_dir, status) = run(&jail, "for i in 1 2 3 4 5; do : > f$i; done");

    assert!(matches!(
        status,
        JailStatus::Rejected(JailViolation::QuotaExceeded { files: 4, .. })
    ));
}

#[test]
fn test_escaping_symlink_is_rejected() {
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    let (_output_dir, status) = run(&jail, "ln -s /etc escape");

    assert!(matches!(
        status,
        JailStatus::Rejected(JailViolation::PathEscape(_))
    ));
}

#[test]
fn test_wrapper_diagnostic_overrides_exit_code() {
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    let (_output_dir, status) = run(
        &jail,
        "echo 'Blocked system call occurred during sandboxing!' >&2; exit 1",
    );

    assert_eq!(status, JailStatus::Rejected(JailViolation::BlockedSyscall));
}

#[test]
fn test_default_config_refuses_to_run_without_wrapper() {
    let Some(jail) = jail(JailConfig::default()) else {
        return;
    };

    // The output directory sits inside a scratch directory we can inspect
    let scratch = TempDir::new().unwrap();
    let output_dir = scratch.path().join("out");
    fs::create_dir(&output_dir).unwrap();

    let result = jail.run(
        &output_dir.join("unused.zip"),
        &output_dir,
        &shell("echo pwned > ../evil; echo ran > ran.txt"),
    );

    assert!(matches!(
        result.status,
        JailStatus::ToolFailed { exit_code: None, .. }
    ));
    assert!(!result.success());
    assert!(!scratch.path().join("evil").exists());
    assert!(!output_dir.join("ran.txt").exists());
}

#[test]
fn test_hard_link_out_of_directory_is_rejected() {
    let Some(jail) = jail(unconfined()) else {
        return;
    };

    let scratch = TempDir::new().unwrap();
    fs::write(scratch.path().join("secret"), b"host file").unwrap();
    let output_dir = scratch.path().join("out");
    fs::create_dir(&output_dir).unwrap();

    let result = jail.run(
        &output_dir.join("unused.zip"),
        &output_dir,
        &shell("ln ../secret alias"),
    );

    assert!(matches!(
        result.status,
        JailStatus::Rejected(JailViolation::PathEscape(_))
    ));
}
