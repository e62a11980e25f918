use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Directories searched for bundled tool binaries before falling back to `PATH`.
///
/// Searches these locations in order:
///   1. `<exe_dir>/`
///   2. `<exe_dir>/bin/`
///   3. `<exe_dir>/../bin/`
///   4. `<cwd>/`
///   5. `<cwd>/bin/`
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![
        format!("{binary}.exe"),
        format!("{binary}.cmd"),
        binary.to_string(),
    ]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Resolved location of `binary`, if it is bundled next to the executable.
///
/// Values that already contain a path separator are used as-is.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    find_binary_in_dirs(binary, &candidate_bin_dirs())
}

/// Async command for an external tool, preferring bundled copies over `PATH`.
///
/// The child is killed if the returned command's child handle is dropped.
pub fn command_for(binary: &str) -> Command {
    let mut command = match resolve_binary(binary) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    };
    command.kill_on_drop(true);
    command
}

#[derive(Debug)]
pub enum ToolOutcome {
    Finished(Output),
    Cancelled,
}

/// Runs `command` to completion with piped output, or kills it when `cancel` fires.
pub async fn run_cancellable(
    mut command: Command,
    cancel: &CancellationToken,
) -> io::Result<ToolOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command.spawn()?;

    tokio::select! {
        output = child.wait_with_output() => Ok(ToolOutcome::Finished(output?)),
        // Dropping the wait future drops the child, which kills it.
        _ = cancel.cancelled() => Ok(ToolOutcome::Cancelled),
    }
}

/// Non-empty lines of a tool's stderr, lossily decoded.
pub fn stderr_lines(stderr: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Last few stderr lines, for error messages.
pub fn stderr_tail(stderr: &[u8], max_lines: usize) -> String {
    let lines = stderr_lines(stderr);
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub binary: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Runs `<binary> <version_flag>` and returns the first non-empty output line.
pub async fn check_tool(binary: &str, version_flag: &str) -> ToolStatus {
    let mut command = command_for(binary);
    command
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match tokio::time::timeout(VERSION_CHECK_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) | Err(_) => {
            return ToolStatus {
                binary: binary.to_string(),
                available: false,
                version: None,
            }
        }
    };

    let version = [&output.stdout, &output.stderr]
        .into_iter()
        .flat_map(|bytes| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .next();

    ToolStatus {
        binary: binary.to_string(),
        available: true,
        version,
    }
}

/// `MemAvailable` from `/proc/meminfo`, in MiB. `None` where unsupported.
pub fn available_memory_mb() -> Option<u64> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available_mb(&raw)
}

fn parse_mem_available_mb(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib / 1024)
    })
}

/// Log which external tools were resolved, for diagnostics.
/// Call after tracing is initialized.
pub async fn log_tool_status(ffmpeg: &str, whisper: &str) {
    for status in [
        check_tool(ffmpeg, "-version").await,
        check_tool(whisper, "--help").await,
    ] {
        if status.available {
            info!(
                binary = %status.binary,
                version = status.version.as_deref().unwrap_or("unknown"),
                "External tool available"
            );
        } else {
            warn!(binary = %status.binary, "External tool not found; jobs needing it will fail");
        }
    }
}
