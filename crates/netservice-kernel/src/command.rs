use std::ffi::OsStr;
use std::path::Path;
use std::process::Output;

use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.display().to_string());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

fn into_result(display: String, output: std::io::Result<Output>) -> Result<String, CommandError> {
    let output = output.map_err(|e| CommandError {
        command: display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Execute a command and wait for it on the async runtime.
///
/// Returns trimmed stdout on success and stderr as the error detail
/// otherwise. Dropping the future kills the child.
pub async fn exec(program: &Path, args: &[String]) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");
    let output = tokio::process::Command::new(program)
        .args(args.iter().map(OsStr::new))
        .kill_on_drop(true)
        .output()
        .await;
    into_result(cmd_display, output)
}

/// Execute a command on the calling OS thread.
///
/// Used from namespace worker threads: the child inherits the network
/// namespace of the thread that forks it, not the one of the process.
pub fn exec_blocking(program: &Path, args: &[String]) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");
    let output = std::process::Command::new(program)
        .args(args.iter().map(OsStr::new))
        .output();
    into_result(cmd_display, output)
}
