//! Shell command tasks for the `run` subcommand.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use std::time::Instant;

/// What a worker reports back about one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

/// Run `command` through `sh -c`, capturing its output.
///
/// A non-zero exit becomes an error whose message carries the last line of
/// the command's stderr.
pub fn run_shell(command: &str) -> anyhow::Result<CommandReport> {
    let start = Instant::now();
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to start `{}`", command))?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let Some(exit_code) = output.status.code() else {
        bail!("`{}` was killed by a signal", command);
    };
    if exit_code != 0 {
        match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => bail!("`{}` exited with code {}: {}", command, exit_code, last.trim()),
            None => bail!("`{}` exited with code {}", command, exit_code),
        }
    }

    Ok(CommandReport {
        command: command.to_string(),
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}
