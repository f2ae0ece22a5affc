// src/exec/command.rs

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Result, TaskError};
use crate::exec::output::{CmdSink, StreamKind};

/// How long a cancelled command may keep running before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to launch one shell command.
#[derive(Debug)]
pub struct ShellJob<'a> {
    pub script: &'a str,
    pub dir: &'a Path,
    /// Environment overrides layered on top of the inherited process env.
    pub env: &'a BTreeMap<String, String>,
    /// `set -o` option names prefixed into the script.
    pub set: &'a [String],
    /// `shopt -s` option names prefixed into the script.
    pub shopt: &'a [String],
}

impl<'a> ShellJob<'a> {
    /// Final script text including `set`/`shopt` preludes.
    fn script_text(&self) -> String {
        let mut parts = Vec::new();
        for opt in self.set {
            parts.push(format!("set -o {opt}"));
        }
        for opt in self.shopt {
            parts.push(format!("shopt -s {opt}"));
        }
        parts.push(self.script.to_string());
        parts.join("\n")
    }

    /// Build the platform shell invocation for this job.
    fn command(&self) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(self.script);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(self.script_text());
            c
        };
        cmd.current_dir(self.dir);
        cmd.envs(self.env);
        cmd
    }
}

/// Run a shell command, streaming its output into `sink` line by line, and
/// return the exit code.
///
/// On cancellation the child gets a grace period to exit on its own (an
/// interactive run's children already receive the terminal's interrupt) and
/// is then killed; the call reports `TaskError::Cancelled`.
pub async fn run_script(
    job: ShellJob<'_>,
    sink: &mut CmdSink,
    cancel: &CancellationToken,
) -> Result<i32> {
    debug!(script = %job.script, dir = ?job.dir, "starting shell command");

    let mut cmd = job.command();
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning shell for {:?}", job.script))
        .map_err(TaskError::Internal)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut err_lines = stderr.map(|s| BufReader::new(s).lines());
    let mut out_done = out_lines.is_none();
    let mut err_done = err_lines.is_none();

    let mut cancelled = false;
    let mut killed = false;
    let far_future = tokio::time::Instant::now() + Duration::from_secs(60 * 60 * 24);
    let mut kill_at = far_future;

    while !(out_done && err_done) {
        tokio::select! {
            line = async { out_lines.as_mut().expect("checked").next_line().await }, if !out_done => {
                match line.map_err(anyhow::Error::from).map_err(TaskError::Internal)? {
                    Some(l) => sink.line(StreamKind::Stdout, &l),
                    None => out_done = true,
                }
            }
            line = async { err_lines.as_mut().expect("checked").next_line().await }, if !err_done => {
                match line.map_err(anyhow::Error::from).map_err(TaskError::Internal)? {
                    Some(l) => sink.line(StreamKind::Stderr, &l),
                    None => err_done = true,
                }
            }
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                kill_at = tokio::time::Instant::now() + KILL_GRACE;
                debug!(script = %job.script, "cancellation requested; grace period started");
            }
            _ = tokio::time::sleep_until(kill_at), if cancelled && !killed => {
                killed = true;
                warn!(script = %job.script, "grace period expired; killing command");
                let _ = child.start_kill();
            }
        }
    }

    let status = if cancelled && !killed {
        // Output is drained; still bound the wait.
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    } else {
        child.wait().await
    }
    .context("waiting for shell command")
    .map_err(TaskError::Internal)?;

    if cancelled {
        return Err(TaskError::Cancelled);
    }

    Ok(status.code().unwrap_or(-1))
}

/// Run a script and capture its stdout, for dynamic (`sh:`) variables.
/// Returns (stdout, exit code); stderr is discarded.
pub async fn capture_script(
    script: &str,
    dir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(String, i32)> {
    let job = ShellJob {
        script,
        dir,
        env,
        set: &[],
        shopt: &[],
    };
    let mut cmd = job.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .with_context(|| format!("capturing output of {script:?}"))
        .map_err(TaskError::Internal)?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok((stdout, output.status.code().unwrap_or(-1)))
}

/// Run a script silently and report whether it exited zero, for `status:`
/// scripts and preconditions.
pub async fn script_succeeds(
    script: &str,
    dir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<bool> {
    let job = ShellJob {
        script,
        dir,
        env,
        set: &[],
        shopt: &[],
    };
    let mut cmd = job.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = cmd
        .status()
        .await
        .with_context(|| format!("running check {script:?}"))
        .map_err(TaskError::Internal)?;

    Ok(status.success())
}
