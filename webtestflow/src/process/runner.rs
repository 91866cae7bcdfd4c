//! Shell command execution with streamed output and two completion modes.
//!
//! Short-lived tools (installs, builds, test runs) complete when the
//! process exits. Long-lived daemons (dev servers, proxies) never exit once
//! ready, so callers pass a predicate over the streamed output; the first
//! matching chunk resolves the call while the process keeps running, and
//! the returned PID is the caller's handle for later reaping.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::{Result, WebtestflowError};

/// Predicate over a streamed output chunk; returning `true` completes a
/// predicate-based run.
pub type OutputPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Options for a command invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub envs: Vec<(String, String)>,
}

impl ExecOptions {
    /// Options with only a working directory set.
    #[must_use]
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            envs: Vec::new(),
        }
    }
}

/// What a completed (or adopted) command left behind.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// PID of the child, when the OS reported one.
    pub pid: Option<u32>,
    /// Combined stdout/stderr captured up to completion.
    pub output: String,
}

/// Runs `command` through `sh -c`, relaying its combined output to the log.
///
/// With `completion` set, the call resolves as soon as a streamed chunk
/// satisfies the predicate, leaving the child running; its remaining output
/// keeps draining in the background so the pipes never fill. Without it,
/// the call awaits process exit and a non-zero status is an error.
///
/// # Errors
///
/// [`WebtestflowError::Spawn`] when the shell cannot be started, and
/// [`WebtestflowError::CommandFailed`] on a non-zero exit in exit-based
/// mode.
pub async fn run_by_exec(
    command: &str,
    options: &ExecOptions,
    completion: Option<OutputPredicate>,
) -> Result<CommandOutcome> {
    tracing::info!(command, cwd = ?options.cwd, "running command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &options.envs {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| WebtestflowError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let pid = child.id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if let Some(stdout) = child.stdout.take() {
        spawn_line_relay(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_relay(stderr, tx.clone());
    }
    drop(tx);

    let mut output = String::new();

    while let Some(line) = rx.recv().await {
        tracing::info!(target: "webtestflow::child", pid, "{line}");
        output.push_str(&line);
        output.push('\n');

        if let Some(predicate) = &completion {
            if predicate(&line) {
                tracing::info!(command, pid, "completion predicate matched, leaving process running");

                // Reap the child whenever it eventually exits.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });

                return Ok(CommandOutcome { pid, output });
            }
        }
    }

    let status = child.wait().await.map_err(WebtestflowError::Io)?;

    if status.success() {
        Ok(CommandOutcome { pid, output })
    } else {
        Err(WebtestflowError::CommandFailed {
            command: command.to_string(),
            status: status.code(),
        })
    }
}

/// Forwards each line of `reader` into the merged output channel. Draining
/// continues even after the receiver is gone so an adopted daemon cannot
/// block on a full pipe.
fn spawn_line_relay<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx.send(line);
        }
    });
}
