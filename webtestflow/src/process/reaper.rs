//! Forceful cleanup of processes owned by a pipeline run.
//!
//! Pattern search is for processes a stage owns only indirectly (spawned by
//! a build tool, PID unknown until after launch); killing by PID is for
//! processes whose PID was captured into the lease store.

use crate::errors::{Result, WebtestflowError};
use crate::process::runner::{run_by_exec, ExecOptions};

/// Kills every process whose command line contains `pattern`.
///
/// The search process itself is excluded. Matching is a case-sensitive
/// substring match against the full process listing.
///
/// # Errors
///
/// [`WebtestflowError::KillFailed`] when nothing matched or the kill
/// command errored. Cleanup callers log this and continue.
pub async fn kill_by_search(pattern: &str) -> Result<()> {
    tracing::info!(pattern, "killing processes by search");

    let command = format!(
        "ps aux | grep \"{pattern}\" | grep -v grep | awk '{{print $2}}' | xargs kill -9"
    );

    match run_by_exec(&command, &ExecOptions::default(), None).await {
        Ok(_) => {
            tracing::info!(pattern, "kill by search succeeded");
            Ok(())
        }
        Err(err) => Err(WebtestflowError::KillFailed {
            target: pattern.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Kills an explicit list of PIDs.
///
/// # Errors
///
/// [`WebtestflowError::KillFailed`] when the kill command errors (including
/// an empty or fully-stale PID list).
pub async fn kill_by_pids(pids: &[u32]) -> Result<()> {
    tracing::info!(?pids, "killing processes by pid");

    let joined = pids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let command = format!("kill -9 {joined}");

    match run_by_exec(&command, &ExecOptions::default(), None).await {
        Ok(_) => {
            tracing::info!(?pids, "kill by pids succeeded");
            Ok(())
        }
        Err(err) => Err(WebtestflowError::KillFailed {
            target: format!("pids {joined}"),
            reason: err.to_string(),
        }),
    }
}

/// Kills whatever currently listens on `port`.
///
/// Used by stage cleanup to free a previously-leased port before (and
/// after) a run.
///
/// # Errors
///
/// [`WebtestflowError::KillFailed`] when nothing listens there or the kill
/// command errors.
pub async fn kill_by_port(port: u16) -> Result<()> {
    tracing::info!(port, "killing process on port");

    let command = format!(
        "lsof -i:{port} | grep {port} | grep -v grep | awk '{{print $2}}' | xargs kill -9"
    );

    match run_by_exec(&command, &ExecOptions::default(), None).await {
        Ok(_) => {
            tracing::info!(port, "kill by port succeeded");
            Ok(())
        }
        Err(err) => Err(WebtestflowError::KillFailed {
            target: format!("port {port}"),
            reason: err.to_string(),
        }),
    }
}
