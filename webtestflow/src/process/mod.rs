//! Child-process plumbing: the command runner and the process reaper.

pub mod reaper;
pub mod runner;

pub use reaper::{kill_by_pids, kill_by_port, kill_by_search};
pub use runner::{run_by_exec, CommandOutcome, ExecOptions, OutputPredicate};
