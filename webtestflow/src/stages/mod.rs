//! Stage contract and the built-in stage variants.
//!
//! Stages are the polymorphic units of pipeline work. Every variant moves
//! through the same four phases under engine control: `init` resolves
//! context-dependent configuration, `before_run` clears residue left by a
//! prior crashed run, `run` performs the stage's actual effect, and
//! `after_run` tears down what `run` started. The engine consults
//! `should_run` before `run` only; the other phases always execute.

pub mod archive;
pub mod custom;
pub mod e2e_test;
pub mod exit;
pub mod lease_clean;
pub mod mock_server;
pub mod project;
pub mod proxy;

pub use archive::ArchiveStage;
pub use custom::CustomStage;
pub use e2e_test::E2eTestStage;
pub use exit::ExitStage;
pub use lease_clean::LeaseCleanStage;
pub use mock_server::MockServerStage;
pub use project::ProjectStage;
pub use proxy::{ProxyRules, ProxyStage};
pub use unit_test::UnitTestStage;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;

use crate::context::RunContext;
use crate::errors::Result;

/// A pipeline stage.
///
/// Implementations hold their configuration plus transient handles
/// (resolved paths, leased port, spawned-process PID) behind interior
/// mutability; the engine and other stages only ever see `&self`. A stage
/// instance is never run concurrently with itself.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// The stage name, used as its registry key and lease namespace.
    fn name(&self) -> &str;

    /// Resolves configuration that depends on the run context (absolute
    /// paths, the process-namespacing key). Called exactly once.
    async fn init(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Pre-execution cleanup. Runs even for stages that will be skipped:
    /// a prior run's residue is independent of this run's skip decision.
    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// The stage's actual effect.
    async fn run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Symmetric teardown of whatever `run` started.
    async fn after_run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Whether `run` should execute. Evaluated by the engine before `run`
    /// only.
    fn should_run(&self, ctx: &RunContext) -> bool {
        let _ = ctx;
        true
    }
}

/// A stage's skip decision: a static flag or a function of the run
/// context. `should_run` is the inversion of the predicate.
#[derive(Clone)]
pub enum SkipPredicate {
    /// Skip unconditionally (`true`) or never (`false`).
    Flag(bool),
    /// Skip when the function returns `true` for this run.
    Func(Arc<dyn Fn(&RunContext) -> bool + Send + Sync>),
}

impl Default for SkipPredicate {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl Debug for SkipPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag(flag) => f.debug_tuple("Flag").field(flag).finish(),
            Self::Func(_) => f.debug_tuple("Func").finish(),
        }
    }
}

impl From<bool> for SkipPredicate {
    fn from(flag: bool) -> Self {
        Self::Flag(flag)
    }
}

impl SkipPredicate {
    /// Builds a context-dependent predicate.
    pub fn func(f: impl Fn(&RunContext) -> bool + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }

    /// Evaluates the raw skip decision.
    #[must_use]
    pub fn should_skip(&self, ctx: &RunContext) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Func(f) => f(ctx),
        }
    }

    /// The inverted decision the engine consumes.
    #[must_use]
    pub fn should_run(&self, ctx: &RunContext) -> bool {
        !self.should_skip(ctx)
    }
}

/// A shell command configured either as a literal string or computed from
/// the run context at the point of use.
///
/// Computed variants may read any previously-exported context parameter,
/// which is how inter-stage data dependencies (a test command reading the
/// proxy's port, say) are expressed.
#[derive(Clone)]
pub enum CommandTemplate {
    /// A fixed command string.
    Literal(String),
    /// A command derived from run state when resolved.
    Computed(Arc<dyn Fn(&RunContext) -> String + Send + Sync>),
}

impl Debug for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(cmd) => f.debug_tuple("Literal").field(cmd).finish(),
            Self::Computed(_) => f.debug_tuple("Computed").finish(),
        }
    }
}

impl From<&str> for CommandTemplate {
    fn from(cmd: &str) -> Self {
        Self::Literal(cmd.to_string())
    }
}

impl From<String> for CommandTemplate {
    fn from(cmd: String) -> Self {
        Self::Literal(cmd)
    }
}

impl CommandTemplate {
    /// Builds a context-computed command.
    pub fn computed(f: impl Fn(&RunContext) -> String + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    /// Resolves the command against the current run state.
    #[must_use]
    pub fn resolve(&self, ctx: &RunContext) -> String {
        match self {
            Self::Literal(cmd) => cmd.clone(),
            Self::Computed(f) => f(ctx),
        }
    }
}

/// An async per-phase hook, used by [`CustomStage`].
pub type StageHook =
    Arc<dyn for<'a> Fn(&'a RunContext) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// The per-run token appended to spawned commands so the reaper's pattern
/// search can isolate this run's processes from a concurrent run's.
#[must_use]
pub(crate) fn process_key(kind: &str, ctx: &RunContext) -> String {
    format!("{kind}-webtest-{}", ctx.seq_id())
}
