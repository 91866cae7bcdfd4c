//! The pipeline engine: a four-phase lifecycle over an ordered stage list.
//!
//! Execution order is exactly the caller-supplied list order with the
//! lease-cleanup stage always first (and, when enabled, the exit stage
//! last); there is no dependency-graph reordering. Phases are barriers:
//! every stage completes phase N before any stage enters phase N+1,
//! because later stages commonly depend on context state exported by
//! earlier ones.


use std::path::PathBuf;
use std::sync::Arc;

use crate::context::{RunContext, RunOptions};
use crate::errors::{PipelineFailure, Result, WebtestflowError};
use crate::stages::{ExitStage, LeaseCleanStage, Stage};

/// The engine's lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built, not yet started.
    Created,
    /// Constructing the context and running every stage's `init`.
    Initializing,
    /// Running every stage's `before_run`.
    BeforeRun,
    /// Running the gated `run` phase, sequentially in list order.
    Running,
    /// Running every stage's `after_run`.
    AfterRun,
    /// Completed successfully.
    Done,
    /// Aborted; reachable from the four middle states.
    Failed,
}

/// An ordered web-test pipeline.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    exit_when_done: bool,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage. Stages execute in insertion order.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends an already-shared stage.
    #[must_use]
    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends an [`ExitStage`] at the tail, so the host process is
    /// guaranteed to terminate once the run completes.
    #[must_use]
    pub fn with_exit_stage(mut self, exit_when_done: bool) -> Self {
        self.exit_when_done = exit_when_done;
        self
    }

    /// Runs the pipeline rooted at `base_path`.
    ///
    /// On success the run context is returned for inspection of exported
    /// parameters. On failure every stage's `after_run` is still invoked
    /// best-effort (independent of developer mode) before the wrapped
    /// error, which carries the partial context, is returned.
    ///
    /// # Errors
    ///
    /// [`PipelineFailure`] wrapping the first stage error encountered.
    pub async fn run(
        mut self,
        base_path: impl Into<PathBuf>,
        options: RunOptions,
    ) -> std::result::Result<Arc<RunContext>, PipelineFailure> {
        let state = PipelineState::Created;
        tracing::info!(?state, "starting web test pipeline");

        let ctx = Arc::new(RunContext::new(base_path, options));

        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(self.stages.len() + 2);
        stages.push(Arc::new(LeaseCleanStage::new()));
        stages.append(&mut self.stages);
        if self.exit_when_done {
            stages.push(Arc::new(ExitStage::new()));
        }

        match drive(&stages, &ctx).await {
            Ok(()) => {
                tracing::info!(
                    state = ?PipelineState::Done,
                    seq_id = ctx.seq_id(),
                    total_cost_secs = ctx.elapsed().as_secs_f64(),
                    "pipeline complete"
                );
                Ok(ctx)
            }
            Err(err) => {
                let state = PipelineState::Failed;
                tracing::error!(?state, error = %err, "pipeline failed, running best-effort teardown");

                for stage in &stages {
                    if let Err(cleanup_err) = stage.after_run(&ctx).await {
                        tracing::warn!(
                            stage = stage.name(),
                            error = %cleanup_err,
                            "teardown failed during abort"
                        );
                    }
                }

                Err(PipelineFailure::with_context(err, ctx))
            }
        }
    }
}

/// Drives the four phases over the final stage list.
async fn drive(stages: &[Arc<dyn Stage>], ctx: &Arc<RunContext>) -> Result<()> {
    let mut state = PipelineState::Initializing;
    tracing::info!(?state, "entering phase");

    for stage in stages {
        tracing::info!(stage = stage.name(), "init");
        stage
            .init(ctx)
            .await
            .map_err(|err| WebtestflowError::stage(stage.name(), &err))?;
        ctx.register_stage(stage.clone());
    }

    state = PipelineState::BeforeRun;
    tracing::info!(?state, "entering phase");

    // Unconditional, not gated by should_run: a previous run's residue is
    // independent of this run's skip decisions.
    for stage in stages {
        stage
            .before_run(ctx)
            .await
            .map_err(|err| WebtestflowError::stage(stage.name(), &err))?;
    }

    state = PipelineState::Running;
    tracing::info!(?state, "entering phase");

    for stage in stages {
        if stage.should_run(ctx) {
            stage
                .run(ctx)
                .await
                .map_err(|err| WebtestflowError::stage(stage.name(), &err))?;
        } else {
            tracing::info!(stage = stage.name(), "skipping stage");
        }
    }

    state = PipelineState::AfterRun;
    tracing::info!(?state, "entering phase");

    // Developer mode keeps processes alive for inspection after the run.
    if ctx.is_dev() {
        tracing::info!("developer mode, skipping teardown phase");
    } else {
        for stage in stages {
            stage
                .after_run(ctx)
                .await
                .map_err(|err| WebtestflowError::stage(stage.name(), &err))?;
        }
    }

    Ok(())
}
