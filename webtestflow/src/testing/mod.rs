//! Test doubles for exercising the pipeline engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

use crate::context::RunContext;
use crate::errors::{Result, WebtestflowError};
use crate::stages::{SkipPredicate, Stage};

/// A shared, ordered log of `stage:phase` entries.
pub type PhaseLog = Arc<Mutex<Vec<String>>>;

/// Creates an empty phase log.
#[must_use]
pub fn phase_log() -> PhaseLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A stage that records every lifecycle call into a shared log, and can
/// be told to skip or to fail its `run` phase.
#[derive(Debug, Clone)]
pub struct RecordingStage {
    name: String,
    skip: SkipPredicate,
    fail_in_run: bool,
    log: PhaseLog,
}

impl RecordingStage {
    /// Creates a recording stage writing into `log`.
    #[must_use]
    pub fn new(name: impl Into<String>, log: PhaseLog) -> Self {
        Self {
            name: name.into(),
            skip: SkipPredicate::default(),
            fail_in_run: false,
            log,
        }
    }

    /// Sets the skip predicate.
    #[must_use]
    pub fn with_skip(mut self, skip: impl Into<SkipPredicate>) -> Self {
        self.skip = skip.into();
        self
    }

    /// Makes the `run` phase fail.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_in_run = true;
        self
    }

    fn record(&self, phase: &str) {
        self.log.lock().push(format!("{}:{phase}", self.name));
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, _ctx: &RunContext) -> Result<()> {
        self.record("init");
        Ok(())
    }

    async fn before_run(&self, _ctx: &RunContext) -> Result<()> {
        self.record("before_run");
        Ok(())
    }

    async fn run(&self, _ctx: &RunContext) -> Result<()> {
        self.record("run");
        if self.fail_in_run {
            return Err(WebtestflowError::Stage {
                stage: self.name.clone(),
                message: "induced failure".to_string(),
            });
        }
        Ok(())
    }

    async fn after_run(&self, _ctx: &RunContext) -> Result<()> {
        self.record("after_run");
        Ok(())
    }

    fn should_run(&self, ctx: &RunContext) -> bool {
        self.skip.should_run(ctx)
    }
}
