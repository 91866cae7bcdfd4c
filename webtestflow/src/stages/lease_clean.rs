//! The mandatory lease-cleanup stage the engine prepends to every run.

use async_trait::async_trait;

use crate::context::RunContext;
use crate::errors::Result;
use crate::stages::Stage;

/// Cleans this run's leases (and sweeps expired ones left by crashed prior
/// runs) before anything starts and again after everything finishes.
#[derive(Debug, Clone)]
pub struct LeaseCleanStage {
    name: String,
}

impl Default for LeaseCleanStage {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseCleanStage {
    /// Creates the stage under its default name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "lease-clean".to_string(),
        }
    }
}

#[async_trait]
impl Stage for LeaseCleanStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        ctx.leases().cleanup(ctx.seq_id()).await
    }

    async fn after_run(&self, ctx: &RunContext) -> Result<()> {
        ctx.leases().cleanup(ctx.seq_id()).await
    }
}
