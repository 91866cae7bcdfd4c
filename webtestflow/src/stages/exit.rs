//! Terminal stage that ends the host process.
//!
//! CI agents sometimes keep a pipeline process alive through lingering
//! child handles; appending this stage guarantees the invocation actually
//! exits once the run is complete.

use async_trait::async_trait;
use std::time::Duration;

use crate::context::RunContext;
use crate::errors::Result;
use crate::stages::Stage;

/// Logs the total run cost, waits a short delay so output can flush, then
/// exits the process.
#[derive(Debug, Clone)]
pub struct ExitStage {
    name: String,
    delay: Duration,
}

impl Default for ExitStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitStage {
    /// Creates the stage with the default one-second delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "exit".to_string(),
            delay: Duration::from_millis(1000),
        }
    }

    /// Sets the delay before exiting.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Stage for ExitStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(
            total_cost_secs = ctx.elapsed().as_secs_f64(),
            "run complete, exiting"
        );

        tokio::time::sleep(self.delay).await;
        std::process::exit(0)
    }
}
