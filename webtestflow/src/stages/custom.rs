//! User-defined stage assembled from per-phase hooks.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;

use crate::context::RunContext;
use crate::errors::Result;
use crate::stages::{SkipPredicate, Stage, StageHook};

/// A stage whose phases are caller-supplied async closures. Any phase
/// without a hook is a no-op.
#[derive(Clone, Default)]
pub struct CustomStage {
    name: String,
    skip: SkipPredicate,
    on_init: Option<StageHook>,
    on_before_run: Option<StageHook>,
    on_run: Option<StageHook>,
    on_after_run: Option<StageHook>,
}

impl Debug for CustomStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomStage")
            .field("name", &self.name)
            .field("skip", &self.skip)
            .field("on_init", &self.on_init.is_some())
            .field("on_before_run", &self.on_before_run.is_some())
            .field("on_run", &self.on_run.is_some())
            .field("on_after_run", &self.on_after_run.is_some())
            .finish()
    }
}

impl CustomStage {
    /// Creates an empty custom stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the skip predicate.
    #[must_use]
    pub fn with_skip(mut self, skip: impl Into<SkipPredicate>) -> Self {
        self.skip = skip.into();
        self
    }

    /// Sets the `init` hook.
    #[must_use]
    pub fn with_on_init<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a RunContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_init = Some(Arc::new(hook));
        self
    }

    /// Sets the `before_run` hook.
    #[must_use]
    pub fn with_on_before_run<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a RunContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_before_run = Some(Arc::new(hook));
        self
    }

    /// Sets the `run` hook.
    #[must_use]
    pub fn with_on_run<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a RunContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_run = Some(Arc::new(hook));
        self
    }

    /// Sets the `after_run` hook.
    #[must_use]
    pub fn with_on_after_run<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a RunContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_after_run = Some(Arc::new(hook));
        self
    }

    async fn call(hook: Option<&StageHook>, ctx: &RunContext) -> Result<()> {
        match hook {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Stage for CustomStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &RunContext) -> Result<()> {
        Self::call(self.on_init.as_ref(), ctx).await
    }

    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        Self::call(self.on_before_run.as_ref(), ctx).await
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        Self::call(self.on_run.as_ref(), ctx).await
    }

    async fn after_run(&self, ctx: &RunContext) -> Result<()> {
        Self::call(self.on_after_run.as_ref(), ctx).await
    }

    fn should_run(&self, ctx: &RunContext) -> bool {
        self.skip.should_run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::lease::LeaseStore;

    fn test_context() -> RunContext {
        let dir = tempfile::tempdir().unwrap();
        RunContext::new(
            dir.path().join("app"),
            RunOptions {
                is_dev: true,
                lease_store: Some(LeaseStore::at_path(dir.path().join("leases.yml"))),
                ..RunOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_hooks_run_and_export_params() {
        let stage = CustomStage::new("custom").with_on_run(|ctx| {
            Box::pin(async move {
                ctx.add_params(serde_json::json!({"customRan": true}));
                Ok(())
            })
        });

        let ctx = test_context();
        stage.run(&ctx).await.unwrap();

        assert_eq!(ctx.param("customRan"), Some(serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_missing_hooks_are_noops() {
        let stage = CustomStage::new("custom");
        let ctx = test_context();

        stage.init(&ctx).await.unwrap();
        stage.before_run(&ctx).await.unwrap();
        stage.run(&ctx).await.unwrap();
        stage.after_run(&ctx).await.unwrap();
    }

    #[test]
    fn test_skip_predicate_applies() {
        let stage = CustomStage::new("custom").with_skip(true);
        let ctx = test_context();

        assert!(!stage.should_run(&ctx));
    }
}
