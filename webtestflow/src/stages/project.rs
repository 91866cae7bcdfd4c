//! Project build stage: dependency install plus the build itself.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::path::PathBuf;

use crate::context::RunContext;
use crate::errors::Result;
use crate::helpers;
use crate::process::{self, ExecOptions, OutputPredicate};
use crate::stages::{process_key, CommandTemplate, SkipPredicate, Stage};

#[derive(Debug, Default)]
struct ProjectState {
    root: PathBuf,
    process_key: String,
    port: u16,
}

/// Builds the project under test.
///
/// Watch-mode builds (webpack dev server and friends) hold a port and
/// never exit, so the stage optionally leases a port and accepts a build
/// completion predicate over the build tool's output.
pub struct ProjectStage {
    name: String,
    skip: SkipPredicate,
    root_path: PathBuf,
    use_port: bool,
    configured_port: u16,
    install_cmd: CommandTemplate,
    build_cmd: CommandTemplate,
    build_complete: Option<OutputPredicate>,
    state: RwLock<ProjectState>,
}

impl Debug for ProjectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectStage")
            .field("name", &self.name)
            .field("root_path", &self.root_path)
            .field("use_port", &self.use_port)
            .field("configured_port", &self.configured_port)
            .field("install_cmd", &self.install_cmd)
            .field("build_cmd", &self.build_cmd)
            .field("build_complete", &self.build_complete.is_some())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Default for ProjectStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectStage {
    /// Creates the stage with its default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "project".to_string(),
            skip: SkipPredicate::default(),
            root_path: PathBuf::from("../../"),
            use_port: false,
            configured_port: 0,
            install_cmd: CommandTemplate::from("npm install"),
            build_cmd: CommandTemplate::from("npm start"),
            build_complete: None,
            state: RwLock::new(ProjectState::default()),
        }
    }

    /// Overrides the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the skip predicate.
    #[must_use]
    pub fn with_skip(mut self, skip: impl Into<SkipPredicate>) -> Self {
        self.skip = skip.into();
        self
    }

    /// Sets the project root, relative to the run's base path.
    #[must_use]
    pub fn with_root_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_path = root.into();
        self
    }

    /// Declares that the build holds a port (watch/hot-reload builds).
    #[must_use]
    pub fn with_use_port(mut self, use_port: bool) -> Self {
        self.use_port = use_port;
        self
    }

    /// Pins the build to a fixed port instead of leasing one.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.configured_port = port;
        self.use_port = self.use_port || port != 0;
        self
    }

    /// Sets the dependency-install command.
    #[must_use]
    pub fn with_install_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.install_cmd = cmd.into();
        self
    }

    /// Sets the build command.
    #[must_use]
    pub fn with_build_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.build_cmd = cmd.into();
        self
    }

    /// Sets the predicate that recognizes a finished watch-mode build in
    /// the streamed output.
    #[must_use]
    pub fn with_build_complete(mut self, predicate: OutputPredicate) -> Self {
        self.build_complete = Some(predicate);
        self
    }

    /// The leased (or pinned) port, once resolved.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self.state.read().port {
            0 => None,
            port => Some(port),
        }
    }

    async fn install(&self, ctx: &RunContext) -> Result<()> {
        if ctx.is_dev() {
            return Ok(());
        }

        let (root, key) = {
            let state = self.state.read();
            (state.root.clone(), state.process_key.clone())
        };
        let command = format!("{} --{key}", self.install_cmd.resolve(ctx));

        process::run_by_exec(&command, &ExecOptions::in_dir(root), None).await?;
        Ok(())
    }

    async fn find_port(&self, ctx: &RunContext) -> Result<()> {
        if !self.use_port {
            tracing::info!(stage = %self.name, "build does not use a port");
            return Ok(());
        }

        if self.state.read().port != 0 {
            tracing::info!(stage = %self.name, port = self.state.read().port, "using pinned port");
            return Ok(());
        }

        let port = ctx.find_available_port(&self.name).await?;
        self.state.write().port = port;
        ctx.add_params(serde_json::json!({ "projectPort": port }));
        Ok(())
    }

    async fn build(&self, ctx: &RunContext) -> Result<()> {
        let (root, key) = {
            let state = self.state.read();
            (state.root.clone(), state.process_key.clone())
        };
        let command = format!("{} --{key}", self.build_cmd.resolve(ctx));

        process::run_by_exec(
            &command,
            &ExecOptions::in_dir(root),
            self.build_complete.clone(),
        )
        .await?;
        Ok(())
    }

    /// Kills leftover build processes and frees the leased port.
    /// Best-effort: failures are logged, never raised.
    async fn clean(&self) {
        if !self.use_port {
            tracing::info!(stage = %self.name, "no port in use, nothing to clean");
            return;
        }

        let (key, port) = {
            let state = self.state.read();
            (state.process_key.clone(), state.port)
        };

        // An empty key means init never ran; a pattern search with it
        // would match every process on the machine.
        if !key.is_empty() {
            if let Err(err) = process::kill_by_search(&key).await {
                tracing::info!(stage = %self.name, key, error = %err, "kill by search failed");
            }
        }

        if port != 0 {
            if let Err(err) = process::kill_by_port(port).await {
                tracing::info!(stage = %self.name, port, error = %err, "kill by port failed");
            }
        }
    }
}

#[async_trait]
impl Stage for ProjectStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &RunContext) -> Result<()> {
        let mut state = self.state.write();
        state.root = helpers::absolute_path(ctx.base_path(), &self.root_path);
        state.process_key = process_key("project", ctx);
        state.port = self.configured_port;
        Ok(())
    }

    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        self.clean().await;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(stage = %self.name, "starting project build");

        self.install(ctx).await?;
        self.find_port(ctx).await?;
        self.build(ctx).await?;

        tracing::info!(stage = %self.name, "project build finished");
        Ok(())
    }

    async fn after_run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        self.clean().await;
        Ok(())
    }

    fn should_run(&self, ctx: &RunContext) -> bool {
        self.skip.should_run(ctx)
    }
}
