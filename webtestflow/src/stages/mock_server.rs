//! Mock data server stage.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::RunContext;
use crate::errors::Result;
use crate::helpers;
use crate::process::{self, ExecOptions, OutputPredicate};
use crate::stages::{process_key, CommandTemplate, SkipPredicate, Stage};

#[derive(Debug, Default)]
struct MockServerState {
    root: PathBuf,
    process_key: String,
    port: u16,
}

/// Starts the mock server the tests route their API traffic through.
///
/// The server is a long-lived daemon: startup is complete when its own
/// output announces the listening address, at which point the call
/// resolves and the captured PID is leased for later cleanup.
pub struct MockServerStage {
    name: String,
    skip: SkipPredicate,
    root_path: PathBuf,
    configured_port: u16,
    install_cmd: CommandTemplate,
    start_cmd: CommandTemplate,
    state: RwLock<MockServerState>,
}

impl Debug for MockServerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServerStage")
            .field("name", &self.name)
            .field("root_path", &self.root_path)
            .field("configured_port", &self.configured_port)
            .field("install_cmd", &self.install_cmd)
            .field("start_cmd", &self.start_cmd)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Default for MockServerStage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerStage {
    /// Creates the stage with its default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "mock-server".to_string(),
            skip: SkipPredicate::default(),
            root_path: PathBuf::from("../mock-server"),
            configured_port: 0,
            install_cmd: CommandTemplate::from("npm install"),
            start_cmd: CommandTemplate::from("mockstar run"),
            state: RwLock::new(MockServerState::default()),
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

    /// Sets the mock-server project root, relative to the run's base path.
    #[must_use]
    pub fn with_root_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_path = root.into();
        self
    }

    /// Pins the server to a fixed port instead of leasing one.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.configured_port = port;
        self
    }

    /// Sets the dependency-install command.
    #[must_use]
    pub fn with_install_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.install_cmd = cmd.into();
        self
    }

    /// Sets the server start command; `--<process-key> -p <port>` is
    /// appended when spawning.
    #[must_use]
    pub fn with_start_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.start_cmd = cmd.into();
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
        if self.state.read().port != 0 {
            tracing::info!(stage = %self.name, port = self.state.read().port, "using pinned port");
            return Ok(());
        }

        let port = ctx.find_available_port(&self.name).await?;
        self.state.write().port = port;
        ctx.add_params(serde_json::json!({ "mockServerPort": port }));
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let (root, key, port) = {
            let state = self.state.read();
            (state.root.clone(), state.process_key.clone(), state.port)
        };
        let command = format!("{} --{key} -p {port}", self.start_cmd.resolve(ctx));

        // Startup is complete once the server logs its listening address.
        let announced = format!("127.0.0.1:{port}");
        let ready: OutputPredicate = Arc::new(move |chunk: &str| chunk.contains(&announced));

        let outcome =
            process::run_by_exec(&command, &ExecOptions::in_dir(root), Some(ready)).await?;

        if let Some(pid) = outcome.pid {
            ctx.lock_port(&self.name, pid)?;
        }
        Ok(())
    }

    /// Kills leftover server processes and frees the leased port.
    /// Best-effort: failures are logged, never raised.
    async fn clean(&self) {
        let (key, port) = {
            let state = self.state.read();
            (state.process_key.clone(), state.port)
        };

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
impl Stage for MockServerStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &RunContext) -> Result<()> {
        let mut state = self.state.write();
        state.root = helpers::absolute_path(ctx.base_path(), &self.root_path);
        state.process_key = process_key("mock-server", ctx);
        state.port = self.configured_port;
        Ok(())
    }

    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        self.clean().await;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(stage = %self.name, "starting mock server");

        self.install(ctx).await?;
        self.find_port(ctx).await?;
        self.start(ctx).await?;

        tracing::info!(stage = %self.name, "mock server started");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::lease::LeaseStore;

    fn test_context(dir: &tempfile::TempDir) -> RunContext {
        RunContext::new(
            dir.path().join("ci/app"),
            RunOptions {
                is_dev: true,
                lease_store: Some(LeaseStore::at_path(dir.path().join("leases.yml"))),
                ..RunOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_init_resolves_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = MockServerStage::new();

        stage.init(&ctx).await.unwrap();

        let state = stage.state.read();
        assert!(state.root.ends_with("ci/mock-server"));
        assert_eq!(state.process_key, "mock-server-webtest-dev");
        assert_eq!(state.port, 0);
    }

    #[tokio::test]
    async fn test_find_port_exports_param_and_leases() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = MockServerStage::new();

        stage.init(&ctx).await.unwrap();
        stage.find_port(&ctx).await.unwrap();

        let port = stage.port().unwrap();
        assert_eq!(ctx.param("mockServerPort"), Some(serde_json::json!(port)));
        assert!(ctx.leases().used_ports().contains(&port));
    }

    #[tokio::test]
    async fn test_start_records_pid_when_ready() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ci/mock-server")).unwrap();
        let ctx = test_context(&dir);

        // Stand-in daemon: announces the listening address, then lingers.
        let stage = MockServerStage::new()
            .with_port(9777)
            .with_start_cmd("echo listening at 127.0.0.1:9777 && sleep 30; true");

        stage.init(&ctx).await.unwrap();
        ctx.leases()
            .acquire_port(stage.name(), 9777, ctx.seq_id(), ctx.base_path())
            .unwrap();
        stage.start(&ctx).await.unwrap();

        let data = ctx.leases().load().unwrap();
        let Some(crate::lease::CacheEntry::Run(entry)) = data.get("dev") else {
            panic!("lease entry missing");
        };
        assert!(entry.list[0].pid.is_some());
    }
}
