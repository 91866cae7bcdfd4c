//! End-to-end test runner stage.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::context::RunContext;
use crate::errors::Result;
use crate::helpers;
use crate::process::{self, ExecOptions, OutputPredicate};
use crate::stages::{CommandTemplate, SkipPredicate, Stage};

#[derive(Debug, Default)]
struct E2eTestState {
    root: PathBuf,
    output_path: PathBuf,
    coverage_output_path: PathBuf,
}

/// Builds and runs the browser-driving end-to-end suite.
///
/// The suite talks to the app through the intercepting proxy; when a proxy
/// stage ran earlier, its exported port is handed to the test process via
/// the `WHISTLE_PORT` environment variable. After the run, the suite's
/// build output is copied into the archive tree.
pub struct E2eTestStage {
    name: String,
    skip: SkipPredicate,
    root_path: PathBuf,
    install_cmd: CommandTemplate,
    build_cmd: CommandTemplate,
    test_cmd: CommandTemplate,
    coverage_cmd: Option<CommandTemplate>,
    test_complete: Option<OutputPredicate>,
    state: RwLock<E2eTestState>,
}

impl Debug for E2eTestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("E2eTestStage")
            .field("name", &self.name)
            .field("root_path", &self.root_path)
            .field("install_cmd", &self.install_cmd)
            .field("build_cmd", &self.build_cmd)
            .field("test_cmd", &self.test_cmd)
            .field("coverage_cmd", &self.coverage_cmd)
            .field("test_complete", &self.test_complete.is_some())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Default for E2eTestStage {
    fn default() -> Self {
        Self::new()
    }
}

impl E2eTestStage {
    /// Creates the stage with its default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "e2e-test".to_string(),
            skip: SkipPredicate::default(),
            root_path: PathBuf::from("../e2e-test"),
            install_cmd: CommandTemplate::from("npm install"),
            build_cmd: CommandTemplate::from("npm run build"),
            test_cmd: CommandTemplate::from("npx mocha"),
            coverage_cmd: None,
            test_complete: None,
            state: RwLock::new(E2eTestState::default()),
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

    /// Sets the suite root, relative to the run's base path.
    #[must_use]
    pub fn with_root_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_path = root.into();
        self
    }

    /// Sets the dependency-install command.
    #[must_use]
    pub fn with_install_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.install_cmd = cmd.into();
        self
    }

    /// Sets the pre-test build command.
    #[must_use]
    pub fn with_build_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.build_cmd = cmd.into();
        self
    }

    /// Sets the test command.
    #[must_use]
    pub fn with_test_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.test_cmd = cmd.into();
        self
    }

    /// Sets an external coverage-generation command, run in the suite
    /// root after the tests.
    #[must_use]
    pub fn with_coverage_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.coverage_cmd = Some(cmd.into());
        self
    }

    /// Sets the predicate that recognizes a finished test run in the
    /// streamed output.
    #[must_use]
    pub fn with_test_complete(mut self, predicate: OutputPredicate) -> Self {
        self.test_complete = Some(predicate);
        self
    }

    /// The resolved report output directory.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.state.read().output_path.clone()
    }

    /// The resolved coverage output directory.
    #[must_use]
    pub fn coverage_output_path(&self) -> PathBuf {
        self.state.read().coverage_output_path.clone()
    }

    async fn install(&self, ctx: &RunContext) -> Result<()> {
        if ctx.is_dev() {
            return Ok(());
        }

        let root = self.state.read().root.clone();
        let command = self.install_cmd.resolve(ctx);

        process::run_by_exec(&command, &ExecOptions::in_dir(root), None).await?;
        Ok(())
    }

    async fn build(&self, ctx: &RunContext) -> Result<()> {
        let root = self.state.read().root.clone();
        let command = self.build_cmd.resolve(ctx);

        process::run_by_exec(&command, &ExecOptions::in_dir(root), None).await?;
        Ok(())
    }

    async fn run_test(&self, ctx: &RunContext) -> Result<()> {
        let root = self.state.read().root.clone();
        let command = self.test_cmd.resolve(ctx);

        let mut options = ExecOptions::in_dir(root);
        if let Some(port) = ctx.param("proxyPort").and_then(|v| v.as_u64()) {
            options
                .envs
                .push(("WHISTLE_PORT".to_string(), port.to_string()));
        }

        process::run_by_exec(&command, &options, self.test_complete.clone()).await?;
        Ok(())
    }

    async fn run_coverage(&self, ctx: &RunContext) -> Result<()> {
        let Some(coverage_cmd) = &self.coverage_cmd else {
            return Ok(());
        };

        let root = self.state.read().root.clone();
        let command = coverage_cmd.resolve(ctx);

        // Coverage is advisory; a failed generation never fails the run.
        if let Err(err) = process::run_by_exec(&command, &ExecOptions::in_dir(root), None).await {
            tracing::warn!(stage = %self.name, error = %err, "coverage generation failed");
        }
        Ok(())
    }

    /// Copies the suite's build output into the archive tree, keeping the
    /// rendered coverage report but dropping the raw coverage dump.
    /// Best-effort: failures are logged, never raised.
    fn copy_build_output(&self, ctx: &RunContext) {
        let (root, coverage_output_path) = {
            let state = self.state.read();
            (state.root.clone(), state.coverage_output_path.clone())
        };

        let src = root.join("build");
        let dst = ctx.output_path().join("e2e_test_build_output");
        let coverage_src = root.join("build/coverage");

        if src.exists() {
            if let Err(err) = helpers::copy_dir_all(&src, &dst) {
                tracing::warn!(error = %err, "copying build output failed");
            }
        }

        if coverage_src.exists() {
            if let Err(err) = helpers::copy_dir_all(&coverage_src, &coverage_output_path) {
                tracing::warn!(error = %err, "copying coverage output failed");
            }
        }

        let raw_coverage = dst.join("coverage_output");
        if raw_coverage.exists() {
            if let Err(err) = std::fs::remove_dir_all(&raw_coverage) {
                tracing::warn!(error = %err, "removing raw coverage dump failed");
            }
        }
    }
}

#[async_trait]
impl Stage for E2eTestStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &RunContext) -> Result<()> {
        let output_path = ctx.output_path().join("e2e_test_report");
        let coverage_output_path = output_path.join("coverage");

        ctx.add_params(serde_json::json!({
            "e2eTestRelativePathToOutput":
                helpers::relative_path(ctx.output_path(), &output_path)
                    .display()
                    .to_string(),
            "e2eTestCoverageRelativePathToOutput":
                helpers::relative_path(ctx.output_path(), &coverage_output_path)
                    .display()
                    .to_string(),
        }));

        let mut state = self.state.write();
        state.root = helpers::absolute_path(ctx.base_path(), &self.root_path);
        state.output_path = output_path;
        state.coverage_output_path = coverage_output_path;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(stage = %self.name, "running e2e tests");

        self.install(ctx).await?;
        self.build(ctx).await?;
        self.run_test(ctx).await?;
        self.run_coverage(ctx).await?;
        self.copy_build_output(ctx);

        ctx.add_params(serde_json::json!({
            "shouldRunE2eTest": self.should_run(ctx),
        }));

        tracing::info!(stage = %self.name, "e2e tests finished");
        Ok(())
    }

    fn should_run(&self, ctx: &RunContext) -> bool {
        self.skip.should_run(ctx)
    }
}

/// The report file an e2e test run is expected to produce.
#[must_use]
pub fn report_file(output_path: &Path) -> PathBuf {
    output_path.join("mochawesome.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::lease::LeaseStore;
    use pretty_assertions::assert_eq;

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
    async fn test_init_exports_report_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = E2eTestStage::new();

        stage.init(&ctx).await.unwrap();

        assert_eq!(
            ctx.param("e2eTestRelativePathToOutput"),
            Some(serde_json::json!("e2e_test_report"))
        );
        assert!(stage
            .coverage_output_path()
            .ends_with("e2e_test_report/coverage"));
    }

    #[tokio::test]
    async fn test_run_test_passes_proxy_port_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ci/e2e-test")).unwrap();
        let ctx = test_context(&dir);
        ctx.add_params(serde_json::json!({"proxyPort": 9529}));

        let stage = E2eTestStage::new()
            .with_test_cmd("test \"$WHISTLE_PORT\" = 9529");

        stage.init(&ctx).await.unwrap();
        stage.run_test(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_build_output_prunes_raw_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);

        let suite_root = dir.path().join("ci/e2e-test");
        std::fs::create_dir_all(suite_root.join("build/coverage")).unwrap();
        std::fs::create_dir_all(suite_root.join("build/coverage_output")).unwrap();
        std::fs::write(suite_root.join("build/report.html"), "<html/>").unwrap();
        std::fs::write(suite_root.join("build/coverage/index.html"), "<html/>").unwrap();

        let stage = E2eTestStage::new();
        stage.init(&ctx).await.unwrap();
        stage.copy_build_output(&ctx);

        let archived = ctx.output_path().join("e2e_test_build_output");
        assert!(archived.join("report.html").exists());
        assert!(!archived.join("coverage_output").exists());
        assert!(stage.coverage_output_path().join("index.html").exists());
    }
}
