//! HTTP-intercepting proxy stage.
//!
//! The proxy (whistle) fronts the browser traffic during e2e runs. Its
//! rules are generated into a module-shaped config file, the daemon is
//! started under a per-run namespacing key, and a health-endpoint poll
//! confirms it actually came up before any test depends on it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::RunContext;
use crate::errors::{Result, WebtestflowError};
use crate::process::{self, ExecOptions};
use crate::readiness::{self, RetryPolicy};
use crate::stages::{process_key, SkipPredicate, Stage};

/// The directive prepended to every generated rule set so HTTPS tunnels
/// are captured as well.
const CAPTURE_DIRECTIVE: &str = "* enable://capture";

/// The `lastUsed` slot name for the shared proxy service.
const SERVICE_LABEL: &str = "Proxy";

/// A named proxy rule set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyRules {
    /// Rule-set name, shown in the proxy UI.
    pub name: String,
    /// The rule text.
    pub rules: String,
}

type RulesFn = Arc<dyn Fn(&RunContext) -> ProxyRules + Send + Sync>;

#[derive(Debug, Default)]
struct ProxyState {
    config_file: PathBuf,
    process_key: String,
    port: u16,
    reused: bool,
}

/// Starts (or adopts) the intercepting proxy and forces this run's rules.
pub struct ProxyStage {
    name: String,
    skip: SkipPredicate,
    configured_port: u16,
    reuse: bool,
    proxy_bin: String,
    config_file_name: String,
    rules: RulesFn,
    state: RwLock<ProxyState>,
}

impl Debug for ProxyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyStage")
            .field("name", &self.name)
            .field("configured_port", &self.configured_port)
            .field("reuse", &self.reuse)
            .field("proxy_bin", &self.proxy_bin)
            .field("config_file_name", &self.config_file_name)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Default for ProxyStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStage {
    /// Creates the stage with its default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "proxy".to_string(),
            skip: SkipPredicate::default(),
            configured_port: 0,
            reuse: false,
            proxy_bin: "w2".to_string(),
            config_file_name: "test.whistle.js".to_string(),
            rules: Arc::new(|ctx| ProxyRules {
                name: format!("webtest-{}", ctx.seq_id()),
                rules: "# no rules configured".to_string(),
            }),
            state: RwLock::new(ProxyState::default()),
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

    /// Pins the proxy to a fixed port instead of leasing one.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.configured_port = port;
        self
    }

    /// Enables reuse mode: adopt an already-running shared proxy instance
    /// when one answers on the remembered port, and leave the process
    /// alive across invocations (cleanup is skipped).
    #[must_use]
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Sets the proxy binary name.
    #[must_use]
    pub fn with_proxy_bin(mut self, bin: impl Into<String>) -> Self {
        self.proxy_bin = bin.into();
        self
    }

    /// Sets the generated config file name inside the output directory.
    #[must_use]
    pub fn with_config_file_name(mut self, name: impl Into<String>) -> Self {
        self.config_file_name = name.into();
        self
    }

    /// Sets the rule generator.
    #[must_use]
    pub fn with_rules(mut self, rules: impl Fn(&RunContext) -> ProxyRules + Send + Sync + 'static) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    /// The generated config file name.
    #[must_use]
    pub fn config_file_name(&self) -> &str {
        &self.config_file_name
    }

    /// The leased (or adopted) port, once resolved.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self.state.read().port {
            0 => None,
            port => Some(port),
        }
    }

    fn health_url(port: u16) -> String {
        format!("http://127.0.0.1:{port}/cgi-bin/get-data")
    }

    /// Writes the module-shaped rules config file.
    ///
    /// The caller-supplied rule text is prefixed with the capture
    /// directive; a rule set without a name or rules is a configuration
    /// error.
    async fn generate_config_file(&self, ctx: &RunContext) -> Result<()> {
        let mut rules = (self.rules)(ctx);

        if rules.name.is_empty() || rules.rules.is_empty() {
            return Err(WebtestflowError::Config(
                "proxy rules need both a name and rule text".to_string(),
            ));
        }

        rules.rules = format!("{CAPTURE_DIRECTIVE}\n\n{}", rules.rules);

        let content = format!(
            "module.exports = {};\n",
            serde_json::to_string_pretty(&rules)?
        );

        let config_file = self.state.read().config_file.clone();
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_file, &content)?;

        tracing::info!(config_file = %config_file.display(), "generated proxy rules config");
        Ok(())
    }

    async fn find_port(&self, ctx: &RunContext) -> Result<()> {
        if self.state.read().port != 0 {
            tracing::info!(stage = %self.name, port = self.state.read().port, "using pinned port");
        } else {
            let port = ctx.find_available_port(&self.name).await?;
            self.state.write().port = port;
        }

        ctx.add_params(serde_json::json!({ "proxyPort": self.state.read().port }));
        Ok(())
    }

    /// Tries to adopt a live shared instance from the `lastUsed` slot.
    /// A stale slot (nothing answers) is cleared.
    async fn try_adopt(&self, ctx: &RunContext) -> Result<bool> {
        let Some(port) = ctx.leases().last_used_port(SERVICE_LABEL) else {
            return Ok(false);
        };

        match readiness::wait_until_available(&Self::health_url(port), &RetryPolicy::once()).await
        {
            Ok(()) => {
                tracing::info!(port, "adopted running proxy instance");
                let mut state = self.state.write();
                state.port = port;
                state.reused = true;
                drop(state);

                ctx.add_params(serde_json::json!({ "proxyPort": port }));
                Ok(true)
            }
            Err(_) => {
                tracing::info!(port, "remembered proxy port is stale, starting fresh");
                ctx.leases().clear_last_used_port(SERVICE_LABEL)?;
                Ok(false)
            }
        }
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let (key, port) = {
            let state = self.state.read();
            (state.process_key.clone(), state.port)
        };

        let command = format!("{} start -S {key} -p {port}", self.proxy_bin);
        let outcome = process::run_by_exec(&command, &ExecOptions::default(), None).await?;

        if let Some(pid) = outcome.pid {
            ctx.lock_port(&self.name, pid)?;
        }

        // Confirm the daemon actually came up before anything depends on it.
        readiness::wait_until_available(&Self::health_url(port), &RetryPolicy::default()).await?;

        ctx.leases().save_last_used_port(SERVICE_LABEL, port)?;
        Ok(())
    }

    /// Forces this run's rules onto the running instance.
    async fn use_rules(&self) -> Result<()> {
        let (key, config_file) = {
            let state = self.state.read();
            (state.process_key.clone(), state.config_file.clone())
        };

        let command = format!(
            "{} use {} -S {key} --force",
            self.proxy_bin,
            config_file.display()
        );
        process::run_by_exec(&command, &ExecOptions::default(), None).await?;
        Ok(())
    }

    /// Kills leftover proxy processes and frees the leased port.
    /// Best-effort: failures are logged, never raised. Skipped entirely in
    /// reuse mode so the shared instance survives the run.
    async fn clean(&self) {
        if self.reuse || self.state.read().reused {
            tracing::info!(stage = %self.name, "reuse mode, leaving proxy running");
            return;
        }

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
impl Stage for ProxyStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &RunContext) -> Result<()> {
        {
            let mut state = self.state.write();
            state.config_file = ctx.output_path().join(&self.config_file_name);
            state.process_key = process_key("proxy", ctx);
            state.port = self.configured_port;
        }

        ctx.add_params(serde_json::json!({
            "proxyConfigFileName": self.config_file_name,
        }));
        Ok(())
    }

    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        self.clean().await;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(stage = %self.name, "starting proxy");

        if self.reuse && self.try_adopt(ctx).await? {
            self.generate_config_file(ctx).await?;
            self.use_rules().await?;
            return Ok(());
        }

        self.find_port(ctx).await?;
        self.generate_config_file(ctx).await?;
        self.start(ctx).await?;
        self.use_rules().await?;

        tracing::info!(stage = %self.name, "proxy started");
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
    async fn test_generate_config_file_prefixes_capture_directive() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = ProxyStage::new().with_rules(|_ctx| ProxyRules {
            name: "my-rules".to_string(),
            rules: "example.com 127.0.0.1:9530".to_string(),
        });

        stage.init(&ctx).await.unwrap();
        stage.generate_config_file(&ctx).await.unwrap();

        let content =
            std::fs::read_to_string(ctx.output_path().join("test.whistle.js")).unwrap();
        assert!(content.starts_with("module.exports = "));
        assert!(content.contains("* enable://capture"));
        assert!(content.contains("example.com 127.0.0.1:9530"));
        // The directive comes before the caller's rules.
        assert!(
            content.find("enable://capture").unwrap() < content.find("example.com").unwrap()
        );
    }

    #[tokio::test]
    async fn test_generate_config_file_rejects_empty_rules() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = ProxyStage::new().with_rules(|_ctx| ProxyRules {
            name: String::new(),
            rules: "rule".to_string(),
        });

        stage.init(&ctx).await.unwrap();
        let result = stage.generate_config_file(&ctx).await;

        assert!(matches!(result, Err(WebtestflowError::Config(_))));
    }

    #[tokio::test]
    async fn test_find_port_exports_proxy_port() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = ProxyStage::new();

        stage.init(&ctx).await.unwrap();
        stage.find_port(&ctx).await.unwrap();

        let port = stage.port().unwrap();
        assert_eq!(ctx.param("proxyPort"), Some(serde_json::json!(port)));
    }

    #[tokio::test]
    async fn test_try_adopt_without_slot_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = ProxyStage::new().with_reuse(true);

        stage.init(&ctx).await.unwrap();
        assert!(!stage.try_adopt(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_adopt_clears_stale_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);

        // Remember a port nothing answers on.
        let held = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let dead_port = held.local_addr().unwrap().port();
        drop(held);
        ctx.leases().save_last_used_port("Proxy", dead_port).unwrap();

        let stage = ProxyStage::new().with_reuse(true);
        stage.init(&ctx).await.unwrap();

        assert!(!stage.try_adopt(&ctx).await.unwrap());
        assert_eq!(ctx.leases().last_used_port("Proxy"), None);
    }

    #[tokio::test]
    async fn test_reuse_mode_skips_clean() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir);
        let stage = ProxyStage::new().with_reuse(true).with_port(9999);

        stage.init(&ctx).await.unwrap();
        // Cleaning in reuse mode must not attempt any kill; with a real
        // kill attempt against nothing this would still be non-fatal, but
        // here it returns without shelling out at all.
        stage.after_run(&ctx).await.unwrap();
    }
}
