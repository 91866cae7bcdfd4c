//! The shared mutable record threaded through every pipeline phase.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::Result;
use crate::helpers;
use crate::lease::LeaseStore;
use crate::ports::{self, DEFAULT_START_PORT};
use crate::stages::Stage;

/// Construction options for a [`RunContext`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Artifact output directory, resolved against the base path.
    pub output_path: PathBuf,
    /// Workspace (repository) root, resolved against the base path.
    pub workspace_path: PathBuf,
    /// Developer mode: stable run id, installs skipped, no teardown phase.
    pub is_dev: bool,
    /// Lease store override; defaults to the per-user store.
    pub lease_store: Option<LeaseStore>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("output"),
            workspace_path: PathBuf::from("../../"),
            is_dev: false,
            lease_store: None,
        }
    }
}

/// The per-invocation record shared by all stages.
///
/// Constructed once by the pipeline engine before any stage executes.
/// Stages mutate it only additively: registering themselves, exporting
/// parameters for downstream stages and the hosting CI system, and
/// acquiring leases through it. The run identifier is assigned at
/// construction and immutable afterwards; it is the join key into the
/// lease store and the namespacing token for spawned processes.
#[derive(Debug)]
pub struct RunContext {
    base_path: PathBuf,
    output_path: PathBuf,
    workspace_path: PathBuf,
    is_dev: bool,
    seq_id: String,
    leases: Arc<LeaseStore>,
    stages: DashMap<String, Arc<dyn Stage>>,
    params: RwLock<serde_json::Map<String, serde_json::Value>>,
    started_at: Instant,
}

impl RunContext {
    /// Creates a context rooted at `base_path`.
    ///
    /// Relative option paths are resolved against the base path, and the
    /// initial exported parameters (output path and the workspace-relative
    /// locations a CI system needs) are seeded.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>, options: RunOptions) -> Self {
        let base_path = base_path.into();
        let base_path = if base_path.is_absolute() {
            helpers::normalize(&base_path)
        } else {
            let cwd = std::env::current_dir().unwrap_or_default();
            helpers::absolute_path(&cwd, base_path)
        };
        let output_path = helpers::absolute_path(&base_path, &options.output_path);
        let workspace_path = helpers::absolute_path(&base_path, &options.workspace_path);
        let seq_id = helpers::seq_id(&base_path, options.is_dev);

        let leases = Arc::new(options.lease_store.unwrap_or_default());

        let mut params = serde_json::Map::new();
        params.insert(
            "outputPath".to_string(),
            serde_json::json!(output_path.display().to_string()),
        );
        params.insert(
            "outputRelativePath".to_string(),
            serde_json::json!(helpers::relative_path(&workspace_path, &output_path)
                .display()
                .to_string()),
        );
        params.insert(
            "baseRelativePath".to_string(),
            serde_json::json!(helpers::relative_path(&workspace_path, &base_path)
                .display()
                .to_string()),
        );

        Self {
            base_path,
            output_path,
            workspace_path,
            is_dev: options.is_dev,
            seq_id,
            leases,
            stages: DashMap::new(),
            params: RwLock::new(params),
            started_at: Instant::now(),
        }
    }

    /// The base path the pipeline runs from.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The artifact output directory.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// The workspace (repository) root.
    #[must_use]
    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// Whether this is a developer-mode run.
    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.is_dev
    }

    /// The immutable run identifier.
    #[must_use]
    pub fn seq_id(&self) -> &str {
        &self.seq_id
    }

    /// The lease store this run records its ports and PIDs in.
    #[must_use]
    pub fn leases(&self) -> &Arc<LeaseStore> {
        &self.leases
    }

    /// Time elapsed since the context was constructed.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Registers a stage under its name so other stages can look it up.
    pub fn register_stage(&self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    /// Looks up a previously-registered stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).map(|entry| entry.value().clone())
    }

    /// Additively merges exported parameters.
    ///
    /// Nested objects merge key by key; unrelated keys are never
    /// overwritten. Non-object values are ignored (logged).
    pub fn add_params(&self, values: serde_json::Value) {
        match values {
            serde_json::Value::Object(incoming) => {
                helpers::merge_json(&mut self.params.write(), incoming);
            }
            other => {
                tracing::debug!(?other, "ignoring non-object parameter export");
            }
        }
    }

    /// A copy of the accumulated exported parameters.
    #[must_use]
    pub fn params(&self) -> serde_json::Map<String, serde_json::Value> {
        self.params.read().clone()
    }

    /// Reads one exported parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<serde_json::Value> {
        self.params.read().get(key).cloned()
    }

    /// Finds a free port for `name`, excluding every port leased by any
    /// run on this machine, and persists the acquisition.
    ///
    /// # Errors
    ///
    /// Propagates port exhaustion and lease-store write failures.
    pub async fn find_available_port(&self, name: &str) -> Result<u16> {
        let used = self.leases.used_ports();
        let port = ports::find_available_port(DEFAULT_START_PORT, &used).await?;

        self.leases
            .acquire_port(name, port, &self.seq_id, &self.base_path)?;

        tracing::info!(name, port, "acquired port");
        Ok(port)
    }

    /// Records the PID now using a previously-acquired port.
    ///
    /// # Errors
    ///
    /// Propagates lease-store write failures.
    pub fn lock_port(&self, name: &str, pid: u32) -> Result<()> {
        self.leases.record_pid(name, pid, &self.seq_id)
    }

    /// A JSON view of the context for archival.
    ///
    /// Only paths, flags, the run identifier, stage names and the exported
    /// parameters are serialized; live handles (stage objects, process
    /// references) never appear.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        let mut stage_names: Vec<String> =
            self.stages.iter().map(|entry| entry.key().clone()).collect();
        stage_names.sort();

        serde_json::json!({
            "basePath": self.base_path.display().to_string(),
            "outputPath": self.output_path.display().to_string(),
            "workspacePath": self.workspace_path.display().to_string(),
            "isDev": self.is_dev,
            "seqId": self.seq_id,
            "stages": stage_names,
            "params": serde_json::Value::Object(self.params()),
            "totalCostMs": self.elapsed().as_millis() as u64,
        })
    }
}
