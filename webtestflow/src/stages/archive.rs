//! Report archival stage.
//!
//! Collects the suite reports, computes the union verdict, renders the
//! summary entry page and zips the whole output directory for the hosting
//! CI system to pick up.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;

use crate::context::RunContext;
use crate::errors::Result;
use crate::helpers;
use crate::process::{self, ExecOptions};
use crate::report::{self, TestReport};
use crate::stages::{CommandTemplate, SkipPredicate, Stage};

#[derive(Debug, Default)]
struct ArchiveState {
    output_zip: PathBuf,
    index_html: PathBuf,
    index_html_data: PathBuf,
    run_record: PathBuf,
}

/// Archives the run's artifacts and reports.
#[derive(Debug)]
pub struct ArchiveStage {
    name: String,
    skip: SkipPredicate,
    unit_stage_name: String,
    e2e_stage_name: String,
    compress_cmd: Option<CommandTemplate>,
    state: RwLock<ArchiveState>,
}

impl Default for ArchiveStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveStage {
    /// Creates the stage with its default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "archive".to_string(),
            skip: SkipPredicate::default(),
            unit_stage_name: "unit-test".to_string(),
            e2e_stage_name: "e2e-test".to_string(),
            compress_cmd: None,
            state: RwLock::new(ArchiveState::default()),
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

    /// Points the stage at differently-named test stages.
    #[must_use]
    pub fn with_stage_names(mut self, unit: impl Into<String>, e2e: impl Into<String>) -> Self {
        self.unit_stage_name = unit.into();
        self.e2e_stage_name = e2e.into();
        self
    }

    /// Overrides the external compression command (run inside the output
    /// directory).
    #[must_use]
    pub fn with_compress_cmd(mut self, cmd: impl Into<CommandTemplate>) -> Self {
        self.compress_cmd = Some(cmd.into());
        self
    }

    fn stage_should_run(&self, ctx: &RunContext, stage_name: &str) -> bool {
        ctx.stage(stage_name)
            .is_some_and(|stage| stage.should_run(ctx))
    }

    fn report_dir(ctx: &RunContext, param_key: &str, default: &str) -> PathBuf {
        let relative = ctx
            .param(param_key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_string());
        ctx.output_path().join(relative)
    }

    fn collect_reports(&self, ctx: &RunContext) -> (TestReport, TestReport) {
        let unit_dir = Self::report_dir(ctx, "unitTestRelativePathToOutput", "unit_test_report");
        let e2e_dir = Self::report_dir(ctx, "e2eTestRelativePathToOutput", "e2e_test_report");

        let unit = report::load_report(
            "unit tests",
            self.stage_should_run(ctx, &self.unit_stage_name),
            &crate::stages::unit_test::report_file(&unit_dir),
        );
        let e2e = report::load_report(
            "e2e tests",
            self.stage_should_run(ctx, &self.e2e_stage_name),
            &crate::stages::e2e_test::report_file(&e2e_dir),
        );

        (unit, e2e)
    }

    fn page_data(
        &self,
        ctx: &RunContext,
        unit: &TestReport,
        e2e: &TestReport,
    ) -> serde_json::Value {
        let mut downloads = vec!["output.zip".to_string(), "run-record.json".to_string()];
        if self.stage_should_run(ctx, &self.e2e_stage_name) {
            if let Some(config_file) = ctx
                .param("proxyConfigFileName")
                .and_then(|v| v.as_str().map(String::from))
            {
                downloads.push(config_file);
            }
        }

        serde_json::json!({
            "totalCost": format!("{}s", ctx.elapsed().as_secs_f64()),
            "seqId": ctx.seq_id(),
            "unitTest": unit,
            "e2eTest": e2e,
            "downloads": downloads,
        })
    }

    fn render_index_html(data: &serde_json::Value) -> String {
        let mut html = String::new();
        html.push_str("<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>web test report</title></head>\n<body>\n");
        html.push_str("<h1>web test report</h1>\n");
        html.push_str(&format!(
            "<p>run {} finished in {}</p>\n",
            data["seqId"].as_str().unwrap_or_default(),
            data["totalCost"].as_str().unwrap_or_default(),
        ));

        html.push_str("<ul>\n");
        for (report, dir) in [
            (&data["unitTest"], "unit_test_report"),
            (&data["e2eTest"], "e2e_test_report"),
        ] {
            html.push_str(&format!(
                "<li>{} — <a href=\"{dir}/mochawesome.html\">report</a>, <a href=\"{dir}/coverage/index.html\">coverage</a></li>\n",
                report["summary"].as_str().unwrap_or_default(),
            ));
        }
        html.push_str("</ul>\n");

        html.push_str("<ul>\n");
        if let Some(downloads) = data["downloads"].as_array() {
            for item in downloads {
                let target = item.as_str().unwrap_or_default();
                html.push_str(&format!("<li><a href=\"{target}\">{target}</a></li>\n"));
            }
        }
        html.push_str("</ul>\n</body>\n</html>\n");
        html
    }

    fn save_entry_page(&self, ctx: &RunContext, data: &serde_json::Value) -> Result<()> {
        let state = self.state.read();
        std::fs::create_dir_all(ctx.output_path())?;
        std::fs::write(&state.index_html, Self::render_index_html(data))?;
        std::fs::write(&state.index_html_data, serde_json::to_string_pretty(data)?)?;
        Ok(())
    }

    fn save_run_record(&self, ctx: &RunContext) -> Result<()> {
        let state = self.state.read();
        std::fs::write(
            &state.run_record,
            serde_json::to_string_pretty(&ctx.snapshot())?,
        )?;
        Ok(())
    }

    /// Zips the output directory via an external command, staging the
    /// archive in the base directory so it never includes itself.
    async fn compress_output(&self, ctx: &RunContext) -> Result<()> {
        let staging = ctx.base_path().join("output.zip");

        let command = match &self.compress_cmd {
            Some(cmd) => cmd.resolve(ctx),
            None => format!("zip -qr {} .", staging.display()),
        };

        process::run_by_exec(&command, &ExecOptions::in_dir(ctx.output_path()), None).await?;

        if staging.exists() {
            std::fs::rename(&staging, &self.state.read().output_zip)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for ArchiveStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &RunContext) -> Result<()> {
        let output = ctx.output_path().to_path_buf();

        {
            let mut state = self.state.write();
            state.output_zip = output.join("output.zip");
            state.index_html = output.join("index.html");
            state.index_html_data = output.join("index-html.json");
            state.run_record = output.join("run-record.json");
        }

        ctx.add_params(serde_json::json!({
            "archiveConfig": {
                "path": helpers::relative_path(ctx.workspace_path(), &output)
                    .display()
                    .to_string(),
                "entryFile": "index.html",
            },
            "outputZipRelativePath":
                helpers::relative_path(ctx.workspace_path(), &output.join("output.zip"))
                    .display()
                    .to_string(),
        }));
        Ok(())
    }

    async fn before_run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(output = %ctx.output_path().display(), "clearing output directory");
        if let Err(err) = std::fs::remove_dir_all(ctx.output_path()) {
            tracing::debug!(error = %err, "output directory not removed");
        }
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(stage = %self.name, "archiving run artifacts");

        let (unit, e2e) = self.collect_reports(ctx);
        let (verdict, summary) = report::union_verdict(&[&unit, &e2e]);

        ctx.add_params(serde_json::json!({
            "unitTest": &unit,
            "e2eTest": &e2e,
            "unionResult": {
                "result": verdict.code(),
                "summary": summary,
            },
        }));

        let data = self.page_data(ctx, &unit, &e2e);
        self.save_entry_page(ctx, &data)?;
        self.save_run_record(ctx)?;
        self.compress_output(ctx).await?;

        tracing::info!(stage = %self.name, verdict = verdict.code(), "archive complete");
        Ok(())
    }

    fn should_run(&self, ctx: &RunContext) -> bool {
        self.skip.should_run(ctx)
    }
}
