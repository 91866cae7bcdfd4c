//! Test report summarization.
//!
//! Reports are the mochawesome-shaped JSON files the external test runners
//! drop into the output tree. A missing file is not an error: it becomes a
//! "no report produced" summary, distinct from "configured not to run".
//! A *present* report fails on nonzero failure or timeout-skip counts.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Execution counters from a runner report.
///
/// `pending` counts cases skipped on purpose (`it.skip`), `skipped` counts
/// cases that never executed because of timeouts or crashes; only the
/// latter is a failure signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportStats {
    /// Total registered cases.
    pub tests_registered: u64,
    /// Cases that passed.
    pub passes: u64,
    /// Cases that failed.
    pub failures: u64,
    /// Cases deliberately skipped.
    pub pending: u64,
    /// Cases lost to timeouts or crashes.
    pub skipped: u64,
    /// Total duration in milliseconds.
    pub duration: u64,
}

/// A summarized test report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// Human-readable suite name.
    pub name: String,
    /// The raw stats, when a report file was present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReportStats>,
    /// Pass rate over registered cases, two decimals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_percent: Option<String>,
    /// Pass rate over executed cases (passes + failures), two decimals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_success_percent: Option<String>,
    /// Rendered duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// One-line summary.
    pub summary: String,
}

impl TestReport {
    /// A suite that was configured not to run.
    #[must_use]
    pub fn disabled(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stats: None,
            pass_percent: None,
            actual_success_percent: None,
            duration: None,
            summary: format!("{name} was configured not to run"),
        }
    }

    /// A suite that ran but left no report file behind.
    #[must_use]
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stats: None,
            pass_percent: None,
            actual_success_percent: None,
            duration: None,
            summary: format!("{name} failed: no test report was produced"),
        }
    }

    /// Summarizes a parsed report.
    #[must_use]
    pub fn from_stats(name: &str, stats: ReportStats) -> Self {
        let pass_percent = percent_show(ratio(stats.passes, stats.tests_registered));
        let actual_success_percent =
            percent_show(ratio(stats.passes, stats.passes + stats.failures));
        let duration = duration_show(stats.duration);

        let summary = format!(
            "{name} pass rate: {pass_percent}% ({passes}/{registered}), \
             actual success rate: {actual_success_percent}% ({passes}/({passes}+{failures})), \
             duration {duration}, total {registered}, passed {passes}, failed {failures}, \
             pending {pending}, skipped {skipped}",
            passes = stats.passes,
            registered = stats.tests_registered,
            failures = stats.failures,
            pending = stats.pending,
            skipped = stats.skipped,
        );

        Self {
            name: name.to_string(),
            stats: Some(stats),
            pass_percent: Some(pass_percent),
            actual_success_percent: Some(actual_success_percent),
            duration: Some(duration),
            summary,
        }
    }

    /// Whether a present report carries a failing verdict.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.stats
            .is_some_and(|stats| stats.failures != 0 || stats.skipped != 0)
    }
}

/// The aggregated verdict over every suite in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionVerdict {
    /// Every suite ran and passed.
    Passed,
    /// At least one present report failed.
    Failed,
    /// At least one suite was skipped or reportless, none failed.
    Partial,
}

impl UnionVerdict {
    /// Numeric code exported to the hosting CI system (0 pass, 1 fail,
    /// 2 partial).
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Partial => 2,
        }
    }
}

/// Combines suite reports into the union verdict and its summary text.
#[must_use]
pub fn union_verdict(reports: &[&TestReport]) -> (UnionVerdict, String) {
    let mut verdict = UnionVerdict::Passed;
    let mut summary = String::new();

    for report in reports {
        if report.stats.is_none() {
            verdict = UnionVerdict::Partial;
            summary.push_str(&report.summary);
            summary.push('\n');
        }
    }

    for report in reports {
        if report.is_failing() {
            verdict = UnionVerdict::Failed;
            summary.push_str(&format!("{} did not pass\n", report.name));
        }
    }

    (verdict, summary)
}

/// Loads and summarizes a report file.
///
/// `should_run = false` short-circuits to a "configured not to run"
/// summary; a missing or unreadable file becomes "no report produced".
#[must_use]
pub fn load_report(name: &str, should_run: bool, path: &Path) -> TestReport {
    if !should_run {
        return TestReport::disabled(name);
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return TestReport::missing(name),
    };

    #[derive(Deserialize)]
    struct RawReport {
        #[serde(default)]
        stats: ReportStats,
    }

    match serde_json::from_str::<RawReport>(&raw) {
        Ok(report) => TestReport::from_stats(name, report.stats),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable test report");
            TestReport::missing(name)
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 * 100.0 / denominator as f64
}

/// Renders a percentage with two decimals.
#[must_use]
pub fn percent_show(percent: f64) -> String {
    format!("{percent:.2}")
}

/// Renders a millisecond duration: fractional seconds below one minute,
/// minutes plus fractional seconds above.
#[must_use]
pub fn duration_show(duration_ms: u64) -> String {
    const ONE_SECOND: u64 = 1000;
    const ONE_MINUTE: u64 = 60 * ONE_SECOND;

    if duration_ms < ONE_MINUTE {
        format!("{}s", duration_ms as f64 / ONE_SECOND as f64)
    } else {
        let minutes = duration_ms / ONE_MINUTE;
        let seconds = (duration_ms - minutes * ONE_MINUTE) as f64 / ONE_SECOND as f64;
        format!("{minutes}m{seconds}s")
    }
}
