//! Run Command
//!
//! Loads scenario files, runs them one after another and reports per
//! scenario which stage failed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use formprobe_harness::runner::ScenarioReport;
use formprobe_harness::{BrowserKind, RunnerConfig, ScenarioRunner, ScenarioSpec, SuiteReport};
use tracing::debug;

use super::BridgeArgs;
use crate::output::{print_document, print_info, print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scenario files or directories of scenarios
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Only run scenarios with this tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Only run the scenario with this name
    #[arg(long)]
    pub name: Option<String>,

    /// Use this project directory for every scenario
    #[arg(long)]
    pub project_dir: Option<PathBuf>,

    /// Browser engine (chromium, firefox, webkit)
    #[arg(long, env = "FORMPROBE_BROWSER")]
    pub browser: Option<BrowserKind>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Write scenario-results.json into this directory
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Save failure screenshots into this directory
    #[arg(long)]
    pub screenshots: Option<PathBuf>,

    #[command(flatten)]
    pub bridge: BridgeArgs,
}

impl TableDisplay for ScenarioReport {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Result", "Failed Stage", "Duration", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        let result = if self.success {
            "✓ pass".green().to_string()
        } else {
            "✗ fail".red().to_string()
        };
        let detail = match (&self.error, self.form.as_ref().and_then(|f| f.retrieved_text.as_ref())) {
            (Some(error), _) => error.clone(),
            (None, Some(text)) => format!("retrieved {:?}", text.trim()),
            (None, None) => String::new(),
        };
        vec![
            self.name.clone(),
            result,
            self.failed_stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            format!("{} ms", self.duration_ms),
            detail,
        ]
    }
}

/// Returns whether every selected scenario passed.
pub async fn execute(args: RunArgs, format: OutputFormat) -> Result<bool> {
    let specs = ScenarioSpec::load_paths(&args.paths).context("Failed to load scenarios")?;
    let selected = select(specs, args.tag.as_deref(), args.name.as_deref());
    if selected.is_empty() {
        anyhow::bail!("no scenarios matched in {}", describe_paths(&args.paths));
    }
    debug!("Selected {} scenario(s)", selected.len());

    let config = RunnerConfig {
        project_dir: args.project_dir,
        browser: args.browser,
        headed: args.headed,
        screenshot_dir: args.screenshots,
    };
    let runner = ScenarioRunner::new(args.bridge.bridge(), config);
    let report = runner.run_suite(&selected).await;

    match format {
        OutputFormat::Table => print_list(&report.scenarios, format),
        _ => print_document(&report, format),
    }

    if let Some(dir) = &args.output {
        let path = runner
            .write_results(&report, dir)
            .with_context(|| format!("Failed to write results to {}", dir.display()))?;
        print_info(&format!("Results written to {}", path.display()));
    }

    summarize(&report);
    Ok(report.success())
}

fn select(specs: Vec<ScenarioSpec>, tag: Option<&str>, name: Option<&str>) -> Vec<ScenarioSpec> {
    specs
        .into_iter()
        .filter(|spec| tag.map_or(true, |tag| spec.tags.iter().any(|t| t == tag)))
        .filter(|spec| name.map_or(true, |name| spec.name == name))
        .collect()
}

fn describe_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn summarize(report: &SuiteReport) {
    if report.success() {
        print_success(&format!("{} scenario(s) passed in {} ms", report.passed, report.duration_ms));
    } else {
        print_warning(&format!(
            "{} of {} scenario(s) failed",
            report.failed.to_string().red(),
            report.total
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, tags: &[&str]) -> ScenarioSpec {
        let yaml = format!(
            r##"
name: {name}
tags: [{tags}]
form:
  url: /
  fields: []
  submit_selector: "#go"
  success_indicator:
    element_selector: "#done"
"##,
            tags = tags.join(", ")
        );
        ScenarioSpec::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_select_by_tag_and_name() {
        let specs = vec![spec("a", &["smoke"]), spec("b", &["smoke", "spa"]), spec("c", &[])];

        let smoke = select(specs.clone(), Some("smoke"), None);
        assert_eq!(smoke.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let named = select(specs.clone(), Some("smoke"), Some("b"));
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].name, "b");

        assert_eq!(select(specs, None, None).len(), 3);
    }

    #[test]
    fn test_report_row_shows_failed_stage() {
        let yaml = r#"
name: echo
success: false
started_at: "2024-01-01T00:00:00Z"
duration_ms: 12
failed_stage: start
error: server did not report readiness within 300ms
"#;
        let report: ScenarioReport = serde_yaml::from_str(yaml).unwrap();
        let row = report.row();
        assert_eq!(row[0], "echo");
        assert_eq!(row[2], "start server");
        assert!(row[4].contains("readiness"));
    }
}
