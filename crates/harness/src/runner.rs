//! Scenario orchestration: project, server, browser, assertions, cleanup

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserKind, BrowserLauncher};
use crate::error::{HarnessResult, ScenarioError};
use crate::form::{FormDriver, FormTestConfig, FormTestResult};
use crate::server::{CapturedOutput, ServerLauncher};
use crate::spec::{Expectations, ScenarioSpec};
use crate::termination::StopOutcome;
use crate::workspace::Workspace;

/// File written by [`ScenarioRunner::write_results`]
pub const RESULTS_FILE: &str = "scenario-results.json";

/// Stage a scenario failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStage {
    Validate,
    Acquire,
    Start,
    Browser,
    Assert,
    Cleanup,
}

impl fmt::Display for ScenarioStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioStage::Validate => "validate",
            ScenarioStage::Acquire => "acquire project",
            ScenarioStage::Start => "start server",
            ScenarioStage::Browser => "browser",
            ScenarioStage::Assert => "assert",
            ScenarioStage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

type StageError = (ScenarioStage, ScenarioError);

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<ScenarioStage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Cleanup failures; reported next to, never instead of, `error`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<FormTestResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopOutcome>,

    /// Server output tails, kept for failed scenarios
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output: Option<CapturedOutput>,
}

impl ScenarioReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            started_at: Utc::now(),
            duration_ms: 0,
            failed_stage: None,
            error: None,
            cleanup_errors: Vec::new(),
            port: None,
            form: None,
            stop: None,
            server_output: None,
        }
    }

    fn fail(&mut self, stage: ScenarioStage, error: &ScenarioError) {
        self.failed_stage = Some(stage);
        self.error = Some(error.to_string());
    }

    fn finish(mut self, started: Instant) -> Self {
        if self.failed_stage.is_none() && !self.cleanup_errors.is_empty() {
            self.failed_stage = Some(ScenarioStage::Cleanup);
            self.error = Some(self.cleanup_errors.join("; "));
        }
        self.success = self.failed_stage.is_none();
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Result of running a list of scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Overrides applied to every scenario in a run
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Use this project directory instead of the scenario's own
    pub project_dir: Option<PathBuf>,

    /// Force a browser engine
    pub browser: Option<BrowserKind>,

    /// Show the browser window
    pub headed: bool,

    /// Save failure screenshots here as `<scenario>.png`
    pub screenshot_dir: Option<PathBuf>,
}

/// Runs scenarios end to end
pub struct ScenarioRunner<L> {
    driver: FormDriver<L>,
    config: RunnerConfig,
}

impl<L: BrowserLauncher> ScenarioRunner<L> {
    pub fn new(launcher: L, config: RunnerConfig) -> Self {
        Self {
            driver: FormDriver::new(launcher),
            config,
        }
    }

    /// Run scenarios one after another
    pub async fn run_suite(&self, specs: &[ScenarioSpec]) -> SuiteReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(%run_id, "Running {} scenario(s)...", specs.len());

        let mut scenarios = Vec::with_capacity(specs.len());
        for spec in specs {
            let report = self.run(spec).await;
            if report.success {
                info!("✓ {} ({} ms)", report.name, report.duration_ms);
            } else {
                error!(
                    "✗ {} failed at {}: {}",
                    report.name,
                    report.failed_stage.unwrap_or(ScenarioStage::Cleanup),
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
            scenarios.push(report);
        }

        let passed = scenarios.iter().filter(|r| r.success).count();
        let failed = scenarios.len() - passed;
        let duration_ms = start.elapsed().as_millis() as u64;

        info!("Scenario results: {} passed, {} failed ({} ms)", passed, failed, duration_ms);

        SuiteReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total: scenarios.len(),
            passed,
            failed,
            duration_ms,
            scenarios,
        }
    }

    /// Run one scenario. Cleanup always runs; its errors are aggregated
    /// without replacing the original failure.
    pub async fn run(&self, spec: &ScenarioSpec) -> ScenarioReport {
        let start = Instant::now();
        let mut report = ScenarioReport::new(&spec.name);
        debug!("Running scenario: {}", spec.name);

        if let Err(e) = spec.validate() {
            report.fail(ScenarioStage::Validate, &ScenarioError::Spec(e));
            return report.finish(start);
        }

        let workspace = match self.acquire(spec).await {
            Ok(workspace) => workspace,
            Err(e) => {
                report.fail(ScenarioStage::Acquire, &e);
                return report.finish(start);
            }
        };

        if let Err((stage, e)) = self.exercise(spec, workspace.root(), &mut report).await {
            report.fail(stage, &e);
        }

        if let Err(e) = workspace.cleanup() {
            report.cleanup_errors.push(format!("project cleanup: {}", e));
        }

        report.finish(start)
    }

    async fn acquire(&self, spec: &ScenarioSpec) -> Result<Workspace, ScenarioError> {
        if let Some(dir) = &self.config.project_dir {
            return Workspace::existing(dir);
        }
        match &spec.project {
            Some(source) => Workspace::acquire(source, &spec.base_dir()).await,
            None => Err(ScenarioError::Workspace(
                "no project: set `project` in the scenario or pass a project directory".to_string(),
            )),
        }
    }

    async fn exercise(&self, spec: &ScenarioSpec, project_dir: &Path, report: &mut ScenarioReport) -> Result<(), StageError> {
        let launcher = ServerLauncher::new(spec.server.clone());
        let mut server = launcher
            .start(project_dir)
            .await
            .map_err(|e| (ScenarioStage::Start, ScenarioError::Start(e)))?;
        report.port = Some(server.port());

        let form = self.driver.run(self.form_config(spec, &server.base_url())).await;
        let verdict = check_expectations(&spec.expect, &form);
        report.form = Some(form);
        if verdict.is_err() {
            report.server_output = Some(server.output());
        }

        match launcher.stop(&mut server).await {
            Ok(outcome) => report.stop = Some(outcome),
            Err(e) => {
                warn!("{}", e);
                report.cleanup_errors.push(format!("server stop: {}", e));
            }
        }

        verdict
    }

    fn form_config(&self, spec: &ScenarioSpec, base_url: &str) -> FormTestConfig {
        let mut config = spec.form.clone().with_base_url(base_url);
        if let Some(browser) = self.config.browser {
            config.browser = browser;
        }
        if self.config.headed {
            config.launch.headless = false;
        }
        if config.screenshot_on_failure.is_none() {
            if let Some(dir) = &self.config.screenshot_dir {
                config.screenshot_on_failure = Some(dir.join(format!("{}.png", sanitize(&spec.name))));
            }
        }
        config
    }

    /// Write suite results to `<output_dir>/scenario-results.json`
    pub fn write_results(&self, report: &SuiteReport, output_dir: &Path) -> HarnessResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let path = output_dir.join(RESULTS_FILE);
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Compare a form result with the scenario's expectations
pub fn check_expectations(expect: &Expectations, form: &FormTestResult) -> Result<(), StageError> {
    if form.success != expect.success {
        return Err(if expect.success {
            let error = form.error.clone().unwrap_or_else(|| "form scenario failed".to_string());
            let error = match form.failed_stage {
                Some(stage) => format!("{} failed: {}", stage, error),
                None => error,
            };
            (ScenarioStage::Browser, ScenarioError::Form(error))
        } else {
            (
                ScenarioStage::Assert,
                ScenarioError::Expectation("expected the form scenario to fail, but it succeeded".to_string()),
            )
        });
    }

    if !expect.success {
        return Ok(());
    }

    if let Some(expected) = &expect.retrieved_text {
        let expected = expected.trim();
        match form.retrieved_text.as_deref().map(str::trim) {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return Err((
                    ScenarioStage::Assert,
                    ScenarioError::Expectation(format!("retrieved text {:?}, expected {:?}", actual, expected)),
                ))
            }
            None => {
                return Err((
                    ScenarioStage::Assert,
                    ScenarioError::Expectation(format!("no result text retrieved, expected {:?}", expected)),
                ))
            }
        }
    }

    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
