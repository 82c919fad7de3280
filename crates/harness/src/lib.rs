//! formprobe harness
//!
//! End-to-end harness for generated web applications:
//! - Spawns the server as a subprocess and waits for its readiness line
//! - Stops it with an escalating signal policy
//! - Drives a browser through a form submission via a Playwright bridge
//! - Runs declarative YAML scenarios and reports per-stage results
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ScenarioRunner (orchestrator)               │
//! │    acquire project ─▶ start ─▶ run form ─▶ assert ─▶ stop    │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  ServerLauncher              │  FormDriver                  │
//! │    ├── ProcessHandle         │    └── BrowserLauncher       │
//! │    ├── ReadinessDetector     │          ├── PlaywrightBridge│
//! │    └── TerminationController │          └── (test doubles)  │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The three entry points most callers need are [`start_server`],
//! [`stop_server`] and [`run_form_scenario`].

use std::path::Path;

pub mod browser;
pub mod error;
pub mod form;
pub mod process;
pub mod readiness;
pub mod runner;
pub mod server;
pub mod spec;
pub mod termination;
pub mod workspace;

pub use browser::{BrowserKind, BrowserLauncher, BrowserPage, LaunchOptions, PlaywrightBridge};
pub use error::{
    BrowserError, FormFailure, HarnessError, HarnessResult, InvariantViolation, ScenarioError, SpawnError, SpecError,
    StartError, StopError,
};
pub use form::{FieldInput, FormDriver, FormTestConfig, FormTestResult, SuccessIndicator};
pub use readiness::{ReadinessOutcome, ReadinessPattern};
pub use runner::{RunnerConfig, ScenarioReport, ScenarioRunner, SuiteReport};
pub use server::{RunningServer, ServerConfig, ServerLauncher};
pub use spec::ScenarioSpec;
pub use termination::{EscalationStep, StopOutcome, TerminationPolicy, TerminationSignal};

/// Start the server in `project_dir` and wait until it announces its port.
pub async fn start_server(project_dir: &Path, config: &ServerConfig) -> Result<RunningServer, StartError> {
    ServerLauncher::new(config.clone()).start(project_dir).await
}

/// Stop a server started with [`start_server`]. A second call is a no-op.
pub async fn stop_server(server: &mut RunningServer) -> Result<StopOutcome, StopError> {
    server.stop().await
}

/// Run one form scenario with the Playwright bridge configured from the
/// environment.
pub async fn run_form_scenario(config: FormTestConfig) -> FormTestResult {
    FormDriver::new(PlaywrightBridge::from_env()).run(config).await
}
