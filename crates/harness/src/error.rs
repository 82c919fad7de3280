//! Error types for the harness
//!
//! Operational failures (a server that never becomes ready, a browser stage
//! that fails) are ordinary values the orchestrator reports. Broken internal
//! invariants are kept in their own class, [`InvariantViolation`], so callers
//! can tell a misbehaving server apart from a harness bug.

use std::path::PathBuf;

use thiserror::Error;

use crate::form::FormStage;
use crate::process::ExitInfo;
use crate::termination::TerminationSignal;

/// The child could not be spawned at all.
#[derive(Error, Debug)]
#[error("failed to spawn `{program}` in {}: {source}", working_dir.display())]
pub struct SpawnError {
    pub program: String,
    pub working_dir: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Programming errors. These never come from a misbehaving child process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("outcome slot for pid {pid} resolved twice")]
    DoubleResolution { pid: u32 },

    #[error("readiness events for pid {pid} ended without a terminal state")]
    UnresolvedReadiness { pid: u32 },
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("server wrote {marker:?} to stderr before becoming ready: {stderr}")]
    FailureOutput { marker: String, stderr: String },

    #[error("server exited before becoming ready ({exit})")]
    ExitedPrematurely {
        exit: ExitInfo,
        stdout: String,
        stderr: String,
    },

    #[error("server did not report readiness within {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        stdout: String,
        stderr: String,
    },

    #[error("health check {url} failed after {attempts} attempts")]
    HealthCheck { url: String, attempts: usize },

    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl StartError {
    /// True for harness bugs as opposed to server misbehaviour.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, StartError::Invariant(_))
    }

    /// Output the server produced before the failure, if any was captured.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            StartError::ExitedPrematurely { stdout, stderr, .. }
            | StartError::Timeout { stdout, stderr, .. } => Some((stdout, stderr)),
            StartError::FailureOutput { stderr, .. } => Some(("", stderr)),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum StopError {
    #[error("could not stop process {pid}: still running after {signals:?} ({waited_ms}ms)")]
    EscalationExhausted {
        pid: u32,
        signals: Vec<TerminationSignal>,
        waited_ms: u64,
    },
}

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Playwright not available: {0}")]
    Unavailable(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("{op} timed out after {timeout_ms}ms")]
    Timeout { op: String, timeout_ms: u64 },

    #[error("{op} failed: {message}")]
    Operation { op: String, message: String },

    #[error("browser bridge closed")]
    BridgeClosed,

    #[error("bridge protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrowserError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserError::Timeout { .. })
    }
}

/// Why a form scenario run failed. Each variant names the selector or URL involved.
#[derive(Error, Debug)]
pub enum FormFailure {
    #[error("{0}")]
    Launch(BrowserError),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("form not found: {selector}")]
    FormNotFound { selector: String },

    #[error("field not found: {selector}")]
    FieldNotFound { selector: String },

    #[error("could not fill {selector}: {reason}")]
    Fill { selector: String, reason: String },

    #[error("submit control not found: {selector}")]
    SubmitNotFound { selector: String },

    #[error("could not click {selector}: {reason}")]
    Click { selector: String, reason: String },

    #[error("success indicator not found: {indicator} within {timeout_ms}ms")]
    IndicatorTimeout { indicator: String, timeout_ms: u64 },

    #[error("success indicator was already present before submission and did not change: {indicator}")]
    StaleSuccessIndicator { indicator: String },

    #[error("browser error during {stage}: {source}")]
    Browser {
        stage: FormStage,
        #[source]
        source: BrowserError,
    },
}

impl FormFailure {
    pub fn stage(&self) -> FormStage {
        match self {
            FormFailure::Launch(_) => FormStage::Launch,
            FormFailure::Navigation { .. } => FormStage::Navigate,
            FormFailure::FormNotFound { .. } => FormStage::Scope,
            FormFailure::FieldNotFound { .. } | FormFailure::Fill { .. } => FormStage::Fill,
            FormFailure::SubmitNotFound { .. } | FormFailure::Click { .. } => FormStage::Submit,
            FormFailure::IndicatorTimeout { .. } | FormFailure::StaleSuccessIndicator { .. } => FormStage::Verify,
            FormFailure::Browser { stage, .. } => *stage,
        }
    }
}

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("scenario not found: {0}")]
    NotFound(String),

    #[error("invalid scenario {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure of one scenario stage, as reported by the orchestrator
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("project setup failed: {0}")]
    Workspace(String),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("{0}")]
    Form(String),

    #[error("expectation not met: {0}")]
    Expectation(String),
}

/// Aggregate error for callers that drive the whole harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
