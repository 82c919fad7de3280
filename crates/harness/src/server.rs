//! Server lifecycle - spawning, readiness and shutdown of the server under test

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{InvariantViolation, StartError, StopError};
use crate::process::{ExitInfo, ProcessCommand, ProcessEvent, ProcessHandle};
use crate::readiness::{ReadinessDetector, ReadinessOutcome, ReadinessPattern, StartFailure, DEFAULT_READINESS_TEMPLATE};
use crate::termination::{StopOutcome, TerminationController, TerminationPolicy};

/// Per-stream cap on output kept after startup
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for launching a server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Program that starts the server, run inside the project directory
    pub program: String,

    pub args: Vec<String>,

    /// Extra environment for the server process
    pub env: BTreeMap<String, String>,

    /// Port handed to the server as `PORT` (None = the server picks)
    pub port: Option<u16>,

    /// Readiness line, with `{port}` where the port number appears
    pub readiness_template: String,

    /// Case-insensitive stderr substrings that mean startup failed
    pub failure_markers: Vec<String>,

    /// Deadline for the readiness line (and the health check, if any)
    pub startup_timeout_ms: u64,

    /// Escalation used by `stop` and to clean up failed starts
    pub termination: TerminationPolicy,

    /// Optional path polled over HTTP after the readiness line
    pub health_path: Option<String>,

    /// Run the server in its own process group and signal the group
    pub process_group: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["server.js".to_string()],
            env: BTreeMap::new(),
            port: None,
            readiness_template: DEFAULT_READINESS_TEMPLATE.to_string(),
            failure_markers: vec!["error".to_string()],
            startup_timeout_ms: 30_000,
            termination: TerminationPolicy::default(),
            health_path: None,
            process_group: true,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Check everything that can be checked before spawning.
    pub fn validate(&self) -> Result<(), String> {
        if self.program.trim().is_empty() {
            return Err("server program is empty".to_string());
        }
        ReadinessPattern::from_template(&self.readiness_template)?;
        if self.termination.is_empty() {
            return Err("termination policy has no steps".to_string());
        }
        if self.startup_timeout_ms == 0 {
            return Err("startup_timeout_ms must be positive".to_string());
        }
        if let Some(path) = &self.health_path {
            if !path.starts_with('/') {
                return Err(format!("health_path {:?} must start with '/'", path));
            }
        }
        Ok(())
    }

    fn command(&self, project_dir: &Path) -> ProcessCommand {
        let mut command = ProcessCommand::new(&self.program, project_dir)
            .args(self.args.iter().cloned())
            .process_group(self.process_group);
        for (key, value) in &self.env {
            command = command.env(key, value);
        }
        if let Some(port) = self.port {
            command = command.env("PORT", port.to_string());
        }
        command
    }
}

/// Output captured from a server, stdout and stderr kept separately
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    fn push_stdout(&mut self, text: &str) {
        append_tail(&mut self.stdout, text);
    }

    fn push_stderr(&mut self, text: &str) {
        append_tail(&mut self.stderr, text);
    }
}

fn append_tail(buf: &mut String, text: &str) {
    buf.push_str(text);
    if buf.len() > OUTPUT_TAIL_BYTES {
        let mut cut = buf.len() - OUTPUT_TAIL_BYTES;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// One launched server process with its single-resolution outcome slot
pub struct ManagedProcess {
    handle: ProcessHandle,
    outcome: OnceCell<ReadinessOutcome>,
    output: Arc<Mutex<CapturedOutput>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    fn new(handle: ProcessHandle, stdout: &str, stderr: &str) -> Self {
        let mut output = CapturedOutput::default();
        output.push_stdout(stdout);
        output.push_stderr(stderr);
        Self {
            handle,
            outcome: OnceCell::new(),
            output: Arc::new(Mutex::new(output)),
            forwarder: None,
        }
    }

    /// Claim the outcome slot. A second claim is a harness bug.
    fn resolve(&self, outcome: ReadinessOutcome) -> Result<(), InvariantViolation> {
        self.outcome
            .set(outcome)
            .map_err(|_| InvariantViolation::DoubleResolution { pid: self.handle.pid() })
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn outcome(&self) -> Option<&ReadinessOutcome> {
        self.outcome.get()
    }

    /// Snapshot of the captured output tails
    pub fn output(&self) -> CapturedOutput {
        self.output.lock().clone()
    }

    /// Keep draining output into the buffers and the log once startup is over.
    fn forward_output(&mut self, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        let output = Arc::clone(&self.output);
        let pid = self.handle.pid();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Stdout(text) => {
                        for line in text.lines() {
                            debug!(target: "formprobe::server", pid, "{}", line);
                        }
                        output.lock().push_stdout(&text);
                    }
                    ProcessEvent::Stderr(text) => {
                        for line in text.lines() {
                            warn!(target: "formprobe::server", pid, "{}", line);
                        }
                        output.lock().push_stderr(&text);
                    }
                    ProcessEvent::Exited(info) => {
                        info!(target: "formprobe::server", pid, %info, "server process exited");
                        break;
                    }
                }
            }
        }));
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// A server that reported readiness
pub struct RunningServer {
    process: ManagedProcess,
    port: u16,
    policy: TerminationPolicy,
    stopped: bool,
}

impl RunningServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://localhost:{port}`, the URL convention the servers announce
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_running(&self) -> bool {
        self.process.handle().is_running()
    }

    pub fn output(&self) -> CapturedOutput {
        self.process.output()
    }

    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    /// Stop with the policy the server was started with.
    ///
    /// Calling this again after a successful stop returns
    /// [`StopOutcome::AlreadyStopped`] without sending anything.
    pub async fn stop(&mut self) -> Result<StopOutcome, StopError> {
        if self.stopped {
            debug!(pid = self.pid(), "stop called on an already stopped server");
            return Ok(StopOutcome::AlreadyStopped);
        }
        info!(pid = self.pid(), port = self.port, "stopping server");
        let outcome = TerminationController::new(&self.policy)
            .terminate(self.process.handle())
            .await?;
        self.stopped = true;
        Ok(outcome)
    }
}

impl std::fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningServer")
            .field("pid", &self.pid())
            .field("port", &self.port)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// Starts servers and waits for their readiness line
#[derive(Debug, Clone, Default)]
pub struct ServerLauncher {
    config: ServerConfig,
}

impl ServerLauncher {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Spawn the server in `project_dir` and wait until it is ready.
    ///
    /// Returns as soon as readiness resolves. A start that fails while the
    /// process is still alive terminates it with the policy first.
    pub async fn start(&self, project_dir: &Path) -> Result<RunningServer, StartError> {
        self.config.validate().map_err(StartError::Config)?;
        let pattern = ReadinessPattern::from_template(&self.config.readiness_template).map_err(StartError::Config)?;

        let command = self.config.command(project_dir);
        info!(program = %command.program, args = ?command.args, dir = %project_dir.display(), "starting server");

        let mut handle = ProcessHandle::spawn(&command)?;
        let pid = handle.pid();
        let Some(mut events) = handle.take_events() else {
            return Err(InvariantViolation::UnresolvedReadiness { pid }.into());
        };

        let startup_timeout = self.config.startup_timeout();
        let deadline = Instant::now() + startup_timeout;
        let mut detector = ReadinessDetector::new(pattern, &self.config.failure_markers);

        let outcome = loop {
            let transition = match timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => {
                    let transition = detector.observe(&event);
                    if transition.is_none() {
                        continue;
                    }
                    transition
                }
                Ok(None) => detector.on_exit(handle.exit_status().unwrap_or_else(ExitInfo::unknown)),
                Err(_) => detector.on_deadline(startup_timeout.as_millis() as u64),
            };
            match transition {
                Some(outcome) => break outcome,
                None => return Err(InvariantViolation::UnresolvedReadiness { pid }.into()),
            }
        };

        let mut process = ManagedProcess::new(handle, detector.stdout(), detector.stderr());
        process.resolve(outcome.clone())?;
        debug!(pid, ?outcome, "readiness resolved");

        match outcome {
            ReadinessOutcome::Ready { port } => {
                if let Some(path) = &self.config.health_path {
                    if let Err(e) = self.wait_for_healthy(&process, port, path, deadline).await {
                        self.abort(&process).await;
                        return Err(e);
                    }
                }
                process.forward_output(events);
                info!(pid, port, "server is ready at http://localhost:{}", port);
                Ok(RunningServer {
                    process,
                    port,
                    policy: self.config.termination.clone(),
                    stopped: false,
                })
            }
            ReadinessOutcome::StartFailed(StartFailure::FailureOutput { marker }) => {
                error!(pid, %marker, "server reported a failure before becoming ready");
                self.abort(&process).await;
                let (_, stderr) = detector.into_output();
                Err(StartError::FailureOutput { marker, stderr })
            }
            ReadinessOutcome::StartFailed(StartFailure::TimedOut { after_ms }) => {
                error!(pid, after_ms, "server did not become ready in time");
                self.abort(&process).await;
                let (stdout, stderr) = detector.into_output();
                Err(StartError::Timeout {
                    timeout_ms: after_ms,
                    stdout,
                    stderr,
                })
            }
            ReadinessOutcome::ExitedPrematurely { exit } => {
                error!(pid, %exit, "server exited before becoming ready");
                let (stdout, stderr) = detector.into_output();
                Err(StartError::ExitedPrematurely { exit, stdout, stderr })
            }
        }
    }

    /// Stop a server with this launcher's policy.
    pub async fn stop(&self, server: &mut RunningServer) -> Result<StopOutcome, StopError> {
        server.policy = self.config.termination.clone();
        server.stop().await
    }

    /// Poll the health endpoint until it answers 2xx or the startup deadline passes.
    async fn wait_for_healthy(
        &self,
        process: &ManagedProcess,
        port: u16,
        path: &str,
        deadline: Instant,
    ) -> Result<(), StartError> {
        let url = format!("http://localhost:{}{}", port, path);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| StartError::Config(format!("cannot build HTTP client: {}", e)))?;

        let mut attempts = 0;
        while Instant::now() < deadline {
            attempts += 1;

            if let Some(exit) = process.handle().exit_status() {
                let output = process.output();
                return Err(StartError::ExitedPrematurely {
                    exit,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }

            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%url, attempts, "health check passed");
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    // Connection refused is expected while the listener comes up
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(HEALTH_POLL_INTERVAL).await;
        }

        Err(StartError::HealthCheck { url, attempts })
    }

    async fn abort(&self, process: &ManagedProcess) {
        if !process.handle().is_running() {
            return;
        }
        match TerminationController::new(&self.config.termination)
            .terminate(process.handle())
            .await
        {
            Ok(outcome) => debug!(pid = process.pid(), ?outcome, "failed start cleaned up"),
            Err(e) => error!(pid = process.pid(), "could not stop failed server, it will be killed on drop: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_tail_keeps_char_boundaries() {
        let mut buf = String::new();
        let chunk = "é".repeat(OUTPUT_TAIL_BYTES);
        append_tail(&mut buf, &chunk);
        append_tail(&mut buf, "x");
        assert!(buf.len() <= OUTPUT_TAIL_BYTES);
        assert!(buf.ends_with('x'));
    }

    #[test]
    fn test_default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let no_port = ServerConfig {
            readiness_template: "listening".to_string(),
            ..Default::default()
        };
        assert!(no_port.validate().unwrap_err().contains("placeholder"));

        let no_steps = ServerConfig {
            termination: TerminationPolicy::new(vec![]),
            ..Default::default()
        };
        assert!(no_steps.validate().is_err());

        let relative_health = ServerConfig {
            health_path: Some("health".to_string()),
            ..Default::default()
        };
        assert!(relative_health.validate().is_err());
    }

    #[test]
    fn test_command_passes_port() {
        let config = ServerConfig {
            port: Some(4321),
            ..Default::default()
        };
        let command = config.command(Path::new("/srv/app"));
        assert_eq!(command.program, "node");
        assert_eq!(command.args, vec!["server.js".to_string()]);
        assert_eq!(command.env.get("PORT").map(String::as_str), Some("4321"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_outcome_slot_resolves_once() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::spawn(&ProcessCommand::new("true", dir.path())).unwrap();
        let process = ManagedProcess::new(handle, "", "");

        process.resolve(ReadinessOutcome::Ready { port: 1 }).unwrap();
        let err = process.resolve(ReadinessOutcome::Ready { port: 2 }).unwrap_err();

        assert_eq!(err, InvariantViolation::DoubleResolution { pid: process.pid() });
        assert_eq!(process.outcome(), Some(&ReadinessOutcome::Ready { port: 1 }));
    }
}
