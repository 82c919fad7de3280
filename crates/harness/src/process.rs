//! Process handle: one spawned child, its two output streams and its exit
//!
//! A single pump task owns the [`tokio::process::Child`]. It reads stdout and
//! stderr, reaps the child and delivers signals, so every event about one
//! process is serialized through one place. Signals are only ever sent while
//! that task has not reaped the child, which keeps them from reaching a pid
//! the OS has since handed to someone else.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::SpawnError;
use crate::termination::TerminationSignal;

const READ_CHUNK: usize = 8 * 1024;

/// Output still sitting in the pipes when the child is reaped is drained for
/// at most this long before the exit event goes out.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// What to run and where
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    /// Spawn into a fresh process group and signal the whole group (unix).
    pub process_group: bool,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            process_group: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn process_group(mut self, enabled: bool) -> Self {
        self.process_group = enabled;
        self
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub(crate) fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// The child was reaped but its status could not be read.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Incremental output and the final exit, in the order the pump observed them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitInfo),
}

/// Result of asking the pump to signal its child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDelivery {
    Delivered,
    /// The child had already been reaped; nothing was sent.
    AlreadyExited(ExitInfo),
    /// The OS reported no such process (it exited but is not reaped yet).
    Vanished,
    Failed(String),
}

struct SignalRequest {
    signal: TerminationSignal,
    reply: oneshot::Sender<SignalDelivery>,
}

/// Handle to one spawned child
///
/// Dropping the handle kills a child that is still running.
pub struct ProcessHandle {
    pid: u32,
    program: String,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    exit: watch::Receiver<Option<ExitInfo>>,
    control: mpsc::Sender<SignalRequest>,
}

impl ProcessHandle {
    /// Spawn the command with piped stdout/stderr.
    ///
    /// Failing to start the executable at all is a [`SpawnError`]; a child
    /// that starts and then exits shows up later as [`ProcessEvent::Exited`].
    pub fn spawn(command: &ProcessCommand) -> Result<Self, SpawnError> {
        let spawn_error = |source: std::io::Error| SpawnError {
            program: command.program.clone(),
            working_dir: command.working_dir.clone(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if command.process_group {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "child was reaped before its pid was read",
            ))
        })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::channel(8);

        let pump = Pump {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            pid,
            process_group: command.process_group,
            events: event_tx,
            exit: exit_tx,
            control: control_rx,
        };
        tokio::spawn(pump.run());

        debug!(pid, program = %command.program, dir = %command.working_dir.display(), "spawned process");

        Ok(Self {
            pid,
            program: command.program.clone(),
            events: Some(event_rx),
            exit: exit_rx,
            control: control_tx,
        })
    }

    /// Pid recorded at spawn time
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status, once the child has been reaped
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// A fresh receiver for the exit notification
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    /// Next output or exit event. Returns `None` once the stream has been
    /// taken with [`take_events`](Self::take_events) or has ended.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Move the event stream out, e.g. to forward output after startup.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    /// Wait until the child has been reaped.
    pub async fn wait(&self) -> ExitInfo {
        wait_for_exit(&mut self.exit_watch()).await
    }

    /// Ask the pump to deliver `signal` to this child.
    pub async fn signal(&self, signal: TerminationSignal) -> SignalDelivery {
        let (reply, response) = oneshot::channel();
        let request = SignalRequest { signal, reply };
        if self.control.send(request).await.is_err() {
            return SignalDelivery::AlreadyExited(self.exit_status().unwrap_or_else(ExitInfo::unknown));
        }
        response
            .await
            .unwrap_or_else(|_| SignalDelivery::AlreadyExited(self.exit_status().unwrap_or_else(ExitInfo::unknown)))
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("exit", &self.exit_status())
            .finish()
    }
}

/// Resolve once the watched exit slot is filled.
pub(crate) async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    let status = match exit.wait_for(Option::is_some).await {
        Ok(status) => *status,
        Err(_) => None,
    };
    status.unwrap_or_else(ExitInfo::unknown)
}

struct Pump {
    child: Child,
    pid: u32,
    process_group: bool,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exit: watch::Sender<Option<ExitInfo>>,
    control: mpsc::Receiver<SignalRequest>,
}

impl Pump {
    async fn run(self) {
        let Pump {
            mut child,
            pid,
            process_group,
            mut stdout,
            mut stderr,
            events,
            exit,
            mut control,
        } = self;

        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut out_text = Utf8Decoder::default();
        let mut err_text = Utf8Decoder::default();
        let mut exited: Option<ExitInfo> = None;

        loop {
            tokio::select! {
                biased;

                request = control.recv() => {
                    let Some(request) = request else {
                        // Every handle is gone. kill_on_drop only reaches the
                        // leader, so take the group down while its pid is still ours.
                        if exited.is_none() && process_group {
                            let delivery = signal_child(&mut child, pid, true, TerminationSignal::Kill);
                            debug!(pid, ?delivery, "killed process group on drop");
                        }
                        break;
                    };
                    let delivery = match exited {
                        Some(info) => SignalDelivery::AlreadyExited(info),
                        None => signal_child(&mut child, pid, process_group, request.signal),
                    };
                    debug!(pid, signal = request.signal.name(), ?delivery, "signal request");
                    let _ = request.reply.send(delivery);
                }

                read = read_chunk(&mut stdout, &mut out_buf), if exited.is_none() && stdout.is_some() => {
                    match read {
                        Ok(n) if n > 0 => emit(&events, ProcessEvent::Stdout(out_text.push(&out_buf[..n]))),
                        _ => {
                            emit(&events, ProcessEvent::Stdout(out_text.finish()));
                            stdout = None;
                        }
                    }
                }

                read = read_chunk(&mut stderr, &mut err_buf), if exited.is_none() && stderr.is_some() => {
                    match read {
                        Ok(n) if n > 0 => emit(&events, ProcessEvent::Stderr(err_text.push(&err_buf[..n]))),
                        _ => {
                            emit(&events, ProcessEvent::Stderr(err_text.finish()));
                            stderr = None;
                        }
                    }
                }

                status = child.wait(), if exited.is_none() => {
                    if let Some(rest) = drain(stdout.take(), &mut out_text).await {
                        emit(&events, ProcessEvent::Stdout(rest));
                    }
                    if let Some(rest) = drain(stderr.take(), &mut err_text).await {
                        emit(&events, ProcessEvent::Stderr(rest));
                    }

                    let info = match status {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(e) => {
                            warn!(pid, "failed to read exit status: {}", e);
                            ExitInfo::unknown()
                        }
                    };
                    debug!(pid, %info, "process exited");
                    exited = Some(info);
                    let _ = events.send(ProcessEvent::Exited(info));
                    exit.send_replace(Some(info));
                }
            }
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<ProcessEvent>, event: ProcessEvent) {
    let empty = match &event {
        ProcessEvent::Stdout(text) | ProcessEvent::Stderr(text) => text.is_empty(),
        ProcessEvent::Exited(_) => false,
    };
    if !empty {
        // The receiver may be gone after startup; output is then dropped.
        let _ = events.send(event);
    }
}

async fn read_chunk<R>(stream: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn drain<R>(stream: Option<R>, decoder: &mut Utf8Decoder) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut stream = stream?;
    let mut rest = Vec::new();
    // A grandchild holding the pipe open would block read_to_end forever.
    let _ = tokio::time::timeout(DRAIN_GRACE, stream.read_to_end(&mut rest)).await;
    let mut text = decoder.push(&rest);
    text.push_str(&decoder.finish());
    (!text.is_empty()).then_some(text)
}

#[cfg(unix)]
fn signal_child(_child: &mut Child, pid: u32, process_group: bool, signal: TerminationSignal) -> SignalDelivery {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    let result = if process_group {
        killpg(target, signal.as_nix())
    } else {
        kill(target, signal.as_nix())
    };

    match result {
        Ok(()) => SignalDelivery::Delivered,
        Err(Errno::ESRCH) => SignalDelivery::Vanished,
        Err(e) => SignalDelivery::Failed(e.to_string()),
    }
}

#[cfg(not(unix))]
fn signal_child(child: &mut Child, _pid: u32, _process_group: bool, _signal: TerminationSignal) -> SignalDelivery {
    // No signal distinction off unix: every stage is a hard kill.
    match child.start_kill() {
        Ok(()) => SignalDelivery::Delivered,
        Err(e) => SignalDelivery::Failed(e.to_string()),
    }
}

/// Decodes a byte stream as UTF-8 without splitting multi-byte characters
/// that straddle two reads.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete character at the end; wait for the rest.
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
