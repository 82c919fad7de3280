//! Escalating shutdown of a spawned process
//!
//! A [`TerminationPolicy`] is an ordered list of (signal, wait) steps. The
//! controller walks it in a single loop: send the step's signal, then race the
//! step's timer against the exit notification. The timer future is dropped as
//! soon as the race resolves, so a stale timer can never trigger another
//! signal once the child has been reaped.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StopError;
use crate::process::{wait_for_exit, ExitInfo, ProcessHandle, SignalDelivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationSignal {
    #[serde(alias = "SIGINT", alias = "int")]
    Interrupt,
    #[serde(alias = "SIGTERM", alias = "term")]
    Terminate,
    #[serde(alias = "SIGKILL")]
    Kill,
}

impl TerminationSignal {
    pub fn name(self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
            TerminationSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    pub(crate) fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            TerminationSignal::Interrupt => Signal::SIGINT,
            TerminationSignal::Terminate => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One escalation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStep {
    pub signal: TerminationSignal,
    /// How long to wait for exit before moving to the next step
    pub wait_ms: u64,
}

impl EscalationStep {
    pub fn new(signal: TerminationSignal, wait: Duration) -> Self {
        Self {
            signal,
            wait_ms: wait.as_millis() as u64,
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Ordered escalation steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminationPolicy {
    steps: Vec<EscalationStep>,
}

impl TerminationPolicy {
    pub fn new(steps: Vec<EscalationStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[EscalationStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of all waits; the longest a stop can take.
    pub fn total_wait(&self) -> Duration {
        self.steps.iter().map(EscalationStep::wait).sum()
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::new(vec![
            EscalationStep::new(TerminationSignal::Interrupt, Duration::from_millis(3000)),
            EscalationStep::new(TerminationSignal::Terminate, Duration::from_millis(3000)),
        ])
    }
}

/// How a stop request resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The process had already exited; no signal was sent.
    NotRunning { exit: ExitInfo },
    /// The process exited after the listed signals.
    Exited {
        exit: ExitInfo,
        signals_sent: Vec<TerminationSignal>,
        elapsed_ms: u64,
    },
    /// `stop` was already called on this handle.
    AlreadyStopped,
}

impl StopOutcome {
    pub fn signals_sent(&self) -> &[TerminationSignal] {
        match self {
            StopOutcome::Exited { signals_sent, .. } => signals_sent,
            _ => &[],
        }
    }
}

/// Drives one process through a [`TerminationPolicy`]
pub struct TerminationController<'a> {
    policy: &'a TerminationPolicy,
}

impl<'a> TerminationController<'a> {
    pub fn new(policy: &'a TerminationPolicy) -> Self {
        Self { policy }
    }

    /// Stop `handle`, escalating through the policy.
    ///
    /// Never sends more than one signal per step and performs no kill beyond
    /// what the policy lists. Exhausting the policy is [`StopError::EscalationExhausted`].
    pub async fn terminate(&self, handle: &ProcessHandle) -> Result<StopOutcome, StopError> {
        let pid = handle.pid();
        let mut exit = handle.exit_watch();

        if let Some(info) = *exit.borrow() {
            debug!(pid, %info, "process already exited, nothing to signal");
            return Ok(StopOutcome::NotRunning { exit: info });
        }

        let started = Instant::now();
        let mut signals_sent = Vec::new();

        for step in self.policy.steps() {
            match handle.signal(step.signal).await {
                SignalDelivery::Delivered => {
                    debug!(pid, signal = %step.signal, wait_ms = step.wait_ms, "signal delivered");
                    signals_sent.push(step.signal);
                }
                SignalDelivery::AlreadyExited(info) => {
                    return Ok(finished(info, signals_sent, started));
                }
                SignalDelivery::Vanished => {
                    // Exited but not reaped yet; the exit event is on its way.
                    debug!(pid, signal = %step.signal, "process vanished before signal");
                }
                SignalDelivery::Failed(reason) => {
                    warn!(pid, signal = %step.signal, "failed to deliver signal: {}", reason);
                }
            }

            tokio::select! {
                info = wait_for_exit(&mut exit) => {
                    let outcome = finished(info, signals_sent, started);
                    info!(pid, %info, elapsed_ms = started.elapsed().as_millis() as u64, "process stopped");
                    return Ok(outcome);
                }
                _ = tokio::time::sleep(step.wait()) => {
                    debug!(pid, signal = %step.signal, "no exit within {}ms, escalating", step.wait_ms);
                }
            }
        }

        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(pid, ?signals_sent, waited_ms, "termination policy exhausted");
        Err(StopError::EscalationExhausted {
            pid,
            signals: signals_sent,
            waited_ms,
        })
    }
}

fn finished(exit: ExitInfo, signals_sent: Vec<TerminationSignal>, started: Instant) -> StopOutcome {
    if signals_sent.is_empty() {
        StopOutcome::NotRunning { exit }
    } else {
        StopOutcome::Exited {
            exit,
            signals_sent,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}
