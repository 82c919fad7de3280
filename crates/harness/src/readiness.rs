//! Readiness detection from a server's own log output
//!
//! The detector is a plain state machine fed with stdout chunks, stderr chunks
//! and the exit event. It leaves `Waiting` exactly once; every later event is
//! a no-op, so racing sources resolve to whichever was observed first.

use regex::Regex;
use serde::Serialize;

use crate::process::{ExitInfo, ProcessEvent};

/// Default line the generated servers print once they are listening.
pub const DEFAULT_READINESS_TEMPLATE: &str = "Server is running on http://localhost:{port}";

const PORT_PLACEHOLDER: &str = "{port}";

/// Pattern that extracts the listening port from accumulated stdout
#[derive(Debug, Clone)]
pub struct ReadinessPattern {
    template: String,
    regex: Regex,
}

impl ReadinessPattern {
    /// Build a pattern from a template such as
    /// `"Server is running on http://localhost:{port}"`.
    ///
    /// Everything except `{port}` matches literally.
    pub fn from_template(template: &str) -> Result<Self, String> {
        let mut parts = template.split(PORT_PLACEHOLDER);
        let prefix = parts.next().unwrap_or_default();
        let suffix = match (parts.next(), parts.next()) {
            (Some(suffix), None) => suffix,
            (None, _) => return Err(format!("readiness template {:?} has no {} placeholder", template, PORT_PLACEHOLDER)),
            (Some(_), Some(_)) => {
                return Err(format!("readiness template {:?} has more than one {} placeholder", template, PORT_PLACEHOLDER))
            }
        };

        // Without a suffix, require a non-digit after the port so
        // "localhost:123456" never matches as 12345.
        let source = if suffix.is_empty() {
            format!(r"{}(?P<port>\d{{1,5}})(?:\D|$)", regex::escape(prefix))
        } else {
            format!(r"{}(?P<port>\d{{1,5}}){}", regex::escape(prefix), regex::escape(suffix))
        };
        let regex = Regex::new(&source).map_err(|e| format!("invalid readiness template {:?}: {}", template, e))?;

        Ok(Self {
            template: template.to_string(),
            regex,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// First port announced in `text`, if any. `text` is taken as complete.
    pub fn extract_port(&self, text: &str) -> Option<u16> {
        self.find_port(text, true)
    }

    /// Like [`extract_port`](Self::extract_port), but when more output may
    /// follow, digits running into the end of `text` are not a port yet.
    fn find_port(&self, text: &str, complete: bool) -> Option<u16> {
        self.regex
            .captures_iter(text)
            .filter_map(|caps| caps.name("port"))
            .filter(|port| complete || port.end() < text.len())
            .filter_map(|port| port.as_str().parse::<u16>().ok())
            .find(|port| *port != 0)
    }
}

impl Default for ReadinessPattern {
    fn default() -> Self {
        // The built-in template has exactly one placeholder.
        match Self::from_template(DEFAULT_READINESS_TEMPLATE) {
            Ok(pattern) => pattern,
            Err(e) => unreachable!("default readiness template: {}", e),
        }
    }
}

/// Terminal readiness states; the value written to a process's outcome slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready { port: u16 },
    StartFailed(StartFailure),
    ExitedPrematurely { exit: ExitInfo },
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StartFailure {
    /// A failure marker appeared on stderr before readiness.
    FailureOutput { marker: String },
    /// The startup deadline passed without a terminal event.
    TimedOut { after_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DetectorState {
    Waiting,
    Resolved(ReadinessOutcome),
}

/// Accumulates output and decides readiness
#[derive(Debug)]
pub struct ReadinessDetector {
    pattern: ReadinessPattern,
    /// Lowercased failure markers
    failure_markers: Vec<String>,
    /// Longest marker, for the overlap kept between stderr scans
    marker_len: usize,
    stdout: String,
    /// Start of the first stdout line not yet seen in full
    stdout_line_start: usize,
    stderr: String,
    stderr_lower: String,
    /// Offset in `stderr_lower` where the next marker scan begins
    stderr_scan_from: usize,
    state: DetectorState,
}

impl ReadinessDetector {
    pub fn new(pattern: ReadinessPattern, failure_markers: &[String]) -> Self {
        let failure_markers: Vec<String> = failure_markers
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| m.to_lowercase())
            .collect();
        Self {
            pattern,
            marker_len: failure_markers.iter().map(String::len).max().unwrap_or(0),
            failure_markers,
            stdout: String::new(),
            stdout_line_start: 0,
            stderr: String::new(),
            stderr_lower: String::new(),
            stderr_scan_from: 0,
            state: DetectorState::Waiting,
        }
    }

    /// Feed one process event. Returns the outcome on the transition out of
    /// `Waiting` and `None` for every other call.
    pub fn observe(&mut self, event: &ProcessEvent) -> Option<ReadinessOutcome> {
        match event {
            ProcessEvent::Stdout(chunk) => self.on_stdout(chunk),
            ProcessEvent::Stderr(chunk) => self.on_stderr(chunk),
            ProcessEvent::Exited(info) => self.on_exit(*info),
        }
    }

    /// Only the lines touched by `chunk` are scanned. A port that runs into
    /// the end of the buffer waits for the next byte, since its digits may
    /// continue in the next read.
    pub fn on_stdout(&mut self, chunk: &str) -> Option<ReadinessOutcome> {
        self.stdout.push_str(chunk);
        if !self.is_waiting() {
            return None;
        }
        let unseen = &self.stdout[self.stdout_line_start..];
        let port = self.pattern.find_port(unseen, false);
        if let Some(newline) = unseen.rfind('\n') {
            self.stdout_line_start += newline + 1;
        }
        self.resolve(ReadinessOutcome::Ready { port: port? })
    }

    pub fn on_stderr(&mut self, chunk: &str) -> Option<ReadinessOutcome> {
        self.stderr.push_str(chunk);
        self.stderr_lower.push_str(&chunk.to_lowercase());
        if !self.is_waiting() {
            return None;
        }
        let unseen = &self.stderr_lower[self.stderr_scan_from..];
        let marker = self
            .failure_markers
            .iter()
            .find(|marker| unseen.contains(marker.as_str()))
            .cloned();

        // Keep enough of the tail for a marker split across two chunks.
        let mut next = self.stderr_lower.len().saturating_sub(self.marker_len.saturating_sub(1));
        while !self.stderr_lower.is_char_boundary(next) {
            next -= 1;
        }
        self.stderr_scan_from = next.max(self.stderr_scan_from);

        self.resolve(ReadinessOutcome::StartFailed(StartFailure::FailureOutput { marker: marker? }))
    }

    /// Exit before readiness is a failure, even with status 0.
    pub fn on_exit(&mut self, exit: ExitInfo) -> Option<ReadinessOutcome> {
        self.resolve(ReadinessOutcome::ExitedPrematurely { exit })
    }

    /// The startup deadline passed.
    pub fn on_deadline(&mut self, after_ms: u64) -> Option<ReadinessOutcome> {
        self.resolve(ReadinessOutcome::StartFailed(StartFailure::TimedOut { after_ms }))
    }

    pub fn is_waiting(&self) -> bool {
        self.state == DetectorState::Waiting
    }

    pub fn outcome(&self) -> Option<&ReadinessOutcome> {
        match &self.state {
            DetectorState::Waiting => None,
            DetectorState::Resolved(outcome) => Some(outcome),
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Hand the accumulated buffers over, e.g. to the managed process.
    pub fn into_output(self) -> (String, String) {
        (self.stdout, self.stderr)
    }

    fn resolve(&mut self, outcome: ReadinessOutcome) -> Option<ReadinessOutcome> {
        if !self.is_waiting() {
            return None;
        }
        self.state = DetectorState::Resolved(outcome.clone());
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn detector() -> ReadinessDetector {
        ReadinessDetector::new(ReadinessPattern::default(), &["error".to_string()])
    }

    #[test_case("Server is running on http://localhost:4321\n", Some(4321) ; "full line")]
    #[test_case("boot\nServer is running on http://localhost:8080", Some(8080) ; "no trailing newline")]
    #[test_case("Server is running on http://localhost:99999\n", None ; "out of range")]
    #[test_case("Server is running on http://localhost:0\n", None ; "port zero")]
    #[test_case("Server is running on http://localhost:123456\n", None ; "too many digits")]
    #[test_case("Server is running on http://127.0.0.1:4321\n", None ; "different host")]
    fn test_extract_port(text: &str, expected: Option<u16>) {
        assert_eq!(ReadinessPattern::default().extract_port(text), expected);
    }

    #[test]
    fn test_template_with_suffix() {
        let pattern = ReadinessPattern::from_template("listening on port {port} (pid").unwrap();
        assert_eq!(pattern.extract_port("listening on port 3000 (pid 12)"), Some(3000));
        assert_eq!(pattern.extract_port("listening on port 3000"), None);
    }

    #[test_case("Server is running" ; "no placeholder")]
    #[test_case("{port} and {port}" ; "two placeholders")]
    fn test_invalid_template(template: &str) {
        assert!(ReadinessPattern::from_template(template).is_err());
    }

    #[test]
    fn test_template_is_literal() {
        let pattern = ReadinessPattern::from_template("ready (*) at {port}").unwrap();
        assert_eq!(pattern.extract_port("ready (*) at 5000"), Some(5000));
        assert_eq!(pattern.extract_port("ready xx at 5000"), None);
    }

    #[test]
    fn test_ready_across_chunks() {
        let mut d = detector();
        assert_eq!(d.on_stdout("Server is running on http://loc"), None);
        assert_eq!(d.on_stdout("alhost:4321\n"), Some(ReadinessOutcome::Ready { port: 4321 }));
        assert!(!d.is_waiting());
    }

    #[test]
    fn test_port_split_across_chunks() {
        let mut d = detector();
        assert_eq!(d.on_stdout("Server is running on http://localhost:43"), None);
        assert!(d.is_waiting());
        assert_eq!(d.on_stdout("21\n"), Some(ReadinessOutcome::Ready { port: 4321 }));
    }

    #[test]
    fn test_port_waits_for_byte_after_digits() {
        let mut d = detector();
        assert_eq!(d.on_stdout("Server is running on http://localhost:8080"), None);
        assert_eq!(d.on_stdout(" (press ctrl-c)"), Some(ReadinessOutcome::Ready { port: 8080 }));
    }

    #[test]
    fn test_split_overlong_port_never_matches() {
        let mut d = detector();
        assert_eq!(d.on_stdout("Server is running on http://localhost:12345"), None);
        assert_eq!(d.on_stdout("6\n"), None);
        assert!(d.is_waiting());
    }

    #[test]
    fn test_ready_after_many_lines() {
        let mut d = detector();
        for i in 0..1000 {
            assert_eq!(d.on_stdout(&format!("compiling crate {}\n", i)), None);
        }
        assert_eq!(
            d.on_stdout("Server is running on http://localhost:3000\n"),
            Some(ReadinessOutcome::Ready { port: 3000 })
        );
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut d = detector();
        assert_eq!(d.on_stderr("warming up\nfatal er"), None);
        assert!(matches!(
            d.on_stderr("ror: boom\n"),
            Some(ReadinessOutcome::StartFailed(StartFailure::FailureOutput { .. }))
        ));
    }

    #[test]
    fn test_stderr_marker_is_case_insensitive() {
        let mut d = detector();
        assert_eq!(d.on_stderr("warming up\n"), None);
        let outcome = d.on_stderr("Uncaught ERROR: EADDRINUSE\n");
        assert_eq!(
            outcome,
            Some(ReadinessOutcome::StartFailed(StartFailure::FailureOutput { marker: "error".to_string() }))
        );
        assert_eq!(d.stderr(), "warming up\nUncaught ERROR: EADDRINUSE\n");
    }

    #[test]
    fn test_clean_exit_without_readiness_is_failure() {
        let mut d = detector();
        d.on_stdout("starting\n");
        let exit = ExitInfo { code: Some(0), signal: None };
        assert_eq!(d.on_exit(exit), Some(ReadinessOutcome::ExitedPrematurely { exit }));
    }

    #[test]
    fn test_stderr_after_ready_is_ignored() {
        let mut d = detector();
        d.on_stdout("Server is running on http://localhost:4321\n");
        assert_eq!(d.on_stderr("error: favicon missing\n"), None);
        assert_eq!(d.outcome(), Some(&ReadinessOutcome::Ready { port: 4321 }));
    }

    #[test]
    fn test_first_transition_wins() {
        let mut d = detector();
        assert!(d.on_stderr("error\n").is_some());
        assert_eq!(d.on_stdout("Server is running on http://localhost:4321\n"), None);
        assert_eq!(d.on_exit(ExitInfo::unknown()), None);
        assert_eq!(d.on_deadline(10), None);
        assert!(matches!(d.outcome(), Some(ReadinessOutcome::StartFailed(_))));
        // Output keeps accumulating for diagnostics.
        assert!(d.stdout().contains("localhost:4321"));
    }

    #[test]
    fn test_observe_dispatches_events() {
        let mut d = detector();
        assert_eq!(d.observe(&ProcessEvent::Stdout("noise\n".into())), None);
        let outcome = d.observe(&ProcessEvent::Exited(ExitInfo { code: Some(1), signal: None }));
        assert!(matches!(outcome, Some(ReadinessOutcome::ExitedPrematurely { .. })));
    }

    #[test]
    fn test_empty_markers_never_fail() {
        let mut d = ReadinessDetector::new(ReadinessPattern::default(), &[String::new()]);
        assert_eq!(d.on_stderr("error everywhere\n"), None);
        assert!(d.is_waiting());
    }
}
