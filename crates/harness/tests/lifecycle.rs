//! Server lifecycle tests against real `sh` processes
//!
//! Run with: cargo test --package formprobe-harness --test lifecycle

#![cfg(unix)]

use std::time::{Duration, Instant};

use formprobe_harness::process::ExitInfo;
use formprobe_harness::{
    start_server, stop_server, EscalationStep, ServerConfig, StartError, StopOutcome, TerminationPolicy,
    TerminationSignal,
};

fn shell(script: &str) -> ServerConfig {
    ServerConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        startup_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn short_policy() -> TerminationPolicy {
    TerminationPolicy::new(vec![
        EscalationStep::new(TerminationSignal::Interrupt, Duration::from_millis(500)),
        EscalationStep::new(TerminationSignal::Terminate, Duration::from_millis(500)),
    ])
}

#[tokio::test]
async fn readiness_line_yields_port() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell("echo booting; echo 'Server is running on http://localhost:4321'; exec sleep 30");

    let mut server = start_server(dir.path(), &config).await.unwrap();
    assert_eq!(server.port(), 4321);
    assert_eq!(server.base_url(), "http://localhost:4321");
    assert!(server.is_running());
    assert!(server.output().stdout.contains("booting"));

    let outcome = stop_server(&mut server).await.unwrap();
    assert_eq!(outcome.signals_sent(), &[TerminationSignal::Interrupt]);
    assert!(!server.is_running());
}

#[tokio::test]
async fn clean_exit_before_readiness_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell("echo 'listening soon'; exit 0");

    let err = start_server(dir.path(), &config).await.unwrap_err();
    match err {
        StartError::ExitedPrematurely { exit, stdout, .. } => {
            assert_eq!(exit, ExitInfo { code: Some(0), signal: None });
            assert_eq!(stdout, "listening soon\n");
        }
        other => panic!("expected ExitedPrematurely, got {other:?}"),
    }
}

#[tokio::test]
async fn stderr_error_marker_fails_start_and_stops_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        termination: short_policy(),
        ..shell("echo 'Error: listen EADDRINUSE :::3000' >&2; exec sleep 30")
    };

    let started = Instant::now();
    let err = start_server(dir.path(), &config).await.unwrap_err();

    match err {
        StartError::FailureOutput { marker, stderr } => {
            assert_eq!(marker, "error");
            assert!(stderr.contains("EADDRINUSE"));
        }
        other => panic!("expected FailureOutput, got {other:?}"),
    }
    // Cleanup ran the policy instead of waiting out the sleep.
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn missing_program_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        program: "formprobe-no-such-server".to_string(),
        ..Default::default()
    };

    let err = start_server(dir.path(), &config).await.unwrap_err();
    assert!(matches!(err, StartError::Spawn(_)), "{err:?}");
    assert!(!err.is_invariant_violation());
}

#[tokio::test]
async fn silent_server_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        startup_timeout_ms: 300,
        termination: short_policy(),
        ..shell("echo 'still compiling'; exec sleep 30")
    };

    let err = start_server(dir.path(), &config).await.unwrap_err();
    match err {
        StartError::Timeout { timeout_ms, stdout, .. } => {
            assert_eq!(timeout_ms, 300);
            assert!(stdout.contains("still compiling"));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn escalates_from_ignored_interrupt_to_terminate() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = Duration::from_millis(300);
    let t2 = Duration::from_millis(2_000);
    let config = ServerConfig {
        termination: TerminationPolicy::new(vec![
            EscalationStep::new(TerminationSignal::Interrupt, t1),
            EscalationStep::new(TerminationSignal::Terminate, t2),
        ]),
        ..shell("trap '' INT; echo 'Server is running on http://localhost:5050'; while :; do sleep 0.05; done")
    };

    let mut server = start_server(dir.path(), &config).await.unwrap();

    let started = Instant::now();
    let outcome = stop_server(&mut server).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        outcome.signals_sent(),
        &[TerminationSignal::Interrupt, TerminationSignal::Terminate]
    );
    assert!(elapsed >= t1, "stopped after {elapsed:?}, before the first wait ran out");
    assert!(elapsed < t1 + t2 + Duration::from_millis(500), "stopped after {elapsed:?}");
}

#[tokio::test]
async fn second_stop_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell("echo 'Server is running on http://localhost:4000'; exec sleep 30");

    let mut server = start_server(dir.path(), &config).await.unwrap();
    let first = stop_server(&mut server).await.unwrap();
    assert!(matches!(first, StopOutcome::Exited { .. }));

    let started = Instant::now();
    let second = stop_server(&mut server).await.unwrap();
    assert_eq!(second, StopOutcome::AlreadyStopped);
    assert!(second.signals_sent().is_empty());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn stop_after_exit_sends_no_signal() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell("echo 'Server is running on http://localhost:4001'; sleep 0.2; exit 0");

    let mut server = start_server(dir.path(), &config).await.unwrap();
    server.process().handle().wait().await;

    let started = Instant::now();
    let outcome = stop_server(&mut server).await.unwrap();
    assert!(matches!(outcome, StopOutcome::NotRunning { exit } if exit.success()));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn output_after_readiness_is_captured() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell("echo 'Server is running on http://localhost:4002'; sleep 0.1; echo 'GET / 200'; exec sleep 30");

    let mut server = start_server(dir.path(), &config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.output().stdout.contains("GET / 200"));

    stop_server(&mut server).await.unwrap();
}
