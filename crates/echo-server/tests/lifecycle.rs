//! The echo binary under the harness lifecycle controller
//!
//! Run with: cargo test --package formprobe-echo --test lifecycle

#![cfg(unix)]

use std::time::Duration;

use formprobe_harness::{start_server, stop_server, ServerConfig, StartError, StopOutcome, TerminationSignal};

fn echo_server(port: u16) -> ServerConfig {
    ServerConfig {
        program: env!("CARGO_BIN_EXE_formprobe-echo").to_string(),
        args: Vec::new(),
        port: Some(port),
        health_path: Some("/health".to_string()),
        startup_timeout_ms: 10_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn ephemeral_port_is_read_from_stdout() {
    let dir = tempfile::tempdir().unwrap();

    let mut server = start_server(dir.path(), &echo_server(0)).await.unwrap();
    assert_ne!(server.port(), 0);
    assert!(server.output().stdout.starts_with("Server is running on http://localhost:"));

    let outcome = stop_server(&mut server).await.unwrap();
    match outcome {
        StopOutcome::Exited { exit, signals_sent, .. } => {
            // Graceful shutdown on SIGINT exits cleanly.
            assert!(exit.success(), "{exit}");
            assert_eq!(signals_sent, vec![TerminationSignal::Interrupt]);
        }
        other => panic!("expected Exited, got {other:?}"),
    }
}

#[tokio::test]
async fn occupied_port_fails_before_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = start_server(dir.path(), &echo_server(0)).await.unwrap();

    let started = std::time::Instant::now();
    let err = start_server(dir.path(), &echo_server(first.port())).await.unwrap_err();
    assert!(
        matches!(err, StartError::FailureOutput { .. } | StartError::ExitedPrematurely { .. }),
        "unexpected error: {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(10));

    stop_server(&mut first).await.unwrap();
}
