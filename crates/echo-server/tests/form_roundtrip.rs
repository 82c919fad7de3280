//! Full browser round trip against the echo server
//!
//! Needs Node with the `playwright` package and its browsers installed
//! (`formprobe doctor` checks this). Run with:
//! cargo test --package formprobe-echo --test form_roundtrip -- --ignored

#![cfg(unix)]

use formprobe_harness::form::FormStage;
use formprobe_harness::{
    run_form_scenario, start_server, stop_server, FieldInput, FormTestConfig, RunningServer, ServerConfig,
    SuccessIndicator,
};

async fn echo_server() -> RunningServer {
    let config = ServerConfig {
        program: env!("CARGO_BIN_EXE_formprobe-echo").to_string(),
        args: Vec::new(),
        port: Some(0),
        ..Default::default()
    };
    let dir = std::env::temp_dir();
    start_server(&dir, &config).await.unwrap()
}

fn echo_form(path: &str, indicator: SuccessIndicator) -> FormTestConfig {
    FormTestConfig {
        browser: Default::default(),
        launch: Default::default(),
        url: path.to_string(),
        form_selector: Some("form#echo".to_string()),
        fields: vec![
            FieldInput {
                selector: "#name".to_string(),
                value: "Ada".to_string(),
            },
            FieldInput {
                selector: "#data".to_string(),
                value: "test-data-123".to_string(),
            },
        ],
        submit_selector: "button[type=submit]".to_string(),
        success_indicator: indicator,
        result_selector: Some("#submittedData".to_string()),
        timeout_ms: 10_000,
        require_fresh_indicator: true,
        screenshot_on_failure: None,
    }
}

#[tokio::test]
#[ignore = "needs node and playwright"]
async fn navigating_submit_echoes_data() {
    let mut server = echo_server().await;
    let config = echo_form("/", SuccessIndicator::TextOnPage("Form submitted successfully".to_string()))
        .with_base_url(&server.base_url());

    let result = run_form_scenario(config).await;
    stop_server(&mut server).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.retrieved_text.as_deref().map(str::trim), Some("test-data-123"));
    assert!(result.final_url.unwrap_or_default().ends_with("/submit"));
}

#[tokio::test]
#[ignore = "needs node and playwright"]
async fn in_page_submit_without_navigation() {
    let mut server = echo_server().await;
    let config = echo_form("/spa", SuccessIndicator::ElementSelector("#submittedData".to_string()))
        .with_base_url(&server.base_url());

    let result = run_form_scenario(config).await;
    stop_server(&mut server).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.retrieved_text.as_deref(), Some("test-data-123"));
}

#[tokio::test]
#[ignore = "needs node and playwright"]
async fn indicator_present_before_submit_is_rejected() {
    let mut server = echo_server().await;
    let mut config = echo_form("/stale", SuccessIndicator::TextOnPage("Form submitted successfully".to_string()))
        .with_base_url(&server.base_url());
    config.result_selector = None;
    config.timeout_ms = 2_000;

    let result = run_form_scenario(config).await;
    stop_server(&mut server).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_stage, Some(FormStage::Verify));
    assert!(result.error.unwrap_or_default().contains("already present"));
}
