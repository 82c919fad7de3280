//! Form scenario driver
//!
//! Runs one [`FormTestConfig`] against a freshly launched browser: navigate,
//! fill, submit, verify. Stages run strictly in order and the first failure
//! ends the run. The browser is closed on every path.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserKind, BrowserLauncher, BrowserPage, LaunchOptions};
use crate::error::{BrowserError, FormFailure};

const TEXT_CHANGE_POLL: Duration = Duration::from_millis(100);

/// One field to populate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInput {
    pub selector: String,
    pub value: String,
}

/// What proves the submission worked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessIndicator {
    /// Some element on the page contains this text
    TextOnPage(String),
    /// An element matching this selector exists
    ElementSelector(String),
}

impl SuccessIndicator {
    pub fn value(&self) -> &str {
        match self {
            SuccessIndicator::TextOnPage(value) | SuccessIndicator::ElementSelector(value) => value,
        }
    }
}

impl fmt::Display for SuccessIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessIndicator::TextOnPage(text) => write!(f, "text {:?}", text),
            SuccessIndicator::ElementSelector(selector) => write!(f, "element {}", selector),
        }
    }
}

/// Declarative form scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormTestConfig {
    #[serde(default)]
    pub browser: BrowserKind,

    #[serde(default)]
    pub launch: LaunchOptions,

    /// Absolute URL, or a path resolved against the server's base URL
    pub url: String,

    /// Container the field and submit lookups are scoped to
    #[serde(default)]
    pub form_selector: Option<String>,

    pub fields: Vec<FieldInput>,

    pub submit_selector: String,

    pub success_indicator: SuccessIndicator,

    /// Element whose text is read after a successful submission
    #[serde(default)]
    pub result_selector: Option<String>,

    /// Bound for navigation, each element operation and the indicator wait
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Without a navigation, an indicator that was already on the page must change
    #[serde(default = "default_true")]
    pub require_fresh_indicator: bool,

    /// Where to save a full-page screenshot if the run fails
    #[serde(default)]
    pub screenshot_on_failure: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl FormTestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve a relative `url` against `base_url`.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            let base = base_url.trim_end_matches('/');
            self.url = if self.url.starts_with('/') {
                format!("{}{}", base, self.url)
            } else {
                format!("{}/{}", base, self.url)
            };
        }
        self
    }
}

/// Driver stage, reported when a run fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormStage {
    Launch,
    Navigate,
    Scope,
    Fill,
    Submit,
    Verify,
}

impl fmt::Display for FormStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormStage::Launch => "launch",
            FormStage::Navigate => "navigate",
            FormStage::Scope => "scope",
            FormStage::Fill => "fill",
            FormStage::Submit => "submit",
            FormStage::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Outcome of one driver run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormTestResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<FormStage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

impl FormTestResult {
    fn passed(retrieved_text: Option<String>, message: String) -> Self {
        Self {
            success: true,
            retrieved_text,
            message: Some(message),
            ..Default::default()
        }
    }

    fn failed(failure: &FormFailure) -> Self {
        Self {
            success: false,
            error: Some(failure.to_string()),
            failed_stage: Some(failure.stage()),
            ..Default::default()
        }
    }
}

/// Indicator state captured just before the submit click
#[derive(Debug, Default)]
struct IndicatorSnapshot {
    present: bool,
    text: Option<String>,
}

/// Drives form scenarios through a [`BrowserLauncher`]
pub struct FormDriver<L> {
    launcher: L,
}

impl<L: BrowserLauncher> FormDriver<L> {
    pub fn new(launcher: L) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run the scenario. Failures are reported in the result, never as `Err`.
    pub async fn run(&self, config: FormTestConfig) -> FormTestResult {
        info!(target: "formprobe::browser", url = %config.url, browser = %config.browser, "running form scenario");

        let page = match self.launcher.launch(config.browser, &config.launch).await {
            Ok(page) => page,
            Err(e) => {
                let failure = FormFailure::Launch(e);
                warn!(target: "formprobe::browser", "{}", failure);
                return FormTestResult::failed(&failure);
            }
        };

        let mut result = match drive(page.as_ref(), &config).await {
            Ok(result) => result,
            Err(failure) => {
                warn!(target: "formprobe::browser", stage = %failure.stage(), "{}", failure);
                let mut result = FormTestResult::failed(&failure);
                if let Some(path) = &config.screenshot_on_failure {
                    result.screenshot = save_screenshot(page.as_ref(), path).await;
                }
                result
            }
        };

        result.final_url = page.url().await.ok();
        result.page_title = page.title().await.ok();

        if let Err(e) = page.close().await {
            warn!(target: "formprobe::browser", "failed to close browser: {}", e);
        }
        result
    }
}

async fn drive(page: &dyn BrowserPage, config: &FormTestConfig) -> Result<FormTestResult, FormFailure> {
    let timeout = config.timeout();

    page.goto(&config.url, timeout)
        .await
        .map_err(|e| FormFailure::Navigation {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

    let scope = config.form_selector.as_deref();
    if let Some(form) = scope {
        if page.count(None, form).await.map_err(browser(FormStage::Scope))? == 0 {
            return Err(FormFailure::FormNotFound {
                selector: form.to_string(),
            });
        }
    }

    for field in &config.fields {
        if page.count(scope, &field.selector).await.map_err(browser(FormStage::Fill))? == 0 {
            return Err(FormFailure::FieldNotFound {
                selector: field.selector.clone(),
            });
        }
        page.fill(scope, &field.selector, &field.value, timeout)
            .await
            .map_err(|e| FormFailure::Fill {
                selector: field.selector.clone(),
                reason: e.to_string(),
            })?;
        debug!(target: "formprobe::browser", selector = %field.selector, "filled field");
    }

    let submit = config.submit_selector.as_str();
    if page.count(scope, submit).await.map_err(browser(FormStage::Submit))? == 0 {
        return Err(FormFailure::SubmitNotFound {
            selector: submit.to_string(),
        });
    }

    let before = if config.require_fresh_indicator {
        snapshot(page, &config.success_indicator).await?
    } else {
        IndicatorSnapshot::default()
    };

    // Listen before clicking so a fast navigation is not missed.
    let navigation = page
        .expect_navigation(timeout)
        .await
        .map_err(browser(FormStage::Submit))?;
    page.click(scope, submit, timeout)
        .await
        .map_err(|e| FormFailure::Click {
            selector: submit.to_string(),
            reason: e.to_string(),
        })?;
    let navigated = match navigation.await {
        Ok(true) => true,
        Ok(false) => {
            info!(target: "formprobe::browser", "no navigation after submit within {}ms, checking the current page", config.timeout_ms);
            false
        }
        Err(e) => {
            warn!(target: "formprobe::browser", "navigation wait failed: {}", e);
            false
        }
    };

    verify(page, config, &before, navigated).await?;

    let retrieved_text = match &config.result_selector {
        Some(selector) => retrieve(page, selector).await,
        None => None,
    };

    let message = if navigated {
        format!("form submitted and {} found after navigation", config.success_indicator)
    } else {
        format!("form submitted and {} found", config.success_indicator)
    };
    info!(target: "formprobe::browser", "{}", message);
    Ok(FormTestResult::passed(retrieved_text, message))
}

fn browser(stage: FormStage) -> impl Fn(BrowserError) -> FormFailure {
    move |source| FormFailure::Browser { stage, source }
}

async fn snapshot(page: &dyn BrowserPage, indicator: &SuccessIndicator) -> Result<IndicatorSnapshot, FormFailure> {
    let snapshot = match indicator {
        SuccessIndicator::TextOnPage(text) => IndicatorSnapshot {
            present: page.count_text(text).await.map_err(browser(FormStage::Submit))? > 0,
            text: None,
        },
        SuccessIndicator::ElementSelector(selector) => {
            let text = page.text_content(selector).await.map_err(browser(FormStage::Submit))?;
            IndicatorSnapshot {
                present: text.is_some(),
                text,
            }
        }
    };
    if snapshot.present {
        debug!(target: "formprobe::browser", %indicator, "success indicator present before submit");
    }
    Ok(snapshot)
}

async fn verify(
    page: &dyn BrowserPage,
    config: &FormTestConfig,
    before: &IndicatorSnapshot,
    navigated: bool,
) -> Result<(), FormFailure> {
    let timeout = config.timeout();
    let indicator = &config.success_indicator;

    let found = match indicator {
        SuccessIndicator::TextOnPage(text) => page.wait_for_text(text, timeout).await,
        SuccessIndicator::ElementSelector(selector) => page.wait_for_selector(selector, timeout).await,
    };
    let found = match found {
        Ok(found) => found,
        Err(e) if e.is_timeout() => false,
        Err(e) => return Err(FormFailure::Browser { stage: FormStage::Verify, source: e }),
    };
    if !found {
        return Err(FormFailure::IndicatorTimeout {
            indicator: indicator.to_string(),
            timeout_ms: config.timeout_ms,
        });
    }

    if navigated || !before.present {
        return Ok(());
    }

    // Same page, and the indicator was already there.
    let changed = match indicator {
        SuccessIndicator::TextOnPage(_) => false,
        SuccessIndicator::ElementSelector(selector) => {
            wait_for_text_change(page, selector, before.text.as_deref(), timeout).await?
        }
    };
    if changed {
        Ok(())
    } else {
        Err(FormFailure::StaleSuccessIndicator {
            indicator: indicator.to_string(),
        })
    }
}

async fn wait_for_text_change(
    page: &dyn BrowserPage,
    selector: &str,
    previous: Option<&str>,
    timeout: Duration,
) -> Result<bool, FormFailure> {
    let deadline = Instant::now() + timeout;
    loop {
        let current = page.text_content(selector).await.map_err(browser(FormStage::Verify))?;
        if current.is_some() && current.as_deref() != previous {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(TEXT_CHANGE_POLL).await;
    }
}

async fn retrieve(page: &dyn BrowserPage, selector: &str) -> Option<String> {
    match page.text_content(selector).await {
        Ok(Some(text)) => Some(text),
        Ok(None) => {
            warn!(target: "formprobe::browser", %selector, "result element not found");
            None
        }
        Err(e) => {
            warn!(target: "formprobe::browser", %selector, "could not read result text: {}", e);
            None
        }
    }
}

async fn save_screenshot(page: &dyn BrowserPage, path: &std::path::Path) -> Option<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(target: "formprobe::browser", "cannot create {}: {}", parent.display(), e);
            return None;
        }
    }
    match page.screenshot(path).await {
        Ok(()) => {
            info!(target: "formprobe::browser", "failure screenshot saved to {}", path.display());
            Some(path.to_path_buf())
        }
        Err(e) => {
            warn!(target: "formprobe::browser", "failure screenshot not saved: {}", e);
            None
        }
    }
}
