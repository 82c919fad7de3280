//! In-memory browser for driver tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;

use super::{BrowserKind, BrowserLauncher, BrowserPage, LaunchOptions, NavigationWait};
use crate::error::BrowserError;

/// Elements on a page, selector to text content
#[derive(Debug, Clone, Default)]
pub(crate) struct PageState {
    pub elements: BTreeMap<String, String>,
}

impl PageState {
    pub fn with(mut self, selector: &str, text: &str) -> Self {
        self.elements.insert(selector.to_string(), text.to_string());
        self
    }
}

/// How the fake site behaves
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedSite {
    /// Page before the submit click
    pub before: PageState,
    /// Page after the submit click
    pub after: PageState,
    /// Whether submitting causes a full-page navigation
    pub navigates: bool,
    pub unreachable: bool,
    pub fail_launch: bool,
}

/// What the driver did to the fake
#[derive(Debug, Default)]
pub(crate) struct Recorded {
    pub fills: Vec<(String, String)>,
    pub clicks: Vec<String>,
    pub screenshots: Vec<PathBuf>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedBrowser {
    pub site: ScriptedSite,
    pub closed: Arc<AtomicBool>,
    pub recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedBrowser {
    pub fn new(site: ScriptedSite) -> Self {
        Self {
            site,
            ..Default::default()
        }
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedBrowser {
    async fn launch(&self, _kind: BrowserKind, _options: &LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError> {
        if self.site.fail_launch {
            return Err(BrowserError::Launch("Executable doesn't exist".to_string()));
        }
        Ok(Box::new(ScriptedPage {
            site: self.site.clone(),
            submitted: Arc::new(AtomicBool::new(false)),
            closed: Arc::clone(&self.closed),
            recorded: Arc::clone(&self.recorded),
        }))
    }
}

struct ScriptedPage {
    site: ScriptedSite,
    submitted: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedPage {
    fn state(&self) -> &PageState {
        if self.submitted.load(Ordering::SeqCst) {
            &self.site.after
        } else {
            &self.site.before
        }
    }

    fn has(&self, scope: Option<&str>, selector: &str) -> bool {
        let state = self.state();
        scope.map_or(true, |s| state.elements.contains_key(s)) && state.elements.contains_key(selector)
    }

    fn text_count(&self, text: &str) -> usize {
        self.state().elements.values().filter(|t| t.contains(text)).count()
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        if self.site.unreachable {
            return Err(BrowserError::Operation {
                op: "goto".to_string(),
                message: format!("net::ERR_CONNECTION_REFUSED at {} ({}ms)", url, timeout.as_millis()),
            });
        }
        Ok(())
    }

    async fn count(&self, scope: Option<&str>, selector: &str) -> Result<usize, BrowserError> {
        Ok(usize::from(self.has(scope, selector)))
    }

    async fn count_text(&self, text: &str) -> Result<usize, BrowserError> {
        Ok(self.text_count(text))
    }

    async fn fill(&self, _scope: Option<&str>, selector: &str, value: &str, _timeout: Duration) -> Result<(), BrowserError> {
        self.recorded.lock().fills.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&self, _scope: Option<&str>, selector: &str, _timeout: Duration) -> Result<(), BrowserError> {
        self.recorded.lock().clicks.push(selector.to_string());
        self.submitted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> Result<bool, BrowserError> {
        Ok(self.has(None, selector))
    }

    async fn wait_for_text(&self, text: &str, _timeout: Duration) -> Result<bool, BrowserError> {
        Ok(self.text_count(text) > 0)
    }

    async fn expect_navigation(&self, _timeout: Duration) -> Result<NavigationWait, BrowserError> {
        let submitted = Arc::clone(&self.submitted);
        let navigates = self.site.navigates;
        Ok(async move { Ok(navigates && submitted.load(Ordering::SeqCst)) }.boxed())
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        Ok(self.state().elements.get(selector).cloned())
    }

    async fn url(&self) -> Result<String, BrowserError> {
        if self.submitted.load(Ordering::SeqCst) && self.site.navigates {
            Ok("http://localhost:4321/submit".to_string())
        } else {
            Ok("http://localhost:4321/".to_string())
        }
    }

    async fn title(&self) -> Result<String, BrowserError> {
        Ok("Test Form".to_string())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        self.recorded.lock().screenshots.push(path.to_path_buf());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
