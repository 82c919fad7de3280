//! Browser automation seam
//!
//! The form driver only talks to [`BrowserLauncher`] and [`BrowserPage`].
//! The production backend is the Node/Playwright bridge in [`playwright`];
//! unit tests use an in-memory scripted page.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::BrowserError;

pub mod playwright;

#[cfg(test)]
pub(crate) mod testing;

pub use playwright::PlaywrightBridge;

/// Browser engines Playwright can drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrowserKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" | "safari" => Ok(BrowserKind::Webkit),
            other => Err(format!("unknown browser: {} (expected chromium, firefox or webkit)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Options applied when the browser is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    pub headless: bool,

    /// Extra command-line arguments for the browser binary
    pub args: Vec<String>,

    /// Delay Playwright inserts between operations
    pub slow_mo_ms: u64,

    pub viewport: Viewport,

    pub ignore_https_errors: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            args: Vec::new(),
            slow_mo_ms: 0,
            viewport: Viewport::default(),
            ignore_https_errors: false,
        }
    }
}

/// Pending navigation wait: `true` if a navigation committed in time.
pub type NavigationWait = BoxFuture<'static, Result<bool, BrowserError>>;

/// Launches a browser and opens one page
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, kind: BrowserKind, options: &LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

/// One page in a launched browser.
///
/// `scope` narrows element lookups to the first match of a container
/// selector (a form, usually).
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Number of elements matching `selector`, checked immediately.
    async fn count(&self, scope: Option<&str>, selector: &str) -> Result<usize, BrowserError>;

    /// Number of elements whose text contains `text`.
    async fn count_text(&self, text: &str) -> Result<usize, BrowserError>;

    async fn fill(&self, scope: Option<&str>, selector: &str, value: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn click(&self, scope: Option<&str>, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// `Ok(false)` on timeout.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool, BrowserError>;

    /// Wait for an element containing `text`. `Ok(false)` on timeout.
    async fn wait_for_text(&self, text: &str, timeout: Duration) -> Result<bool, BrowserError>;

    /// Start listening for a full-page navigation.
    ///
    /// The listener is registered before this returns, so a navigation
    /// caused by a later call is never missed.
    async fn expect_navigation(&self, timeout: Duration) -> Result<NavigationWait, BrowserError>;

    /// Text of the first match, `None` if nothing matches.
    async fn text_content(&self, selector: &str) -> Result<Option<String>, BrowserError>;

    async fn url(&self) -> Result<String, BrowserError>;

    async fn title(&self) -> Result<String, BrowserError>;

    /// Full-page PNG screenshot.
    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError>;

    /// Close the browser. Safe to call more than once.
    async fn close(&self) -> Result<(), BrowserError>;
}
