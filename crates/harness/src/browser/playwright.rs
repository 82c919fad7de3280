//! Playwright browser automation over a Node bridge
//!
//! Each launched page owns one `node` process running [`BRIDGE_SCRIPT`]. The
//! script reads JSON requests from stdin, one per line, and answers each with
//! a JSON reply carrying the same id. Requests are handled concurrently on the
//! Node side, which is what lets a navigation wait stay open while a click is
//! in flight.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BrowserKind, BrowserLauncher, BrowserPage, LaunchOptions, NavigationWait};
use crate::error::BrowserError;

/// Extra time granted on the Rust side over a Playwright-level timeout
const REPLY_SLACK: Duration = Duration::from_secs(5);

/// Limit for calls that carry no timeout of their own
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for Node to exit before killing it
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Node side of the bridge
pub const BRIDGE_SCRIPT: &str = r#"'use strict';
const readline = require('readline');

let browser = null;
let page = null;

function reply(message) {
  process.stdout.write(JSON.stringify(message) + '\n');
}

function root(scope) {
  return scope ? page.locator(scope).first() : page;
}

async function waited(promise) {
  try {
    await promise;
    return true;
  } catch (error) {
    if (error && error.name === 'TimeoutError') return false;
    throw error;
  }
}

const ops = {
  async launch({ browser: kind, options }) {
    const playwright = require('playwright');
    const type = playwright[kind];
    if (!type) throw new Error(`unknown browser ${kind}`);
    browser = await type.launch({
      headless: options.headless,
      args: options.args,
      slowMo: options.slow_mo_ms,
    });
    const context = await browser.newContext({
      viewport: options.viewport,
      ignoreHTTPSErrors: options.ignore_https_errors,
    });
    page = await context.newPage();
    return null;
  },
  async goto({ url, timeout }) {
    await page.goto(url, { timeout });
    return null;
  },
  async count({ scope, selector }) {
    if (scope && (await page.locator(scope).count()) === 0) return 0;
    return await root(scope).locator(selector).count();
  },
  async count_text({ text }) {
    return await page.getByText(text).count();
  },
  async fill({ scope, selector, value, timeout }) {
    await root(scope).locator(selector).first().fill(value, { timeout });
    return null;
  },
  async click({ scope, selector, timeout }) {
    await root(scope).locator(selector).first().click({ timeout });
    return null;
  },
  wait_for_selector({ selector, timeout }) {
    return waited(page.waitForSelector(selector, { timeout }));
  },
  wait_for_text({ text, timeout }) {
    return waited(page.getByText(text).first().waitFor({ timeout }));
  },
  expect_navigation({ timeout }) {
    return waited(page.waitForNavigation({ timeout }));
  },
  async text_content({ selector }) {
    const locator = page.locator(selector).first();
    if ((await locator.count()) === 0) return null;
    return await locator.textContent();
  },
  async url() {
    return page.url();
  },
  async title() {
    return await page.title();
  },
  async screenshot({ path }) {
    await page.screenshot({ path, fullPage: true });
    return null;
  },
  async close() {
    if (browser) {
      const closing = browser;
      browser = null;
      page = null;
      await closing.close();
    }
    return null;
  },
};

async function handle(line) {
  let request;
  try {
    request = JSON.parse(line);
  } catch (error) {
    reply({ id: null, ok: false, error: `malformed request: ${error.message}` });
    return;
  }
  const op = ops[request.op];
  if (!op) {
    reply({ id: request.id, ok: false, error: `unknown op ${request.op}` });
    return;
  }
  if (!page && request.op !== 'launch' && request.op !== 'close') {
    reply({ id: request.id, ok: false, error: 'no page is open' });
    return;
  }
  try {
    const value = await op(request.args || {});
    reply({ id: request.id, ok: true, value: value === undefined ? null : value });
  } catch (error) {
    reply({
      id: request.id,
      ok: false,
      error: error && error.message ? error.message : String(error),
      timeout: Boolean(error && error.name === 'TimeoutError'),
    });
  }
}

const input = readline.createInterface({ input: process.stdin });
input.on('line', (line) => {
  handle(line);
});
input.on('close', async () => {
  if (browser) {
    try {
      await browser.close();
    } catch (error) {
      // already gone
    }
  }
  process.exit(0);
});
"#;

/// Launches browsers through `node` and the `playwright` package
#[derive(Debug, Clone)]
pub struct PlaywrightBridge {
    node: String,
    node_path: Option<String>,
}

impl Default for PlaywrightBridge {
    fn default() -> Self {
        Self::new("node")
    }
}

impl PlaywrightBridge {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            node_path: None,
        }
    }

    /// `NODE_PATH` for the bridge, for a `playwright` install outside the
    /// usual module resolution.
    pub fn with_node_path(mut self, node_path: Option<String>) -> Self {
        self.node_path = node_path;
        self
    }

    /// Configure from `FORMPROBE_NODE` and `FORMPROBE_NODE_PATH`.
    pub fn from_env() -> Self {
        let node = std::env::var("FORMPROBE_NODE").unwrap_or_else(|_| "node".to_string());
        Self::new(node).with_node_path(std::env::var("FORMPROBE_NODE_PATH").ok())
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Check that Node runs and can load `playwright`.
    pub async fn check_available(&self) -> Result<(), BrowserError> {
        let output = self
            .command()
            .args(["-e", "require('playwright')"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BrowserError::Unavailable(format!("cannot run {}: {}", self.node, e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("Error:"))
            .unwrap_or("require('playwright') failed");
        Err(BrowserError::Unavailable(reason.to_string()))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.node);
        if let Some(node_path) = &self.node_path {
            cmd.env("NODE_PATH", node_path);
        }
        cmd
    }
}

#[async_trait]
impl BrowserLauncher for PlaywrightBridge {
    async fn launch(&self, kind: BrowserKind, options: &LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError> {
        // Write the script to a temp dir and run it with node
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("formprobe-bridge.js");
        tokio::fs::write(&script_path, BRIDGE_SCRIPT).await?;

        let mut child = self
            .command()
            .arg(&script_path)
            .current_dir(script_dir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Unavailable(format!("cannot run {}: {}", self.node, e)))?;

        let connection = Connection::attach(&mut child)?;
        let page = PlaywrightPage {
            connection: Arc::new(connection),
            child: tokio::sync::Mutex::new(Some(child)),
            closed: AtomicBool::new(false),
            _script_dir: script_dir,
        };

        debug!(target: "formprobe::browser", browser = %kind, headless = options.headless, "launching browser");
        let launched = page
            .connection
            .call("launch", json!({ "browser": kind.as_str(), "options": options }), DEFAULT_CALL_TIMEOUT * 2)
            .await;
        match launched {
            Ok(_) => Ok(Box::new(page)),
            Err(BrowserError::Operation { message, .. }) => Err(BrowserError::Launch(message)),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: bool,
}

impl Reply {
    fn into_result(self, op: &str, timeout: Duration) -> Result<Value, BrowserError> {
        if self.ok {
            Ok(self.value)
        } else if self.timeout {
            Err(BrowserError::Timeout {
                op: op.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        } else {
            Err(BrowserError::Operation {
                op: op.to_string(),
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// A request that has been written to the bridge and awaits its reply
struct PendingCall {
    id: u64,
    reply: oneshot::Receiver<Reply>,
}

/// Request/reply plumbing over the bridge's stdin and stdout
struct Connection {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl Connection {
    fn attach(child: &mut Child) -> Result<Self, BrowserError> {
        let stdin = child.stdin.take().ok_or(BrowserError::BridgeClosed)?;
        let stdout = child.stdout.take().ok_or(BrowserError::BridgeClosed)?;
        let stderr = child.stderr.take().ok_or(BrowserError::BridgeClosed)?;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let replies = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => dispatch(&replies, &line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "formprobe::browser", "failed to read from bridge: {}", e);
                        break;
                    }
                }
            }
            // Callers still waiting see BridgeClosed.
            replies.lock().clear();
        });

        let stderr = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "formprobe::browser", "{}", line);
            }
        });

        Ok(Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            reader,
            stderr,
        })
    }

    /// Write a request; the reply is awaited separately with [`finish`](Self::finish).
    async fn send(&self, op: &str, args: Value) -> Result<PendingCall, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&json!({ "id": id, "op": op, "args": args }))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let written = match stdin.as_mut() {
            Some(stdin) => match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            },
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bridge stdin closed")),
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            debug!(target: "formprobe::browser", op, "write to bridge failed: {}", e);
            return Err(BrowserError::BridgeClosed);
        }

        Ok(PendingCall { id, reply: rx })
    }

    async fn finish(&self, call: PendingCall, op: &str, timeout: Duration) -> Result<Value, BrowserError> {
        match tokio::time::timeout(timeout + REPLY_SLACK, call.reply).await {
            Ok(Ok(reply)) => reply.into_result(op, timeout),
            Ok(Err(_)) => Err(BrowserError::BridgeClosed),
            Err(_) => {
                self.pending.lock().remove(&call.id);
                Err(BrowserError::Timeout {
                    op: op.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn call(&self, op: &str, args: Value, timeout: Duration) -> Result<Value, BrowserError> {
        let call = self.send(op, args).await?;
        self.finish(call, op, timeout).await
    }

    /// Closing stdin tells the bridge to shut down.
    async fn hang_up(&self) {
        self.stdin.lock().await.take();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.stderr.abort();
    }
}

fn dispatch(pending: &Pending, line: &str) {
    let reply: Reply = match serde_json::from_str(line) {
        Ok(reply) => reply,
        Err(e) => {
            debug!(target: "formprobe::browser", "ignoring non-protocol output {:?}: {}", line, e);
            return;
        }
    };
    let Some(id) = reply.id else {
        warn!(target: "formprobe::browser", "bridge rejected a request: {}", reply.error.as_deref().unwrap_or("unknown error"));
        return;
    };
    match pending.lock().remove(&id) {
        // The caller may have given up already.
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(target: "formprobe::browser", id, "late reply dropped"),
    }
}

fn millis(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

fn expect_bool(op: &str, value: Value) -> Result<bool, BrowserError> {
    value
        .as_bool()
        .ok_or_else(|| BrowserError::Protocol(format!("{} returned {}, expected a boolean", op, value)))
}

fn expect_count(op: &str, value: Value) -> Result<usize, BrowserError> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| BrowserError::Protocol(format!("{} returned {}, expected a count", op, value)))
}

fn expect_string(op: &str, value: Value) -> Result<String, BrowserError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(BrowserError::Protocol(format!("{} returned {}, expected a string", op, other))),
    }
}

/// A page inside a bridged browser
struct PlaywrightPage {
    connection: Arc<Connection>,
    child: tokio::sync::Mutex<Option<Child>>,
    closed: AtomicBool,
    _script_dir: tempfile::TempDir,
}

#[async_trait]
impl BrowserPage for PlaywrightPage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        debug!(target: "formprobe::browser", %url, "goto");
        self.connection
            .call("goto", json!({ "url": url, "timeout": millis(timeout) }), timeout)
            .await?;
        Ok(())
    }

    async fn count(&self, scope: Option<&str>, selector: &str) -> Result<usize, BrowserError> {
        let value = self
            .connection
            .call("count", json!({ "scope": scope, "selector": selector }), DEFAULT_CALL_TIMEOUT)
            .await?;
        expect_count("count", value)
    }

    async fn count_text(&self, text: &str) -> Result<usize, BrowserError> {
        let value = self
            .connection
            .call("count_text", json!({ "text": text }), DEFAULT_CALL_TIMEOUT)
            .await?;
        expect_count("count_text", value)
    }

    async fn fill(&self, scope: Option<&str>, selector: &str, value: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.connection
            .call(
                "fill",
                json!({ "scope": scope, "selector": selector, "value": value, "timeout": millis(timeout) }),
                timeout,
            )
            .await?;
        Ok(())
    }

    async fn click(&self, scope: Option<&str>, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.connection
            .call(
                "click",
                json!({ "scope": scope, "selector": selector, "timeout": millis(timeout) }),
                timeout,
            )
            .await?;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool, BrowserError> {
        let value = self
            .connection
            .call("wait_for_selector", json!({ "selector": selector, "timeout": millis(timeout) }), timeout)
            .await?;
        expect_bool("wait_for_selector", value)
    }

    async fn wait_for_text(&self, text: &str, timeout: Duration) -> Result<bool, BrowserError> {
        let value = self
            .connection
            .call("wait_for_text", json!({ "text": text, "timeout": millis(timeout) }), timeout)
            .await?;
        expect_bool("wait_for_text", value)
    }

    async fn expect_navigation(&self, timeout: Duration) -> Result<NavigationWait, BrowserError> {
        let call = self
            .connection
            .send("expect_navigation", json!({ "timeout": millis(timeout) }))
            .await?;
        let connection = Arc::clone(&self.connection);
        Ok(async move {
            let value = connection.finish(call, "expect_navigation", timeout).await?;
            expect_bool("expect_navigation", value)
        }
        .boxed())
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        let value = self
            .connection
            .call("text_content", json!({ "selector": selector }), DEFAULT_CALL_TIMEOUT)
            .await?;
        match value {
            Value::Null => Ok(None),
            other => expect_string("text_content", other).map(Some),
        }
    }

    async fn url(&self) -> Result<String, BrowserError> {
        let value = self.connection.call("url", Value::Null, DEFAULT_CALL_TIMEOUT).await?;
        expect_string("url", value)
    }

    async fn title(&self) -> Result<String, BrowserError> {
        let value = self.connection.call("title", Value::Null, DEFAULT_CALL_TIMEOUT).await?;
        expect_string("title", value)
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        self.connection
            .call("screenshot", json!({ "path": path }), DEFAULT_CALL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let closed = self.connection.call("close", Value::Null, DEFAULT_CALL_TIMEOUT).await;
        self.connection.hang_up().await;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(target: "formprobe::browser", %status, "bridge exited"),
                Ok(Err(e)) => warn!(target: "formprobe::browser", "failed to wait for bridge: {}", e),
                Err(_) => {
                    warn!(target: "formprobe::browser", "bridge did not exit, killing it");
                    let _ = child.kill().await;
                }
            }
        }

        closed.map(|_| ())
    }
}
