//! Playwright browser automation
//!
//! Playwright runs inside one long-lived Node.js process. Rust talks to it
//! over newline-delimited JSON on stdin/stdout: every request carries an id,
//! every response echoes it, so lanes can issue calls concurrently. The
//! browser is launched once; each scenario opens its own browser context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::browser::{BrowserContext, BrowserDriver, ContextOptions, LoadState, NavigationOutcome};
use crate::config::BrowserConfig;
use crate::error::{ActionError, BrowserError};
use crate::locator::Locator;

/// How long the bridge may take to launch the browser
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack on top of an action's own timeout before the Rust side gives up
const BRIDGE_GRACE: Duration = Duration::from_secs(2);

/// Request id reserved for the startup handshake
const READY_ID: u64 = 0;

const BRIDGE_JS: &str = r#"
const readline = require('readline');
const pw = require('playwright');

const engine = process.env.STEPWISE_BROWSER || 'chromium';
const headless = process.env.STEPWISE_HEADLESS !== '0';

let browser = null;
const contexts = new Map();
let nextContext = 1;

function reply(msg) {
  process.stdout.write(JSON.stringify(msg) + '\n');
}

function classify(err) {
  if (err && err.kind) return err;
  const message = String((err && err.message) || err);
  if (pw.errors && err instanceof pw.errors.TimeoutError) return { kind: 'timeout', message };
  if (/has been closed|Target closed|crash|disconnected/i.test(message)) return { kind: 'transport', message };
  return { kind: 'error', message };
}

function build(root, loc) {
  if (loc.css !== undefined) return root.locator(loc.css);
  if (loc.xpath !== undefined) return root.locator('xpath=' + loc.xpath);
  if (loc.text !== undefined) return root.getByText(loc.text);
  if (loc.role !== undefined) return root.getByRole(loc.role, loc.name ? { name: loc.name } : {});
  if (loc.label !== undefined) return root.getByLabel(loc.label);
  if (loc.test_id !== undefined) return root.getByTestId(loc.test_id);
  throw { kind: 'error', message: 'unsupported locator ' + JSON.stringify(loc) };
}

function roots(page) {
  const main = page.mainFrame();
  return [main, ...page.frames().filter((f) => f !== main)];
}

async function resolve(ctx, loc, timeout) {
  const deadline = Date.now() + timeout;
  for (;;) {
    for (const root of roots(ctx.page)) {
      const candidate = build(root, loc);
      const count = await candidate.count();
      if (count === 0) continue;
      if (count > 1 && ctx.strict) {
        throw { kind: 'ambiguous', message: count + ' matches', matches: count };
      }
      return candidate.first();
    }
    if (Date.now() >= deadline) throw { kind: 'not_found', message: 'no element matches' };
    await new Promise((r) => setTimeout(r, 100));
  }
}

function remaining(started, timeout) {
  return Math.max(1, timeout - (Date.now() - started));
}

function context(req) {
  const ctx = contexts.get(req.context);
  if (!ctx) throw { kind: 'transport', message: 'unknown context ' + req.context };
  return ctx;
}

const ops = {
  async new_context(req) {
    const browserContext = await browser.newContext({
      viewport: { width: req.viewport_width, height: req.viewport_height },
    });
    browserContext.setDefaultTimeout(req.timeout);
    const page = await browserContext.newPage();
    const id = 'ctx-' + nextContext++;
    contexts.set(id, { context: browserContext, page, strict: !!req.strict });
    return { id };
  },
  async close_context(req) {
    const ctx = contexts.get(req.context);
    if (!ctx) return null;
    contexts.delete(req.context);
    await ctx.context.close();
    return null;
  },
  async navigate(req) {
    const ctx = context(req);
    let timedOut = false;
    try {
      await ctx.page.goto(req.url, { waitUntil: req.wait_until, timeout: req.timeout });
    } catch (err) {
      const c = classify(err);
      if (c.kind !== 'timeout') throw c;
      timedOut = true;
    }
    for (const frame of ctx.page.frames()) {
      await frame.waitForLoadState('domcontentloaded', { timeout: 3000 }).catch(() => {});
    }
    return { url: ctx.page.url(), timed_out: timedOut };
  },
  async click(req) {
    const ctx = context(req);
    const started = Date.now();
    const el = await resolve(ctx, req.locator, req.timeout);
    await el.click({ timeout: remaining(started, req.timeout) });
    return null;
  },
  async fill(req) {
    const ctx = context(req);
    const started = Date.now();
    const el = await resolve(ctx, req.locator, req.timeout);
    await el.fill(req.value, { timeout: remaining(started, req.timeout) });
    return null;
  },
  async visible(req) {
    const ctx = context(req);
    for (const root of roots(ctx.page)) {
      const candidate = build(root, req.locator);
      if ((await candidate.count()) > 0 && (await candidate.first().isVisible())) return true;
    }
    return false;
  },
  async text(req) {
    const ctx = context(req);
    const started = Date.now();
    const el = await resolve(ctx, req.locator, req.timeout);
    return await el.innerText({ timeout: remaining(started, req.timeout) });
  },
  async url(req) {
    return context(req).page.url();
  },
  async shutdown() {
    for (const ctx of contexts.values()) await ctx.context.close().catch(() => {});
    contexts.clear();
    if (browser) await browser.close().catch(() => {});
    browser = null;
    setTimeout(() => process.exit(0), 50);
    return null;
  },
};

(async () => {
  try {
    browser = await pw[engine].launch({ headless });
  } catch (err) {
    reply({ id: 0, ok: false, error: classify(err) });
    process.exit(1);
  }
  browser.on('disconnected', () => {
    if (browser) {
      process.stderr.write('browser disconnected\n');
      process.exit(3);
    }
  });
  reply({ id: 0, ok: true, value: { ready: true } });

  const rl = readline.createInterface({ input: process.stdin });
  rl.on('line', (line) => {
    let req;
    try {
      req = JSON.parse(line);
    } catch (err) {
      process.stderr.write('bad request: ' + line + '\n');
      return;
    }
    const op = ops[req.op];
    if (!op) {
      reply({ id: req.id, ok: false, error: { kind: 'error', message: 'unknown op ' + req.op } });
      return;
    }
    Promise.resolve()
      .then(() => op(req))
      .then(
        (value) => reply({ id: req.id, ok: true, value: value === undefined ? null : value }),
        (err) => reply({ id: req.id, ok: false, error: classify(err) })
      );
  });
  rl.on('close', async () => {
    if (browser) {
      const b = browser;
      browser = null;
      await b.close().catch(() => {});
    }
    process.exit(0);
  });
})();
"#;

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    op: &'a str,
    #[serde(flatten)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<BridgeFailure>,
}

#[derive(Debug, Deserialize)]
struct BridgeFailure {
    kind: String,
    message: String,
    #[serde(default)]
    matches: Option<usize>,
}

impl BridgeFailure {
    fn into_action_error(self, what: &str, locator: Option<&Locator>, timeout: Duration) -> ActionError {
        let locator = locator.map(|l| l.to_string()).unwrap_or_default();
        match self.kind.as_str() {
            "timeout" => ActionError::ActionTimeout {
                what: what.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            "not_found" => ActionError::ElementNotFound { locator },
            "ambiguous" => ActionError::AmbiguousLocator {
                locator,
                matches: self.matches.unwrap_or(2),
            },
            "transport" => ActionError::Transport(self.message),
            _ => ActionError::Interaction(format!("{what}: {}", self.message)),
        }
    }
}

struct Bridge {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<BridgeResponse>>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    _script_dir: TempDir,
}

impl Bridge {
    async fn call(
        &self,
        op: &str,
        params: Value,
        locator: Option<&Locator>,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ActionError::Transport("browser process is not running".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&BridgeRequest { id, op, params })
            .map_err(|e| ActionError::Transport(format!("encode request: {e}")))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.pending.lock().remove(&id);
                return Err(ActionError::Transport(format!("write to browser process: {e}")));
            }
        }

        match tokio::time::timeout(timeout + BRIDGE_GRACE, rx).await {
            Ok(Ok(response)) => {
                if response.ok {
                    Ok(response.value)
                } else {
                    let failure = response.error.unwrap_or(BridgeFailure {
                        kind: "error".into(),
                        message: "unknown bridge failure".into(),
                        matches: None,
                    });
                    Err(failure.into_action_error(op, locator, timeout))
                }
            }
            Ok(Err(_)) => Err(ActionError::Transport("browser process exited".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ActionError::ActionTimeout {
                    what: format!("browser {op}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

async fn read_responses(bridge: Arc<Bridge>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<BridgeResponse>(&line) {
                Ok(response) => {
                    if let Some(tx) = bridge.pending.lock().remove(&response.id) {
                        let _ = tx.send(response);
                    }
                }
                Err(_) => debug!("bridge: {}", line),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Failed reading from browser process: {}", e);
                break;
            }
        }
    }

    bridge.alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a transport error
    bridge.pending.lock().clear();
}

/// Playwright-backed browser driver
pub struct PlaywrightDriver {
    bridge: Arc<Bridge>,
}

impl PlaywrightDriver {
    /// Start Node.js, launch the configured browser and wait for the handshake
    pub async fn launch(config: &BrowserConfig) -> Result<Self, BrowserError> {
        let node_path = node_path()?;
        Self::check_playwright_installed(&config.node, &node_path).await?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("stepwise-bridge.js");
        std::fs::write(&script_path, BRIDGE_JS)?;

        info!(
            "Launching {} ({})",
            config.engine.as_str(),
            if config.headless { "headless" } else { "headed" }
        );

        let mut child = TokioCommand::new(&config.node)
            .arg(&script_path)
            .env("NODE_PATH", &node_path)
            .env("STEPWISE_BROWSER", config.engine.as_str())
            .env("STEPWISE_HEADLESS", if config.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Launch(format!("failed to spawn {}: {}", config.node, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrowserError::Launch("browser process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrowserError::Launch("browser process has no stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("bridge stderr: {}", line);
                }
            });
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let bridge = Arc::new(Bridge {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            pending: parking_lot::Mutex::new(HashMap::from([(READY_ID, ready_tx)])),
            next_id: AtomicU64::new(READY_ID + 1),
            alive: AtomicBool::new(true),
            _script_dir: script_dir,
        });

        tokio::spawn(read_responses(bridge.clone(), stdout));

        match tokio::time::timeout(LAUNCH_TIMEOUT, ready_rx).await {
            Ok(Ok(response)) if response.ok => {
                info!("Browser ready");
                Ok(Self { bridge })
            }
            Ok(Ok(response)) => Err(BrowserError::Launch(
                response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown launch failure".into()),
            )),
            Ok(Err(_)) => Err(BrowserError::Launch(
                "browser process exited during startup".into(),
            )),
            Err(_) => Err(BrowserError::Launch(format!(
                "browser not ready after {}s",
                LAUNCH_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Check that Node.js runs and can resolve the `playwright` package
    async fn check_playwright_installed(node: &str, node_path: &str) -> Result<(), BrowserError> {
        let status = TokioCommand::new(node)
            .args(["-e", "require.resolve('playwright')"])
            .env("NODE_PATH", node_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(BrowserError::PlaywrightNotFound),
            Err(_) => Err(BrowserError::NodeNotFound(node.to_string())),
        }
    }
}

/// `NODE_PATH` with the working directory's `node_modules` first, so the
/// bridge script (written to a temp dir) resolves the project's Playwright
fn node_path() -> Result<String, BrowserError> {
    let local = std::env::current_dir()?.join("node_modules");
    let mut paths = vec![local];
    if let Some(existing) = std::env::var_os("NODE_PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths)
        .map(|joined| joined.to_string_lossy().into_owned())
        .map_err(|e| BrowserError::Launch(format!("invalid NODE_PATH: {e}")))
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn BrowserContext>, BrowserError> {
        let value = self
            .bridge
            .call(
                "new_context",
                json!({
                    "viewport_width": options.viewport_width,
                    "viewport_height": options.viewport_height,
                    "timeout": options.default_timeout.as_millis() as u64,
                    "strict": options.locator_policy.is_strict(),
                }),
                None,
                Duration::from_secs(30),
            )
            .await?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol(format!("new_context returned {value}")))?
            .to_string();

        debug!("Opened browser context {}", id);
        Ok(Box::new(PlaywrightContext {
            bridge: self.bridge.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }

    async fn shutdown(&self) -> Result<(), BrowserError> {
        if self.bridge.alive.load(Ordering::SeqCst) {
            if let Err(e) = self
                .bridge
                .call("shutdown", json!({}), None, Duration::from_secs(5))
                .await
            {
                debug!("Browser shutdown request failed: {}", e);
            }
        }

        let mut child = self.bridge.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Browser process did not exit, killing it");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

/// One browser context inside the shared Playwright process
struct PlaywrightContext {
    bridge: Arc<Bridge>,
    id: String,
    closed: AtomicBool,
}

impl PlaywrightContext {
    async fn call(
        &self,
        op: &str,
        mut params: Value,
        locator: Option<&Locator>,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ActionError::Transport(format!("context {} is closed", self.id)));
        }
        if let Value::Object(map) = &mut params {
            map.insert("context".into(), Value::String(self.id.clone()));
            map.insert("timeout".into(), json!(timeout.as_millis() as u64));
            if let Some(locator) = locator {
                map.insert("locator".into(), locator_json(locator)?);
            }
        }
        self.bridge.call(op, params, locator, timeout).await
    }
}

fn locator_json(locator: &Locator) -> Result<Value, ActionError> {
    serde_json::to_value(locator).map_err(|e| ActionError::Transport(format!("encode locator: {e}")))
}

#[async_trait]
impl BrowserContext for PlaywrightContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(
        &self,
        url: &str,
        wait_until: LoadState,
        timeout: Duration,
    ) -> Result<NavigationOutcome, ActionError> {
        let value = self
            .call(
                "navigate",
                json!({ "url": url, "wait_until": wait_until.as_playwright() }),
                None,
                timeout,
            )
            .await?;

        let landed = value
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(url)
            .to_string();
        if value.get("timed_out").and_then(Value::as_bool).unwrap_or(false) {
            Ok(NavigationOutcome::TimedOut { url: landed })
        } else {
            Ok(NavigationOutcome::Loaded { url: landed })
        }
    }

    async fn click(&self, locator: &Locator, timeout: Duration) -> Result<(), ActionError> {
        self.call("click", json!({}), Some(locator), timeout).await?;
        Ok(())
    }

    async fn fill(
        &self,
        locator: &Locator,
        value: &str,
        timeout: Duration,
    ) -> Result<(), ActionError> {
        self.call("fill", json!({ "value": value }), Some(locator), timeout)
            .await?;
        Ok(())
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, ActionError> {
        let value = self
            .call("visible", json!({}), Some(locator), Duration::from_secs(5))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn text(&self, locator: &Locator, timeout: Duration) -> Result<String, ActionError> {
        let value = self.call("text", json!({}), Some(locator), timeout).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn current_url(&self) -> Result<String, ActionError> {
        let value = self
            .call("url", json!({}), None, Duration::from_secs(5))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<(), ActionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Still flagged closed on failure: the process is gone with it
        self.bridge
            .call(
                "close_context",
                json!({ "context": self.id }),
                None,
                Duration::from_secs(10),
            )
            .await?;
        debug!("Closed browser context {}", self.id);
        Ok(())
    }
}
