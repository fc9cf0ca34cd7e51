//! Minimal Chrome DevTools Protocol driver for the headless adapter.
//!
//! The browser process is spawned lazily and reused; each tracked number gets
//! its own tab with exclusive use, bounded by a semaphore so navigations never
//! share a page. Commands run over the page's DevTools WebSocket one at a
//! time, which keeps the protocol handling to plain request/response matching.

use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::CarrierError;

const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STARTUP_DEADLINE: Duration = Duration::from_secs(15);
const COMMAND_DEADLINE: Duration = Duration::from_secs(20);

/// Browser process configuration.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Browser executable; Firefox-family engines draw less bot suspicion on
    /// some carriers but any CDP-speaking binary works here.
    pub executable: String,
    pub debug_port: u16,
    /// Max pages navigating at once
    pub pool_size: usize,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: std::env::var("PKG_TRACKER_BROWSER_PATH")
                .unwrap_or_else(|_| "chromium".to_string()),
            debug_port: 9222,
            pool_size: 2,
        }
    }
}

/// A shared headless-browser handle.
pub struct Browser {
    config: BrowserConfig,
    http: reqwest::Client,
    process: Mutex<Option<Child>>,
    slots: Semaphore,
}

impl Browser {
    pub fn new(config: BrowserConfig) -> Self {
        let slots = Semaphore::new(config.pool_size.max(1));
        Self {
            config,
            http: reqwest::Client::new(),
            process: Mutex::new(None),
            slots,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.config.debug_port, path)
    }

    /// Spawn the browser process if it is not already serving DevTools.
    async fn ensure_started(&self) -> Result<(), CarrierError> {
        let mut guard = self.process.lock().await;

        let alive = match guard.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        };

        if !alive {
            debug!(executable = %self.config.executable, "starting headless browser");
            let child = Command::new(&self.config.executable)
                .arg("--headless=new")
                .arg("--disable-gpu")
                .arg("--no-sandbox")
                .arg("--no-first-run")
                .arg("--disable-extensions")
                .arg(format!("--remote-debugging-port={}", self.config.debug_port))
                .arg("about:blank")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    CarrierError::server(format!(
                        "failed to launch browser {}: {}",
                        self.config.executable, e
                    ))
                })?;
            *guard = Some(child);
        }
        drop(guard);

        // Wait for the DevTools endpoint to answer
        let deadline = tokio::time::Instant::now() + STARTUP_DEADLINE;
        loop {
            match self.http.get(self.endpoint("/json/version")).send().await {
                Ok(r) if r.status().is_success() => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => {
                    return Err(CarrierError::server(
                        "browser did not expose DevTools within the startup deadline",
                    ));
                }
                _ => tokio::time::sleep(STARTUP_POLL_INTERVAL).await,
            }
        }
    }

    /// Open a fresh tab with exclusive use. The returned guard closes the tab
    /// and releases the pool slot on drop.
    pub async fn checkout_page(&self) -> Result<PageSession<'_>, CarrierError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| CarrierError::server("browser pool closed"))?;

        self.ensure_started().await?;

        let tab: Value = self
            .http
            .put(self.endpoint("/json/new?about:blank"))
            .send()
            .await
            .map_err(|e| CarrierError::server(format!("DevTools tab create failed: {}", e)))?
            .json()
            .await
            .map_err(|e| CarrierError::server(format!("DevTools tab response unreadable: {}", e)))?;

        let target_id = tab["id"]
            .as_str()
            .ok_or_else(|| CarrierError::server("DevTools tab has no id"))?
            .to_string();
        let ws_url = tab["webSocketDebuggerUrl"]
            .as_str()
            .ok_or_else(|| CarrierError::server("DevTools tab has no webSocketDebuggerUrl"))?
            .to_string();

        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| CarrierError::server(format!("DevTools connect failed: {}", e)))?;

        let mut session = PageSession {
            browser: self,
            _permit: permit,
            ws,
            target_id,
            next_id: 1,
        };
        session.command("Page.enable", json!({})).await?;
        session.command("Runtime.enable", json!({})).await?;
        Ok(session)
    }

    async fn close_tab(&self, target_id: &str) {
        if let Err(e) = self
            .http
            .get(self.endpoint(&format!("/json/close/{}", target_id)))
            .send()
            .await
        {
            warn!(target_id, "failed to close browser tab: {}", e);
        }
    }

    /// Kill the browser process, releasing transport resources.
    pub async fn shutdown(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
        }
    }
}

/// One tab, held exclusively while a navigation is in flight.
pub struct PageSession<'a> {
    browser: &'a Browser,
    _permit: tokio::sync::SemaphorePermit<'a>,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    target_id: String,
    next_id: i64,
}

impl<'a> PageSession<'a> {
    /// Send one CDP command and wait for its response, skipping events.
    async fn command(&mut self, method: &str, params: Value) -> Result<Value, CarrierError> {
        let id = self.next_id;
        self.next_id += 1;

        let payload = json!({"id": id, "method": method, "params": params}).to_string();
        self.ws
            .send(Message::Text(payload))
            .await
            .map_err(|e| CarrierError::server(format!("DevTools send failed: {}", e)))?;

        let deadline = tokio::time::Instant::now() + COMMAND_DEADLINE;
        loop {
            // tokio's duration_since saturates to zero when past the deadline
            let remaining = deadline.duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CarrierError::server(format!("{} timed out", method)));
            }

            let message = tokio::time::timeout(remaining, self.ws.next())
                .await
                .map_err(|_| CarrierError::server(format!("{} timed out", method)))?;

            let message = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(CarrierError::server(format!("DevTools read failed: {}", e)))
                }
                None => return Err(CarrierError::server("DevTools socket closed")),
            };

            let value: Value = match serde_json::from_str(&message) {
                Ok(v) => v,
                Err(_) => continue,
            };

            if value["id"].as_i64() == Some(id) {
                if let Some(error) = value.get("error") {
                    return Err(CarrierError::server(format!(
                        "{} failed: {}",
                        method, error["message"].as_str().unwrap_or("unknown")
                    )));
                }
                return Ok(value["result"].clone());
            }
            // Anything else is an event; irrelevant to sequential command use
        }
    }

    /// Navigate and block until the document finishes loading.
    pub async fn navigate(&mut self, url: &str) -> Result<(), CarrierError> {
        debug!(url, "headless navigate");
        self.command("Page.navigate", json!({ "url": url })).await?;

        // The SPA keeps rendering after load; callers follow up with wait_for
        self.wait_for("document.readyState === 'complete'", Duration::from_secs(30))
            .await
    }

    /// Evaluate a JS expression and return its JSON value.
    pub async fn evaluate(&mut self, expression: &str) -> Result<Value, CarrierError> {
        let result = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            return Err(CarrierError::server(format!(
                "page script failed: {}",
                exception["text"].as_str().unwrap_or("exception")
            )));
        }

        Ok(result["result"]["value"].clone())
    }

    /// Poll an expression until it is truthy; used for SPA-ready waits.
    pub async fn wait_for(
        &mut self,
        expression: &str,
        timeout: Duration,
    ) -> Result<(), CarrierError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let value = self.evaluate(expression).await?;
            if value.as_bool() == Some(true) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CarrierError::server(format!(
                    "page never became ready: {}",
                    expression
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Full rendered text of the document body.
    pub async fn body_text(&mut self) -> Result<String, CarrierError> {
        let value = self.evaluate("document.body ? document.body.innerText : ''").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Close the tab and release the pool slot. Callers must invoke this on
    /// every path; dropping the session only releases the slot.
    pub async fn close(self) {
        self.browser.close_tab(&self.target_id).await;
    }
}
