// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chromium-based renderer using chromiumoxide.
//!
//! Each context is a separate CDP browser context, so cookies and storage
//! never leak between targets.

use super::{BrowserLauncher, ContextProfile, NavigationResult, RenderContext, RenderError, Renderer};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// User agent used when a profile only overrides Accept-Language.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Poll interval for selector and network-idle waits.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `ping` waits for the browser to answer.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. PRICEWATCH_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("PRICEWATCH_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.pricewatch/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = [
            home.join(".pricewatch/chromium/chrome-linux64/chrome"),
            home.join(".pricewatch/chromium/chrome"),
        ];
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["chromium", "chromium-browser", "google-chrome", "headless_shell"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    None
}

/// Launch options for headless Chromium.
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    /// Explicit binary; falls back to [`find_chromium`].
    pub executable: Option<PathBuf>,
    /// Timeout for individual CDP requests.
    pub request_timeout: Duration,
    /// Extra command-line flags.
    pub extra_args: Vec<String>,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            executable: None,
            request_timeout: Duration::from_secs(30),
            extra_args: Vec::new(),
        }
    }
}

/// Launches [`ChromiumRenderer`] instances.
pub struct ChromiumLauncher {
    options: ChromiumOptions,
}

impl ChromiumLauncher {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn Renderer>, RenderError> {
        let renderer = ChromiumRenderer::launch(&self.options).await?;
        Ok(Arc::new(renderer))
    }
}

/// Chromium-based renderer.
pub struct ChromiumRenderer {
    browser: Arc<Browser>,
    handler: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    /// Launch a headless Chromium instance.
    pub async fn launch(options: &ChromiumOptions) -> Result<Self, RenderError> {
        let chrome_path = options
            .executable
            .clone()
            .or_else(find_chromium)
            .ok_or_else(|| {
                RenderError::Launch(
                    "Chromium not found. Set PRICEWATCH_CHROMIUM_PATH.".to_string(),
                )
            })?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .request_timeout(options.request_timeout)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-blink-features=AutomationControlled");
        for arg in &options.extra_args {
            builder = builder.arg(arg.as_str());
        }
        let config = builder
            .build()
            .map_err(|e| RenderError::Launch(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Launch(format!("failed to launch Chromium: {e}")))?;

        let connected = Arc::new(AtomicBool::new(true));
        let handler_connected = Arc::clone(&connected);

        // The handler drives the CDP connection; when it ends the browser is gone.
        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("chromium handler event error: {e}");
                }
            }
            handler_connected.store(false, Ordering::SeqCst);
            tracing::warn!("chromium connection closed");
        });

        Ok(Self {
            browser: Arc::new(browser),
            handler: Mutex::new(Some(handle)),
            connected,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn ensure_connected(&self) -> Result<(), RenderError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RenderError::Crashed("browser connection lost".to_string()))
        }
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn new_context(
        &self,
        profile: &ContextProfile,
    ) -> Result<Box<dyn RenderContext>, RenderError> {
        self.ensure_connected()?;

        let created = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| RenderError::from_message(e.to_string()))?;
        let context_id = created.result.browser_context_id.clone();

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(RenderError::Other)?;

        let page = match self.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                let _ = self
                    .browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await;
                return Err(RenderError::from_message(e.to_string()));
            }
        };

        if profile.user_agent.is_some() || profile.accept_language.is_some() {
            let mut ua = SetUserAgentOverrideParams::builder().user_agent(
                profile
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            );
            if let Some(lang) = &profile.accept_language {
                ua = ua.accept_language(lang.clone());
            }
            let params = ua.build().map_err(RenderError::Other)?;
            page.execute(params)
                .await
                .map_err(|e| RenderError::from_message(e.to_string()))?;
        }

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumContext {
            page,
            browser: Arc::clone(&self.browser),
            context_id,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn ping(&self) -> Result<(), RenderError> {
        self.ensure_connected()?;
        match tokio::time::timeout(PING_TIMEOUT, self.browser.version()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RenderError::Crashed(e.to_string())),
            Err(_) => Err(RenderError::Crashed(format!(
                "no answer within {PING_TIMEOUT:?}"
            ))),
        }
    }

    async fn shutdown(&self) -> Result<(), RenderError> {
        if self.connected.load(Ordering::SeqCst) {
            let _ = tokio::time::timeout(PING_TIMEOUT, self.browser.execute(CloseParams::default()))
                .await;
        }
        // The child process is killed when the last Browser handle is dropped.
        if let Ok(mut guard) = self.handler.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// A single Chromium page inside its own browser context.
pub struct ChromiumContext {
    page: Page,
    browser: Arc<Browser>,
    context_id: BrowserContextId,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumContext {
    async fn eval_json(&self, script: &str) -> Result<serde_json::Value, RenderError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| RenderError::from_message(e.to_string()))?;
        result
            .into_value()
            .map_err(|e| RenderError::Other(format!("failed to convert JS result: {e:?}")))
    }
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> Result<NavigationResult, RenderError> {
        let start = Instant::now();

        let result = tokio::time::timeout(timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await;

        let load_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(())) => {
                let final_url = self
                    .page
                    .url()
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| url.to_string());

                // chromiumoxide does not expose the main response directly;
                // the Navigation Timing entry carries it in Chromium >= 109.
                let status = self
                    .eval_json(
                        "(() => { const e = performance.getEntriesByType('navigation')[0]; \
                         return e && e.responseStatus ? e.responseStatus : null; })()",
                    )
                    .await
                    .ok()
                    .and_then(|v| v.as_u64())
                    .and_then(|s| u16::try_from(s).ok());

                Ok(NavigationResult {
                    final_url,
                    status,
                    load_time_ms,
                })
            }
            Ok(Err(e)) => Err(RenderError::from_message(e.to_string())),
            Err(_) => Err(RenderError::Timeout(timeout)),
        }
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RenderError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_network_idle(
        &mut self,
        idle: Duration,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        let deadline = Instant::now() + timeout;
        let mut last_count: Option<u64> = None;
        let mut quiet_since = Instant::now();
        loop {
            let count = self
                .eval_json("performance.getEntriesByType('resource').length")
                .await?
                .as_u64()
                .unwrap_or(0);
            if last_count != Some(count) {
                last_count = Some(count);
                quiet_since = Instant::now();
            } else if quiet_since.elapsed() >= idle {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RenderError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn get_html(&self) -> Result<String, RenderError> {
        let html = self.eval_json("document.documentElement.outerHTML").await?;
        html.as_str()
            .map(str::to_string)
            .ok_or_else(|| RenderError::Other("document HTML was not a string".to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        let this = *self;
        this.active_count.fetch_sub(1, Ordering::Relaxed);
        let _ = this.page.close().await;
        let _ = this
            .browser
            .execute(DisposeBrowserContextParams::new(this.context_id))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_navigate_and_read_html() {
        let renderer = ChromiumRenderer::launch(&ChromiumOptions::default())
            .await
            .expect("failed to launch renderer");
        let mut ctx = renderer
            .new_context(&ContextProfile::default())
            .await
            .expect("failed to create context");

        let nav = ctx
            .navigate(
                "data:text/html,<h1>Drill</h1><span class=price>1 299,00 ₽</span>",
                Duration::from_secs(10),
            )
            .await
            .expect("navigation failed");
        assert!(nav.load_time_ms < 10_000);

        ctx.wait_for_selector(".price", Duration::from_secs(2))
            .await
            .expect("selector wait failed");

        let html = ctx.get_html().await.expect("get_html failed");
        assert!(html.contains("<h1>Drill</h1>"));

        ctx.close().await.expect("close failed");
        assert_eq!(renderer.active_contexts(), 0);

        renderer.ping().await.expect("ping failed");
        renderer.shutdown().await.expect("shutdown failed");
    }
}
