// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixture renderer: serves saved HTML instead of driving a browser.
//!
//! Used by `pricewatch check --fixture` to develop extraction rules against
//! captured pages, and by the integration tests.

use super::{BrowserLauncher, ContextProfile, NavigationResult, RenderContext, RenderError, Renderer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A canned page.
#[derive(Debug, Clone)]
pub struct FixturePage {
    pub html: String,
    pub status: u16,
    /// Simulated load time.
    pub delay: Duration,
}

impl FixturePage {
    pub fn ok(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            status: 200,
            delay: Duration::ZERO,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Pages = Arc<RwLock<HashMap<String, FixturePage>>>;

/// Renderer backed by an in-memory URL → page table.
///
/// Unknown URLs fail like an unresolvable host. Pages can be replaced while
/// the renderer is in use, which lets callers simulate price changes.
#[derive(Clone, Default)]
pub struct FixtureRenderer {
    pages: Pages,
    active_count: Arc<AtomicUsize>,
}

impl FixtureRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the page served for `url`.
    pub fn set_page(&self, url: impl Into<String>, page: FixturePage) {
        if let Ok(mut pages) = self.pages.write() {
            pages.insert(url.into(), page);
        }
    }

    /// Stop serving `url`.
    pub fn remove_page(&self, url: &str) {
        if let Ok(mut pages) = self.pages.write() {
            pages.remove(url);
        }
    }
}

#[async_trait]
impl Renderer for FixtureRenderer {
    async fn new_context(
        &self,
        _profile: &ContextProfile,
    ) -> Result<Box<dyn RenderContext>, RenderError> {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FixtureContext {
            pages: Arc::clone(&self.pages),
            current: None,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn ping(&self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RenderError> {
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// Always hands out the same [`FixtureRenderer`].
pub struct FixtureLauncher {
    renderer: FixtureRenderer,
}

impl FixtureLauncher {
    pub fn new(renderer: FixtureRenderer) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl BrowserLauncher for FixtureLauncher {
    async fn launch(&self) -> Result<Arc<dyn Renderer>, RenderError> {
        Ok(Arc::new(self.renderer.clone()))
    }
}

struct FixtureContext {
    pages: Pages,
    current: Option<FixturePage>,
    active_count: Arc<AtomicUsize>,
}

impl FixtureContext {
    fn lookup(&self, url: &str) -> Option<FixturePage> {
        self.pages.read().ok().and_then(|p| p.get(url).cloned())
    }
}

#[async_trait]
impl RenderContext for FixtureContext {
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> Result<NavigationResult, RenderError> {
        let page = self
            .lookup(url)
            .ok_or_else(|| RenderError::Network(format!("net::ERR_NAME_NOT_RESOLVED at {url}")))?;
        if page.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RenderError::Timeout(timeout));
        }
        tokio::time::sleep(page.delay).await;
        let result = NavigationResult {
            final_url: url.to_string(),
            status: Some(page.status),
            load_time_ms: page.delay.as_millis() as u64,
        };
        self.current = Some(page);
        Ok(result)
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        let found = {
            let parsed = scraper::Selector::parse(selector)
                .map_err(|e| RenderError::Other(format!("invalid selector {selector:?}: {e}")))?;
            self.current
                .as_ref()
                .map(|p| scraper::Html::parse_document(&p.html).select(&parsed).next().is_some())
                .unwrap_or(false)
        };
        if found {
            Ok(())
        } else {
            tokio::time::sleep(timeout).await;
            Err(RenderError::Timeout(timeout))
        }
    }

    async fn wait_for_network_idle(
        &mut self,
        _idle: Duration,
        _timeout: Duration,
    ) -> Result<(), RenderError> {
        Ok(())
    }

    async fn get_html(&self) -> Result<String, RenderError> {
        self.current
            .as_ref()
            .map(|p| p.html.clone())
            .ok_or_else(|| RenderError::Other("no page loaded".to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}
