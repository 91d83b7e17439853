// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Renderer abstraction for browser-based page rendering.
//!
//! Defines the `Renderer` and `RenderContext` traits that abstract over
//! the browser engine (Chromium via chromiumoxide, or saved fixtures).

pub mod chromium;
pub mod fixture;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// HTTP status of the main document, when the engine exposes it.
    pub status: Option<u16>,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// Per-context settings applied when a context is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextProfile {
    /// User-Agent override for this context.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Accept-Language override (e.g. "ru-RU,ru;q=0.9").
    #[serde(default)]
    pub accept_language: Option<String>,
}

impl ContextProfile {
    /// Fill every unset field from `fallback`.
    pub fn or(self, fallback: &ContextProfile) -> ContextProfile {
        ContextProfile {
            user_agent: self.user_agent.or_else(|| fallback.user_agent.clone()),
            accept_language: self.accept_language.or_else(|| fallback.accept_language.clone()),
        }
    }
}

/// Failures surfaced by the browser engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("navigation aborted: {0}")]
    Aborted(String),
    #[error("browser crashed or disconnected: {0}")]
    Crashed(String),
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("{0}")]
    Other(String),
}

impl RenderError {
    /// Classify a raw engine error message.
    ///
    /// Chromium reports navigation failures as `net::ERR_*` codes; a closed
    /// websocket or channel means the browser process is gone.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("err_aborted") || lower.contains("navigation aborted") {
            Self::Aborted(msg)
        } else if lower.contains("err_timed_out") || lower.contains("timeout") {
            Self::Timeout(Duration::ZERO)
        } else if lower.contains("net::err_") {
            Self::Network(msg)
        } else if lower.contains("channel closed")
            || lower.contains("connection closed")
            || lower.contains("websocket")
            || lower.contains("target closed")
        {
            Self::Crashed(msg)
        } else {
            Self::Other(msg)
        }
    }
}

/// A browser engine that can create isolated rendering contexts.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Create a new isolated context (separate cookies and storage).
    async fn new_context(
        &self,
        profile: &ContextProfile,
    ) -> Result<Box<dyn RenderContext>, RenderError>;
    /// Check that the engine still responds.
    async fn ping(&self) -> Result<(), RenderError>;
    /// Shut down the engine, killing the process if needed.
    async fn shutdown(&self) -> Result<(), RenderError>;
    /// Number of currently open contexts.
    fn active_contexts(&self) -> usize;
}

/// A single isolated browser context for rendering pages.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Navigate to a URL with a timeout.
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> Result<NavigationResult, RenderError>;
    /// Wait until an element matching `selector` is present.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), RenderError>;
    /// Wait until no new network resources have been requested for `idle`.
    async fn wait_for_network_idle(
        &mut self,
        idle: Duration,
        timeout: Duration,
    ) -> Result<(), RenderError>;
    /// Get the full rendered page HTML.
    async fn get_html(&self) -> Result<String, RenderError>;
    /// Close this context.
    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

/// Starts renderer instances; used for the initial launch and relaunches.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Renderer>, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_classification() {
        assert!(matches!(
            RenderError::from_message("net::ERR_NAME_NOT_RESOLVED"),
            RenderError::Network(_)
        ));
        assert!(matches!(
            RenderError::from_message("net::ERR_ABORTED at https://x"),
            RenderError::Aborted(_)
        ));
        assert!(matches!(
            RenderError::from_message("Request timed out: timeout"),
            RenderError::Timeout(_)
        ));
        assert!(matches!(
            RenderError::from_message("channel closed"),
            RenderError::Crashed(_)
        ));
        assert!(matches!(
            RenderError::from_message("something odd"),
            RenderError::Other(_)
        ));
    }
}
