// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page fetcher: navigate a leased context and return rendered HTML.
//!
//! The fetcher holds no shared state. Navigation and the configured wait
//! share one deadline; every failure is classified into a [`FailureKind`].

use crate::error::{FailureKind, PipelineError};
use crate::extract::visible_text;
use crate::model::now_micros;
use crate::renderer::{RenderContext, RenderError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Text that marks a bot challenge instead of the product page.
pub const DEFAULT_CHALLENGE_MARKERS: &[&str] = &["captcha", "cloudflare", "access denied"];

/// How long to keep waiting after the initial load event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Return as soon as navigation completes.
    #[default]
    Load,
    /// Wait until no new resources were requested for `idle_ms`.
    NetworkIdle {
        #[serde(default = "default_idle_ms")]
        idle_ms: u64,
    },
    /// Wait until `selector` matches.
    Selector { selector: String },
    /// Sleep a fixed time after load.
    FixedDelay { ms: u64 },
}

fn default_idle_ms() -> u64 {
    500
}

/// A rendered page.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// Requested URL.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
    pub latency: Duration,
    pub fetched_at: DateTime<Utc>,
}

/// Navigates contexts with a bounded timeout.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    nav_timeout: Duration,
    markers: Vec<String>,
    dump_dir: Option<PathBuf>,
}

impl PageFetcher {
    pub fn new(nav_timeout: Duration) -> Self {
        Self {
            nav_timeout,
            markers: DEFAULT_CHALLENGE_MARKERS.iter().map(|m| m.to_string()).collect(),
            dump_dir: None,
        }
    }

    /// Replace the challenge markers (matched case-insensitively).
    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.markers = markers.into_iter().map(|m| m.to_lowercase()).collect();
        self
    }

    /// Save the head of every challenge page under `dir` for inspection.
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    pub fn nav_timeout(&self) -> Duration {
        self.nav_timeout
    }

    /// Navigate to `url`, apply `wait` and return the rendered page.
    pub async fn fetch(
        &self,
        context: &mut dyn RenderContext,
        url: &str,
        wait: &WaitPolicy,
    ) -> Result<RawPage, PipelineError> {
        let started = Instant::now();
        let deadline = started + self.nav_timeout;

        let nav = context
            .navigate(url, self.nav_timeout)
            .await
            .map_err(|e| classify_render_error(e, self.nav_timeout))?;

        if let Some(status) = nav.status {
            if status == 403 || status == 429 {
                let html = context.get_html().await.unwrap_or_default();
                self.dump_challenge(url, &html).await;
                return Err(PipelineError::fetch(
                    FailureKind::AntiBot,
                    format!("HTTP {status} from {url}"),
                ));
            }
            if status >= 400 {
                return Err(PipelineError::fetch(
                    FailureKind::HttpStatus(status),
                    format!("HTTP {status} from {url}"),
                ));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let waited = match wait {
            WaitPolicy::Load => Ok(()),
            WaitPolicy::NetworkIdle { idle_ms } => {
                context
                    .wait_for_network_idle(Duration::from_millis(*idle_ms), remaining)
                    .await
            }
            WaitPolicy::Selector { selector } => {
                context.wait_for_selector(selector, remaining).await
            }
            WaitPolicy::FixedDelay { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms).min(remaining)).await;
                Ok(())
            }
        };

        let html = context
            .get_html()
            .await
            .map_err(|e| classify_render_error(e, self.nav_timeout))?;

        if let Some(marker) = self.challenge_marker(&html) {
            self.dump_challenge(url, &html).await;
            return Err(PipelineError::fetch(
                FailureKind::AntiBot,
                format!("challenge marker {marker:?} on {url}"),
            ));
        }

        // A selector that never shows up on a non-challenge page is a slow
        // or broken page, not an extraction problem.
        if let Err(e) = waited {
            return Err(classify_render_error(e, remaining));
        }

        let latency = started.elapsed();
        debug!("fetched {} in {}ms (status {:?})", url, latency.as_millis(), nav.status);

        Ok(RawPage {
            url: url.to_string(),
            final_url: nav.final_url,
            status: nav.status,
            html,
            latency,
            fetched_at: now_micros(),
        })
    }

    fn challenge_marker(&self, html: &str) -> Option<&str> {
        let text = visible_text(html).to_lowercase();
        self.markers
            .iter()
            .find(|m| !m.is_empty() && text.contains(m.as_str()))
            .map(|m| m.as_str())
    }

    async fn dump_challenge(&self, url: &str, html: &str) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let path = dir.join(format!("{host}_{}.html", Utc::now().format("%Y%m%d_%H%M%S")));
        let head: String = html.chars().take(3000).collect();
        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, head).await
        }
        .await;
        match result {
            Ok(()) => debug!("saved challenge page to {}", path.display()),
            Err(e) => warn!("failed to save challenge page {}: {e}", path.display()),
        }
    }
}

/// Map an engine error to a transient fetch failure.
pub fn classify_render_error(err: RenderError, timeout: Duration) -> PipelineError {
    match err {
        RenderError::Timeout(_) => {
            PipelineError::fetch(FailureKind::Timeout, format!("no response within {timeout:?}"))
        }
        RenderError::Network(msg) => PipelineError::fetch(FailureKind::Network, msg),
        RenderError::Aborted(msg) => PipelineError::fetch(FailureKind::NavigationAborted, msg),
        RenderError::Crashed(msg) => PipelineError::fetch(FailureKind::BrowserCrash, msg),
        RenderError::Launch(msg) => PipelineError::fatal(FailureKind::BrowserUnavailable, msg),
        RenderError::Other(msg) => PipelineError::fetch(FailureKind::Network, msg),
    }
}
