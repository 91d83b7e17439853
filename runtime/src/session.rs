// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Browser session manager: renderer lifecycle and the context pool.
//!
//! Hands out [`ContextLease`]s: at most `max_contexts` are live at once and
//! every lease closes its context on drop. When the browser stops answering
//! the manager kills and relaunches it; when relaunching keeps failing it
//! marks itself degraded and refuses new work until [`SessionManager::recover`]
//! succeeds.

use crate::error::{FailureKind, PipelineError};
use crate::monitor::backoff::exponential_delay;
use crate::renderer::{BrowserLauncher, ContextProfile, RenderContext, RenderError, Renderer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{error, info, warn};

/// Pool and launch settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of concurrently open contexts.
    pub max_contexts: usize,
    /// How long a caller may wait for a free context slot.
    pub acquire_timeout: Duration,
    /// Launch attempts after the first failed one.
    pub launch_retries: u32,
    pub launch_backoff_base: Duration,
    pub launch_backoff_cap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_contexts: 4,
            acquire_timeout: Duration::from_secs(60),
            launch_retries: 3,
            launch_backoff_base: Duration::from_secs(1),
            launch_backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Owns the renderer and the bounded pool of contexts.
pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    renderer: RwLock<Option<Arc<dyn Renderer>>>,
    /// Bumped on every relaunch so stale crash reports are ignored.
    generation: AtomicU64,
    degraded: AtomicBool,
    permits: Arc<Semaphore>,
    relaunch_lock: Mutex<()>,
    config: SessionConfig,
}

impl SessionManager {
    /// Launch the renderer (with retries) and build the pool.
    ///
    /// Launch exhaustion does not fail construction; the manager starts
    /// degraded and every acquisition reports a fatal resource error.
    pub async fn start(launcher: Arc<dyn BrowserLauncher>, config: SessionConfig) -> Self {
        let manager = Self {
            launcher,
            renderer: RwLock::new(None),
            generation: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(config.max_contexts.max(1))),
            relaunch_lock: Mutex::new(()),
            config,
        };
        match manager.launch_with_retries().await {
            Ok(renderer) => {
                *manager.renderer.write().await = Some(renderer);
                info!("browser session manager ready: max_contexts={}", manager.config.max_contexts);
            }
            Err(e) => {
                error!("browser launch exhausted, session manager degraded: {e}");
                manager.degraded.store(true, Ordering::SeqCst);
            }
        }
        manager
    }

    async fn launch_with_retries(&self) -> Result<Arc<dyn Renderer>, RenderError> {
        let attempts = self.config.launch_retries.saturating_add(1);
        let mut last_err = RenderError::Launch("no launch attempted".to_string());
        for attempt in 1..=attempts {
            match self.launcher.launch().await {
                Ok(renderer) => {
                    if attempt > 1 {
                        info!("browser launched on attempt {attempt}");
                    }
                    return Ok(renderer);
                }
                Err(e) => {
                    warn!("browser launch attempt {attempt}/{attempts} failed: {e}");
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(exponential_delay(
                            self.config.launch_backoff_base,
                            attempt,
                            self.config.launch_backoff_cap,
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Lease an isolated context for one fetch.
    pub async fn acquire_context(
        &self,
        profile: &ContextProfile,
    ) -> Result<ContextLease, PipelineError> {
        if self.is_degraded() {
            return Err(PipelineError::fatal(
                FailureKind::BrowserUnavailable,
                "browser session manager is degraded",
            ));
        }

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(PipelineError::fatal(
                    FailureKind::BrowserUnavailable,
                    "session manager is shut down",
                ))
            }
            Err(_) => {
                return Err(PipelineError::fetch(
                    FailureKind::PoolExhausted,
                    format!(
                        "no browser context free within {:?}",
                        self.config.acquire_timeout
                    ),
                ))
            }
        };

        let (renderer, generation) = {
            let guard = self.renderer.read().await;
            (guard.clone(), self.generation.load(Ordering::SeqCst))
        };
        let Some(renderer) = renderer else {
            return Err(PipelineError::fatal(
                FailureKind::BrowserUnavailable,
                "no browser running",
            ));
        };

        let created =
            tokio::time::timeout(self.config.acquire_timeout, renderer.new_context(profile)).await;
        match created {
            Ok(Ok(context)) => Ok(ContextLease {
                context: Some(context),
                generation,
                _permit: permit,
            }),
            Ok(Err(e)) => Err(self.context_failure(generation, e).await),
            Err(_) => Err(self
                .context_failure(generation, RenderError::Timeout(self.config.acquire_timeout))
                .await),
        }
    }

    async fn context_failure(&self, generation: u64, err: RenderError) -> PipelineError {
        if self.check_after_failure(generation).await {
            PipelineError::fetch(
                FailureKind::BrowserCrash,
                format!("browser crashed while opening a context: {err}"),
            )
        } else {
            PipelineError::fetch(FailureKind::BrowserCrash, format!("context creation failed: {err}"))
        }
    }

    /// Probe the browser after a failed operation on a lease of `generation`.
    ///
    /// Returns true when the browser was found dead (or had already been
    /// replaced) so the caller should treat its failure as a crash.
    pub async fn check_after_failure(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return true;
        }
        let renderer = self.renderer.read().await.clone();
        let alive = match renderer {
            Some(r) => r.ping().await.is_ok(),
            None => false,
        };
        if alive {
            return false;
        }
        warn!("browser unresponsive (generation {generation}), relaunching");
        self.relaunch(generation).await;
        true
    }

    /// Kill and relaunch the renderer unless another caller already did.
    async fn relaunch(&self, generation: u64) {
        let _guard = self.relaunch_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let old = self.renderer.write().await.take();
        if let Some(old) = old {
            if let Err(e) = old.shutdown().await {
                warn!("failed to shut down old browser: {e}");
            }
        }

        match self.launch_with_retries().await {
            Ok(renderer) => {
                *self.renderer.write().await = Some(renderer);
                self.degraded.store(false, Ordering::SeqCst);
                info!("browser relaunched");
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                error!("browser relaunch exhausted, session manager degraded: {e}");
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Try to bring a degraded manager back. Returns true when healthy.
    pub async fn recover(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        self.relaunch(self.generation.load(Ordering::SeqCst)).await;
        !self.is_degraded()
    }

    /// True when the browser could not be (re)launched.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Free context slots.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Contexts currently open in the renderer.
    pub async fn active_contexts(&self) -> usize {
        self.renderer
            .read()
            .await
            .as_ref()
            .map(|r| r.active_contexts())
            .unwrap_or(0)
    }

    /// Stop accepting leases and shut the browser down.
    pub async fn shutdown(&self) {
        self.permits.close();
        let renderer = self.renderer.write().await.take();
        if let Some(renderer) = renderer {
            if let Err(e) = renderer.shutdown().await {
                warn!("browser shutdown failed: {e}");
            }
        }
    }
}

/// Exclusive use of one browser context.
///
/// The context is closed by [`ContextLease::release`] or, on any other exit
/// path, when the lease is dropped. The pool slot is returned either way.
pub struct ContextLease {
    context: Option<Box<dyn RenderContext>>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl ContextLease {
    /// The leased context.
    pub fn context(&mut self) -> Result<&mut (dyn RenderContext + 'static), PipelineError> {
        self.context.as_deref_mut().ok_or_else(|| {
            PipelineError::fatal(FailureKind::BrowserUnavailable, "lease already released")
        })
    }

    /// Renderer generation this context belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Close the context and return the slot.
    pub async fn release(mut self) {
        if let Some(context) = self.context.take() {
            if let Err(e) = context.close().await {
                tracing::debug!("context close failed: {e}");
            }
        }
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = context.close().await;
                    });
                }
                Err(_) => warn!("context lease dropped outside a runtime, context not closed"),
            }
        }
    }
}
