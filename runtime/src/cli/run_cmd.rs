// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Run the monitor in the foreground until interrupted.
//!
//! Ctrl-C (or SIGTERM) stops scheduling, lets running cycles finish and
//! closes the browser. On Unix, SIGHUP reloads the catalog file.

use crate::config::MonitorConfig;
use crate::events::{AlertSink, EventBus, LogSink, MonitorEvent};
use crate::monitor::{self, PipelineDeps};
use crate::renderer::chromium::{ChromiumLauncher, ChromiumOptions};
use crate::reprice::Repricer;
use crate::session::SessionManager;
use crate::store::{PriceStore, SqliteStore};
use crate::targets::{Catalog, CatalogDefaults};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub async fn run(catalog_path: &Path, print_events: bool) -> Result<()> {
    let config = MonitorConfig::from_env();
    info!("starting pricewatch v{}", env!("CARGO_PKG_VERSION"));

    let catalog_defaults = config.catalog_defaults();
    let catalog = Catalog::load(catalog_path, &catalog_defaults).await?;
    let store: Arc<dyn PriceStore> = Arc::new(
        SqliteStore::open(&config.db_path, config.db_pool_size, config.db_timeout).await?,
    );

    let launcher = Arc::new(ChromiumLauncher::new(ChromiumOptions::default()));
    let sessions = Arc::new(SessionManager::start(launcher, config.session_config()).await);
    if sessions.is_degraded() {
        warn!("browser unavailable at startup, targets will wait for it to recover");
    }

    let bus = Arc::new(EventBus::new(256));
    let log_task = tokio::spawn(forward_events(bus.subscribe(), print_events));

    let deps = PipelineDeps {
        sessions,
        fetcher: config.fetcher(),
        store,
    };
    let repricer = Arc::new(Repricer::new(&catalog, bus.clone()));
    let alerts: Arc<dyn AlertSink> = repricer.clone();
    let handle = monitor::start(config, catalog, deps, alerts);

    #[cfg(unix)]
    {
        let handle = handle.clone();
        let path = catalog_path.to_path_buf();
        tokio::spawn(reload_on_hangup(handle, repricer, path, catalog_defaults));
    }

    shutdown_signal().await;
    info!("shutdown requested");
    if let Err(e) = handle.shutdown().await {
        warn!("monitor already stopped: {e}");
    }
    drop(bus);
    let _ = log_task.await;
    Ok(())
}

/// Log every event; with `print` also write it to stdout as one JSON line.
async fn forward_events(mut rx: broadcast::Receiver<MonitorEvent>, print: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if print {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                let stop = event == MonitorEvent::MonitorStopped;
                LogSink.alert(event);
                if stop {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event log lagged, {n} events lost"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(unix)]
async fn reload_on_hangup(
    handle: monitor::MonitorHandle,
    repricer: Arc<Repricer>,
    path: PathBuf,
    catalog_defaults: CatalogDefaults,
) {
    use tokio::signal::unix::{signal, SignalKind};
    let Ok(mut hangup) = signal(SignalKind::hangup()) else {
        return;
    };
    while hangup.recv().await.is_some() {
        match Catalog::load(&path, &catalog_defaults).await {
            Ok(catalog) => {
                repricer.update(&catalog);
                match handle.reload(catalog).await {
                    Ok(summary) => info!(
                        "reloaded {}: +{} ~{} -{} ({} rejected)",
                        path.display(),
                        summary.added,
                        summary.updated,
                        summary.removed,
                        summary.rejected
                    ),
                    Err(_) => break,
                }
            }
            Err(e) => warn!("catalog reload failed, keeping the current one: {e:#}"),
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
