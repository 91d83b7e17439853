// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end monitor tests over fixture pages and a real SQLite store.

use pricewatch_runtime::config::MonitorConfig;
use pricewatch_runtime::error::FailureKind;
use pricewatch_runtime::events::{AlertSink, EventBus, MonitorEvent};
use pricewatch_runtime::model::Classification;
use pricewatch_runtime::monitor::{self, MonitorHandle, PipelineDeps, TargetState};
use async_trait::async_trait;
use pricewatch_runtime::renderer::fixture::{FixtureLauncher, FixturePage, FixtureRenderer};
use pricewatch_runtime::renderer::{BrowserLauncher, RenderError, Renderer};
use pricewatch_runtime::session::SessionManager;
use pricewatch_runtime::store::{PriceStore, SqliteStore};
use pricewatch_runtime::targets::{Catalog, CatalogDefaults};
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const KETTLE: &str = "https://shop.test/kettle";
const TOASTER: &str = "https://shop.test/toaster";

fn page(price: &str) -> FixturePage {
    FixturePage::ok(format!(
        "<html><body><h1>Kettle</h1><span class=\"price\">{price}</span></body></html>"
    ))
}

fn catalog(targets: &str) -> Catalog {
    let text = format!(
        r#"{{
            "rules": [{{"name": "shop", "currency": "USD",
                        "strategies": [{{"kind": "css", "selectors": [".price"]}}]}}],
            "targets": [{targets}]
        }}"#
    );
    Catalog::from_json_str(&text, &CatalogDefaults::new(Duration::from_secs(60))).unwrap()
}

fn config(dir: &TempDir, max_retries: u32) -> MonitorConfig {
    let vars: HashMap<&str, String> = HashMap::from([
        ("PRICEWATCH_WORKERS", "2".to_string()),
        ("PRICEWATCH_MAX_CONTEXTS", "2".to_string()),
        ("PRICEWATCH_LAUNCH_RETRIES", "0".to_string()),
        ("PRICEWATCH_NAV_TIMEOUT_SECS", "5".to_string()),
        ("PRICEWATCH_TICK_MS", "10".to_string()),
        ("PRICEWATCH_JITTER", "0".to_string()),
        ("PRICEWATCH_BACKOFF_BASE_SECS", "0".to_string()),
        ("PRICEWATCH_MAX_RETRIES", max_retries.to_string()),
        ("PRICEWATCH_MAX_EXTRACTION_RETRIES", max_retries.to_string()),
        ("PRICEWATCH_DB", dir.path().join("prices.db").display().to_string()),
        ("PRICEWATCH_HEALTH_DIR", dir.path().join("health").display().to_string()),
    ]);
    MonitorConfig::from_lookup(|name| vars.get(name).cloned())
}

struct Harness {
    _dir: TempDir,
    renderer: FixtureRenderer,
    store: Arc<dyn PriceStore>,
    events: broadcast::Receiver<MonitorEvent>,
    handle: MonitorHandle,
}

async fn start(catalog: Catalog, renderer: FixtureRenderer, max_retries: u32) -> Harness {
    let launcher = Arc::new(FixtureLauncher::new(renderer.clone()));
    start_with(catalog, renderer, launcher, max_retries).await
}

async fn start_with(
    catalog: Catalog,
    renderer: FixtureRenderer,
    launcher: Arc<dyn BrowserLauncher>,
    max_retries: u32,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir, max_retries);
    let store: Arc<dyn PriceStore> = Arc::new(
        SqliteStore::open(&config.db_path, 2, config.db_timeout)
            .await
            .unwrap(),
    );
    let sessions = Arc::new(SessionManager::start(launcher, config.session_config()).await);
    let deps = PipelineDeps {
        sessions,
        fetcher: config.fetcher(),
        store: Arc::clone(&store),
    };
    let bus = Arc::new(EventBus::new(256));
    let events = bus.subscribe();
    let alerts: Arc<dyn AlertSink> = bus;
    let handle = monitor::start(config, catalog, deps, alerts);
    Harness {
        _dir: dir,
        renderer,
        store,
        events,
        handle,
    }
}

/// Wait for the first event accepted by `pick`.
async fn next_matching<T>(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    mut pick: impl FnMut(&MonitorEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .expect("event not received in time")
}

fn price_change(target: &'static str) -> impl FnMut(&MonitorEvent) -> Option<(Classification, Option<rust_decimal::Decimal>)> {
    move |event| match event {
        MonitorEvent::PriceChanged { change, .. } if change.target_id == target => Some((
            change.classification,
            change.current_price.as_ref().map(|p| p.amount),
        )),
        _ => None,
    }
}

#[tokio::test]
async fn test_initial_then_increase() {
    let renderer = FixtureRenderer::new();
    renderer.set_page(KETTLE, page("$19.99"));
    let mut h = start(
        catalog(r#"{"id": "kettle", "url": "https://shop.test/kettle", "rule": "shop", "label": "Kettle"}"#),
        renderer,
        3,
    )
    .await;

    let (class, amount) = next_matching(&mut h.events, price_change("kettle")).await;
    assert_eq!(class, Classification::Initial);
    assert_eq!(amount, Some(dec!(19.99)));

    // Same price again: stored, but no change event.
    assert!(h.handle.recheck("kettle").await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.renderer.set_page(KETTLE, page("$24.99"));
    let mut started = false;
    for _ in 0..50 {
        if h.handle.recheck("kettle").await.unwrap() {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started);
    let (class, amount) = next_matching(&mut h.events, price_change("kettle")).await;
    assert_eq!(class, Classification::Increase);
    assert_eq!(amount, Some(dec!(24.99)));

    let history = h.store.history("kettle", 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].price.as_ref().unwrap().amount, dec!(24.99));
    let changes = h.store.change_events("kettle", 10).await.unwrap();
    assert_eq!(changes.len(), 2);
    let delta = changes[0].delta.as_ref().unwrap();
    assert_eq!(delta.absolute, dec!(5.00));
    assert_eq!(delta.percent, Some(dec!(25.01)));

    let status = h.handle.snapshot().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].label.as_deref(), Some("Kettle"));
    assert_eq!(status[0].last_price.as_ref().unwrap().amount, dec!(24.99));

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_target_suspends_and_reset_resumes() {
    // No page registered: every fetch fails like an unresolvable host.
    let renderer = FixtureRenderer::new();
    let mut h = start(
        catalog(r#"{"id": "kettle", "url": "https://shop.test/kettle", "rule": "shop"}"#),
        renderer,
        2,
    )
    .await;

    let (kind, failures) = next_matching(&mut h.events, |event| match event {
        MonitorEvent::TargetSuspended {
            target_id,
            kind,
            consecutive_failures,
            ..
        } if target_id == "kettle" => Some((*kind, *consecutive_failures)),
        _ => None,
    })
    .await;
    assert_eq!(kind, FailureKind::Network);
    assert_eq!(failures, 2);

    let status = h.handle.snapshot().await.unwrap();
    assert!(status[0].state.is_suspended());
    assert_eq!(status[0].next_run_in_ms, None);
    assert!(!h.handle.recheck("kettle").await.unwrap());

    let health = h.handle.health().await.unwrap();
    assert_eq!(health.targets.suspended, 1);

    h.renderer.set_page(KETTLE, page("$5.00"));
    assert!(h.handle.reset("kettle").await.unwrap());
    next_matching(&mut h.events, |event| match event {
        MonitorEvent::TargetReset { target_id } if target_id == "kettle" => Some(()),
        _ => None,
    })
    .await;
    let (class, _) = next_matching(&mut h.events, price_change("kettle")).await;
    assert_eq!(class, Classification::Initial);

    let status = h.handle.snapshot().await.unwrap();
    assert_eq!(status[0].consecutive_failures, 0);
    assert_eq!(status[0].state, TargetState::Idle);

    // Failure records are written in the background.
    let mut recorded = Vec::new();
    for _ in 0..50 {
        recorded = h.store.failures("kettle", 10).await.unwrap();
        if recorded.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|f| f.kind == FailureKind::Network));

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broken_target_does_not_affect_others() {
    let renderer = FixtureRenderer::new();
    renderer.set_page(KETTLE, page("$10.00"));
    renderer.set_page(
        TOASTER,
        FixturePage::ok("<html><body><h1>Toaster</h1><p>Price on request</p></body></html>"),
    );
    let mut h = start(
        catalog(
            r#"{"id": "kettle", "url": "https://shop.test/kettle", "rule": "shop"},
               {"id": "toaster", "url": "https://shop.test/toaster", "rule": "shop"}"#,
        ),
        renderer,
        2,
    )
    .await;

    let mut kettle_seen = false;
    let mut toaster_suspended = false;
    tokio::time::timeout(Duration::from_secs(10), async {
        while !(kettle_seen && toaster_suspended) {
            match h.events.recv().await.unwrap() {
                MonitorEvent::PriceChanged { change, .. } => {
                    assert_eq!(change.target_id, "kettle");
                    kettle_seen = true;
                }
                MonitorEvent::TargetSuspended { target_id, kind, reason, .. } => {
                    assert_eq!(target_id, "toaster");
                    assert_eq!(kind, FailureKind::SelectorNotFound);
                    assert!(reason.contains("stale"));
                    toaster_suspended = true;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(h.store.history("kettle", 10).await.unwrap().len(), 1);
    assert!(h.store.history("toaster", 10).await.unwrap().is_empty());

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disable_enable_and_reload() {
    let renderer = FixtureRenderer::new();
    renderer.set_page(KETTLE, page("$10.00"));
    renderer.set_page(TOASTER, page("$30.00"));
    let mut h = start(
        catalog(r#"{"id": "kettle", "url": "https://shop.test/kettle", "rule": "shop"}"#),
        renderer,
        3,
    )
    .await;
    next_matching(&mut h.events, price_change("kettle")).await;

    assert!(h.handle.disable("kettle").await.unwrap());
    assert!(!h.handle.recheck("kettle").await.unwrap());
    assert!(!h.handle.disable("missing").await.unwrap());
    assert!(h.handle.enable("kettle").await.unwrap());

    let summary = h
        .handle
        .reload(catalog(
            r#"{"id": "toaster", "url": "https://shop.test/toaster", "rule": "shop"},
               {"id": "bad", "url": "ftp://shop.test/x", "rule": "shop"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.rejected, 1);

    next_matching(&mut h.events, |event| match event {
        MonitorEvent::ConfigRejected { id, .. } if id.as_deref() == Some("bad") => Some(()),
        _ => None,
    })
    .await;
    let (class, amount) = next_matching(&mut h.events, price_change("toaster")).await;
    assert_eq!(class, Classification::Initial);
    assert_eq!(amount, Some(dec!(30.00)));

    let status = h.handle.snapshot().await.unwrap();
    let kettle = status.iter().find(|s| s.id == "kettle").unwrap();
    assert!(kettle.removed);
    assert!(!kettle.enabled);
    assert!(!h.handle.enable("kettle").await.unwrap());
    // History of a removed target is kept.
    assert_eq!(h.store.history("kettle", 10).await.unwrap().len(), 1);

    h.handle.shutdown().await.unwrap();
    assert!(h.handle.snapshot().await.is_err());
}

/// Browser that cannot be launched until `up` is set.
struct SwitchedLauncher {
    up: AtomicBool,
    renderer: FixtureRenderer,
}

#[async_trait]
impl BrowserLauncher for SwitchedLauncher {
    async fn launch(&self) -> Result<Arc<dyn Renderer>, RenderError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(Arc::new(self.renderer.clone()))
        } else {
            Err(RenderError::Launch("chromium not found".into()))
        }
    }
}

#[tokio::test]
async fn test_browser_outage_is_reported_once_and_suspends_nothing() {
    let renderer = FixtureRenderer::new();
    renderer.set_page(KETTLE, page("$10.00"));
    renderer.set_page(TOASTER, page("$30.00"));
    let launcher = Arc::new(SwitchedLauncher {
        up: AtomicBool::new(false),
        renderer: renderer.clone(),
    });
    let mut h = start_with(
        catalog(
            r#"{"id": "kettle", "url": "https://shop.test/kettle", "rule": "shop"},
               {"id": "toaster", "url": "https://shop.test/toaster", "rule": "shop"}"#,
        ),
        renderer,
        launcher.clone(),
        2,
    )
    .await;

    let kind = next_matching(&mut h.events, |event| match event {
        MonitorEvent::ResourceOutage { kind, .. } => Some(*kind),
        MonitorEvent::TargetSuspended { target_id, .. } => panic!("{target_id} suspended during outage"),
        _ => None,
    })
    .await;
    assert_eq!(kind, FailureKind::BrowserUnavailable);

    // Far more failed cycles than max_retries, still nothing suspended.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = h.handle.snapshot().await.unwrap();
    assert!(status.iter().all(|s| !s.state.is_suspended() && s.consecutive_failures == 0));
    assert_eq!(h.handle.health().await.unwrap().targets.suspended, 0);

    // The health tick relaunches the browser.
    launcher.up.store(true, Ordering::SeqCst);
    let mut outages = 0;
    let mut recovered = false;
    let mut priced = HashSet::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while !(recovered && priced.len() == 2) {
            match h.events.recv().await.unwrap() {
                MonitorEvent::ResourceOutage { .. } => outages += 1,
                MonitorEvent::ResourceRecovered { kind } => {
                    assert_eq!(kind, FailureKind::BrowserUnavailable);
                    recovered = true;
                }
                MonitorEvent::PriceChanged { change, .. } => {
                    assert_eq!(change.classification, Classification::Initial);
                    priced.insert(change.target_id.clone());
                }
                MonitorEvent::TargetSuspended { target_id, .. } => {
                    panic!("{target_id} suspended during outage")
                }
                _ => {}
            }
        }
    })
    .await
    .expect("browser did not recover in time");
    assert_eq!(outages, 0);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disable_during_cycle_lets_it_finish() {
    let renderer = FixtureRenderer::new();
    renderer.set_page(KETTLE, page("$10.00").with_delay(Duration::from_millis(500)));
    let mut h = start(
        catalog(r#"{"id": "kettle", "url": "https://shop.test/kettle", "rule": "shop"}"#),
        renderer,
        3,
    )
    .await;

    let mut in_flight = false;
    for _ in 0..100 {
        let status = h.handle.snapshot().await.unwrap();
        if status[0].in_flight {
            in_flight = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(in_flight, "first cycle never started");

    assert!(h.handle.disable("kettle").await.unwrap());
    let status = h.handle.snapshot().await.unwrap();
    assert!(status[0].in_flight);
    assert!(!status[0].enabled);

    // The running cycle still stores its reading.
    let (class, amount) = next_matching(&mut h.events, price_change("kettle")).await;
    assert_eq!(class, Classification::Initial);
    assert_eq!(amount, Some(dec!(10.00)));

    let status = h.handle.snapshot().await.unwrap();
    assert!(!status[0].in_flight);
    assert!(!status[0].enabled);
    assert_eq!(status[0].state, TargetState::Idle);
    assert!(!h.handle.recheck("kettle").await.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.store.history("kettle", 10).await.unwrap().len(), 1);

    h.handle.shutdown().await.unwrap();
}
