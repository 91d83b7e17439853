// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Run fetch and extraction for one target and print what was read.
//!
//! Nothing is persisted. With `--fixture` the page comes from a saved HTML
//! file instead of the browser, which is how rules are developed offline.

use crate::cli::print_json;
use crate::config::MonitorConfig;
use crate::detect::classify;
use crate::monitor::pipeline::{self, PipelineDeps};
use crate::renderer::chromium::{ChromiumLauncher, ChromiumOptions};
use crate::renderer::fixture::{FixtureLauncher, FixturePage, FixtureRenderer};
use crate::renderer::BrowserLauncher;
use crate::session::SessionManager;
use crate::store::{PriceStore, SqliteStore};
use crate::targets::Catalog;
use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub async fn run(
    catalog_path: &Path,
    target_id: &str,
    fixture: Option<&Path>,
    compare: bool,
    json: bool,
) -> Result<()> {
    let config = MonitorConfig::from_env();
    let catalog = Catalog::load(catalog_path, &config.catalog_defaults()).await?;
    let target = catalog
        .target(target_id)
        .with_context(|| format!("no target {target_id:?} in {}", catalog_path.display()))?
        .clone();
    let rule = catalog
        .rule_for(&target)
        .with_context(|| format!("rule {:?} is missing", target.rule))?
        .clone()
        .with_variant(target.variant.clone());

    let launcher: Arc<dyn BrowserLauncher> = match fixture {
        Some(path) => {
            let html = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read fixture {}", path.display()))?;
            let renderer = FixtureRenderer::new();
            renderer.set_page(target.url.clone(), FixturePage::ok(html));
            Arc::new(FixtureLauncher::new(renderer))
        }
        None => Arc::new(ChromiumLauncher::new(ChromiumOptions::default())),
    };
    let sessions = Arc::new(SessionManager::start(launcher, config.session_config()).await);
    let store: Arc<dyn PriceStore> =
        Arc::new(SqliteStore::open(&config.db_path, 1, config.db_timeout).await?);
    let deps = PipelineDeps {
        sessions: Arc::clone(&sessions),
        fetcher: config.fetcher(),
        store: Arc::clone(&store),
    };

    let result = async {
        let page = pipeline::fetch_page(&deps, &target).await?;
        pipeline::extract_page(page, rule).await
    }
    .await;
    sessions.shutdown().await;
    let (page, reading) = result?;

    let observation = pipeline::observation(&target, &page, reading.clone());
    let change = if compare {
        let previous = store.last_observation(&target.id).await?;
        classify(previous.as_ref(), &observation, &catalog.noise)?
    } else {
        None
    };

    if json {
        return print_json(&json!({
            "target_id": target.id,
            "url": page.final_url,
            "status": page.status,
            "latency_ms": observation.fetch_latency_ms,
            "reading": reading,
            "change": change,
        }));
    }

    println!("{} ({})", target.id, page.final_url);
    if let Some(title) = &reading.title {
        println!("  title:   {title}");
    }
    match &reading.price {
        Some(price) => println!("  price:   {price}"),
        None => println!("  price:   unavailable"),
    }
    println!("  matched: {} {:?}", reading.matched_by, reading.raw_text);
    println!("  latency: {}ms", observation.fetch_latency_ms);
    if compare {
        match change {
            Some(c) => println!("  change:  {}", c.classification),
            None => println!("  change:  none"),
        }
    }
    Ok(())
}
