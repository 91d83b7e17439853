// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Show stored observations, change events and failures of one target.

use crate::cli::print_json;
use crate::config::MonitorConfig;
use crate::store::{PriceStore, SqliteStore};
use anyhow::Result;
use serde_json::json;

pub async fn run(target_id: &str, limit: usize, json: bool) -> Result<()> {
    let config = MonitorConfig::from_env();
    let store = SqliteStore::open(&config.db_path, 1, config.db_timeout).await?;

    let history = store.history(target_id, limit).await?;
    let changes = store.change_events(target_id, limit).await?;
    let failures = store.failures(target_id, limit).await?;

    if json {
        return print_json(&json!({
            "target_id": target_id,
            "observations": history,
            "changes": changes,
            "failures": failures,
        }));
    }

    if history.is_empty() && failures.is_empty() {
        println!("no data for {target_id}");
        return Ok(());
    }

    println!("observations ({}):", history.len());
    for obs in &history {
        let price = obs
            .price
            .as_ref()
            .map_or_else(|| "unavailable".to_string(), ToString::to_string);
        println!("  {}  {price}", obs.observed_at.to_rfc3339());
    }

    if !changes.is_empty() {
        println!("changes ({}):", changes.len());
        for change in &changes {
            let delta = change
                .delta
                .as_ref()
                .map(|d| match d.percent {
                    Some(pct) => format!(" {:+} ({pct:+}%)", d.absolute),
                    None => format!(" {:+}", d.absolute),
                })
                .unwrap_or_default();
            println!(
                "  {}  {}{delta}",
                change.current.observed_at.to_rfc3339(),
                change.classification
            );
        }
    }

    if !failures.is_empty() {
        println!("failures ({}):", failures.len());
        for f in &failures {
            println!(
                "  {}  {} (#{}) {}",
                f.occurred_at.to_rfc3339(),
                f.kind,
                f.retry_count,
                f.detail
            );
        }
    }
    Ok(())
}
