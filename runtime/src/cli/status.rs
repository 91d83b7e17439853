// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Show the health ledger written by a running monitor.

use crate::cli::print_json;
use crate::config::MonitorConfig;
use crate::health::{self, HealthStatus};
use anyhow::{Context, Result};

pub async fn run(json: bool) -> Result<()> {
    let config = MonitorConfig::from_env();
    let snapshot = health::read_snapshot(&config.health_dir).with_context(|| {
        format!(
            "no health ledger in {} (is the monitor running?)",
            config.health_dir.display()
        )
    })?;

    if json {
        return print_json(&snapshot);
    }

    let age = chrono::Utc::now() - snapshot.timestamp;
    let status = match snapshot.status {
        HealthStatus::Ok => "ok",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Outage => "outage",
    };
    println!(
        "pricewatch v{}: {status} (updated {}s ago)",
        snapshot.version,
        age.num_seconds()
    );
    let t = &snapshot.targets;
    println!(
        "  targets: {} total, {} enabled, {} running, {} backing off, {} suspended",
        t.total, t.enabled, t.running, t.backoff, t.suspended
    );
    let c = &snapshot.counters;
    println!(
        "  cycles: {} ok, {} failed, {} changes",
        c.cycles_ok, c.cycles_failed, c.changes_detected
    );
    let b = &snapshot.browser;
    println!(
        "  browser: {} active contexts, {} free slots{}",
        b.active_contexts,
        b.available_slots,
        if b.degraded { ", degraded" } else { "" }
    );
    if let Some(outage) = &snapshot.outage {
        println!("  outage: {outage}");
    }
    Ok(())
}
