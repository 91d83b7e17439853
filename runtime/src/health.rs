// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Health ledger: a small JSON file rewritten periodically by the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LEDGER_FILE: &str = "pricewatch.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// Some targets are suspended.
    Degraded,
    /// A shared resource (browser, store) is down.
    Outage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserHealth {
    pub degraded: bool,
    pub available_slots: usize,
    pub active_contexts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCounts {
    pub total: usize,
    pub enabled: usize,
    pub running: usize,
    pub backoff: usize,
    pub suspended: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCounters {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub changes_detected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub project: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub browser: BrowserHealth,
    pub targets: TargetCounts,
    pub counters: CycleCounters,
    /// Description of the current outage, if any.
    pub outage: Option<String>,
}

impl HealthSnapshot {
    pub fn new(
        browser: BrowserHealth,
        targets: TargetCounts,
        counters: CycleCounters,
        outage: Option<String>,
    ) -> Self {
        let status = if outage.is_some() || browser.degraded {
            HealthStatus::Outage
        } else if targets.suspended > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        Self {
            project: "pricewatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            status,
            browser,
            targets,
            counters,
            outage,
        }
    }
}

/// Atomically replace the ledger in `dir`. Returns the file written.
pub fn write_snapshot(dir: &Path, snapshot: &HealthSnapshot) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LEDGER_FILE);
    let tmp = dir.join(format!("{LEDGER_FILE}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Read the ledger back, e.g. for a status command.
pub fn read_snapshot(dir: &Path) -> anyhow::Result<HealthSnapshot> {
    let bytes = std::fs::read(dir.join(LEDGER_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        let ok = HealthSnapshot::new(
            BrowserHealth::default(),
            TargetCounts::default(),
            CycleCounters::default(),
            None,
        );
        assert_eq!(ok.status, HealthStatus::Ok);

        let degraded = HealthSnapshot::new(
            BrowserHealth::default(),
            TargetCounts {
                suspended: 1,
                ..TargetCounts::default()
            },
            CycleCounters::default(),
            None,
        );
        assert_eq!(degraded.status, HealthStatus::Degraded);

        let outage = HealthSnapshot::new(
            BrowserHealth {
                degraded: true,
                ..BrowserHealth::default()
            },
            TargetCounts::default(),
            CycleCounters::default(),
            None,
        );
        assert_eq!(outage.status, HealthStatus::Outage);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = HealthSnapshot::new(
            BrowserHealth {
                degraded: false,
                available_slots: 3,
                active_contexts: 1,
            },
            TargetCounts {
                total: 2,
                enabled: 2,
                ..TargetCounts::default()
            },
            CycleCounters {
                cycles_ok: 7,
                ..CycleCounters::default()
            },
            None,
        );
        let path = write_snapshot(dir.path(), &snapshot).unwrap();
        assert!(path.ends_with("pricewatch.json"));
        assert!(!dir.path().join("pricewatch.json.tmp").exists());
        assert_eq!(read_snapshot(dir.path()).unwrap(), snapshot);
    }
}
