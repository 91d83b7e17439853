// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Check a catalog file without starting anything.

use crate::cli::print_json;
use crate::config::MonitorConfig;
use crate::targets::Catalog;
use anyhow::{bail, Result};
use serde_json::json;
use std::path::Path;

pub async fn run(path: &Path, json: bool) -> Result<()> {
    let config = MonitorConfig::from_env();
    let catalog = Catalog::load(path, &config.catalog_defaults()).await?;

    if json {
        print_json(&json!({
            "rules": catalog.rules.names().collect::<Vec<_>>(),
            "targets": catalog.targets.iter().map(|t| &t.id).collect::<Vec<_>>(),
            "rejected": catalog.rejected,
        }))?;
    } else {
        println!(
            "{}: {} rules, {} targets ({} enabled)",
            path.display(),
            catalog.rules.len(),
            catalog.targets.len(),
            catalog.targets.iter().filter(|t| t.enabled).count()
        );
        for r in &catalog.rejected {
            println!(
                "  rejected {}[{}]{}: {}",
                r.section.as_str(),
                r.index,
                r.id.as_deref().map(|id| format!(" {id}")).unwrap_or_default(),
                r.reason
            );
        }
    }

    if !catalog.rejected.is_empty() {
        bail!("{} catalog entries rejected", catalog.rejected.len());
    }
    Ok(())
}
