// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Target and rule catalog.
//!
//! The catalog is a JSON file with `defaults`, `rules` and `targets`. Loading
//! is tolerant: each invalid entry is skipped and reported as [`Rejected`],
//! the rest of the catalog still loads.

use crate::detect::NoisePolicy;
use crate::extract::{ExtractionRule, RuleBook};
use crate::fetcher::WaitPolicy;
use crate::renderer::ContextProfile;
use crate::reprice::RepricingRule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Shortest interval accepted for a target.
pub const MIN_INTERVAL: Duration = Duration::from_secs(10);

/// A monitored product page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub id: String,
    pub url: String,
    /// Name of the extraction rule in the catalog.
    pub rule: String,
    pub interval: Duration,
    pub enabled: bool,
    pub wait: WaitPolicy,
    pub profile: ContextProfile,
    pub label: Option<String>,
    /// Offer to read on multi-variant pages. Overrides the rule's choice.
    pub variant: Option<String>,
    /// Own rules first, then the catalog-wide ones.
    pub repricing: Vec<RepricingRule>,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    id: String,
    url: String,
    rule: String,
    #[serde(default)]
    interval_secs: Option<u64>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    wait: Option<WaitPolicy>,
    #[serde(default)]
    profile: Option<ContextProfile>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    repricing: Vec<RepricingRule>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct Defaults {
    #[serde(default)]
    interval_secs: Option<u64>,
    #[serde(default)]
    noise: NoisePolicy,
    #[serde(default)]
    wait: WaitPolicy,
    #[serde(default)]
    profile: Option<ContextProfile>,
    #[serde(default)]
    repricing: Vec<RepricingRule>,
    #[serde(default)]
    price_types: Vec<String>,
}

/// Catalog section an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Defaults,
    Rules,
    Targets,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Defaults => "defaults",
            Self::Rules => "rules",
            Self::Targets => "targets",
        }
    }
}

/// A skipped catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub section: Section,
    pub index: usize,
    pub id: Option<String>,
    pub reason: String,
}

/// Process-level values for whatever the catalog leaves unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDefaults {
    pub interval: Duration,
    pub profile: ContextProfile,
}

impl CatalogDefaults {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            profile: ContextProfile::default(),
        }
    }
}

/// Parsed catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub targets: Vec<Target>,
    pub rules: RuleBook,
    pub noise: NoisePolicy,
    /// Price types repriced at the competitor price when a target has no rules.
    pub price_types: Vec<String>,
    pub rejected: Vec<Rejected>,
}

impl Catalog {
    /// Read and parse a catalog file.
    pub async fn load(path: impl AsRef<Path>, fallback: &CatalogDefaults) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read catalog {}", path.display()))?;
        Self::from_json_str(&text, fallback)
            .with_context(|| format!("invalid catalog {}", path.display()))
    }

    /// Parse a catalog. Fails only when the text is not a JSON object.
    ///
    /// A target's profile is resolved field by field: the target entry, then
    /// the catalog `defaults`, then `fallback`.
    pub fn from_json_str(text: &str, fallback: &CatalogDefaults) -> Result<Self> {
        let root: Value = serde_json::from_str(text).context("catalog is not valid JSON")?;
        let Value::Object(mut root) = root else {
            anyhow::bail!("catalog must be a JSON object");
        };

        let mut catalog = Catalog::default();

        let defaults = match root.remove("defaults") {
            None => Defaults::default(),
            Some(value) => serde_json::from_value::<Defaults>(value).unwrap_or_else(|e| {
                catalog.reject(Section::Defaults, 0, None, format!("ignored: {e}"));
                Defaults::default()
            }),
        };
        catalog.noise = defaults.noise.clone();
        catalog.price_types = defaults
            .price_types
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let mut shared_repricing = Vec::new();
        for (index, rule) in defaults.repricing.iter().enumerate() {
            match rule.validate() {
                Ok(()) => shared_repricing.push(rule.clone()),
                Err(reason) => catalog.reject(
                    Section::Defaults,
                    index,
                    Some(rule.price_type.clone()),
                    format!("repricing rule ignored: {reason}"),
                ),
            }
        }
        let interval = defaults
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or(fallback.interval);
        let profile = defaults.profile.clone().unwrap_or_default().or(&fallback.profile);

        for (index, value) in array(&mut root, "rules").into_iter().enumerate() {
            let id = entry_id(&value, "name");
            let rule = match serde_json::from_value::<ExtractionRule>(value) {
                Ok(rule) => rule,
                Err(e) => {
                    catalog.reject(Section::Rules, index, id, e.to_string());
                    continue;
                }
            };
            if let Err(problems) = rule.validate() {
                catalog.reject(Section::Rules, index, id, problems.join("; "));
                continue;
            }
            if catalog.rules.contains(&rule.name) {
                catalog.reject(Section::Rules, index, id, "duplicate rule name".to_string());
                continue;
            }
            catalog.rules.insert(rule);
        }

        let mut seen = HashSet::new();
        for (index, value) in array(&mut root, "targets").into_iter().enumerate() {
            let id = entry_id(&value, "id");
            let entry = match serde_json::from_value::<TargetEntry>(value) {
                Ok(entry) => entry,
                Err(e) => {
                    catalog.reject(Section::Targets, index, id, e.to_string());
                    continue;
                }
            };
            match catalog.check_target(&entry, &seen) {
                Ok(()) => {}
                Err(reason) => {
                    catalog.reject(Section::Targets, index, id, reason);
                    continue;
                }
            }
            let target_interval = entry.interval_secs.map(Duration::from_secs).unwrap_or(interval);
            seen.insert(entry.id.clone());
            catalog.targets.push(Target {
                id: entry.id,
                url: entry.url,
                rule: entry.rule,
                interval: target_interval,
                enabled: entry.enabled,
                wait: entry.wait.unwrap_or_else(|| defaults.wait.clone()),
                profile: entry.profile.unwrap_or_default().or(&profile),
                label: entry.label,
                variant: entry.variant.filter(|v| !v.trim().is_empty()),
                repricing: entry.repricing.into_iter().chain(shared_repricing.iter().cloned()).collect(),
            });
        }

        Ok(catalog)
    }

    fn check_target(&self, entry: &TargetEntry, seen: &HashSet<String>) -> Result<(), String> {
        if entry.id.trim().is_empty() {
            return Err("empty id".to_string());
        }
        if seen.contains(&entry.id) {
            return Err("duplicate target id".to_string());
        }
        let url = url::Url::parse(&entry.url).map_err(|e| format!("invalid url {:?}: {e}", entry.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported url scheme {:?}", url.scheme()));
        }
        let Some(rule) = self.rules.get(&entry.rule) else {
            return Err(format!("unknown rule {:?}", entry.rule));
        };
        if entry.variant.as_deref().is_some_and(|v| !v.trim().is_empty())
            && !rule.strategies.iter().any(|s| s.selects_variants())
        {
            return Err(format!("rule {:?} cannot select variants", entry.rule));
        }
        for rule in &entry.repricing {
            rule.validate()?;
        }
        if let Some(secs) = entry.interval_secs {
            if Duration::from_secs(secs) < MIN_INTERVAL {
                return Err(format!(
                    "interval {secs}s is below the minimum of {}s",
                    MIN_INTERVAL.as_secs()
                ));
            }
        }
        if let Some(WaitPolicy::Selector { selector }) = &entry.wait {
            if scraper::Selector::parse(selector).is_err() {
                return Err(format!("invalid wait selector {selector:?}"));
            }
        }
        Ok(())
    }

    fn reject(&mut self, section: Section, index: usize, id: Option<String>, reason: String) {
        tracing::warn!(
            "catalog {}[{index}]{} rejected: {reason}",
            section.as_str(),
            id.as_deref().map(|i| format!(" ({i})")).unwrap_or_default()
        );
        self.rejected.push(Rejected {
            section,
            index,
            id,
            reason,
        });
    }

    pub fn target(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Rule of `target`. Present for every loaded target.
    pub fn rule_for(&self, target: &Target) -> Option<&ExtractionRule> {
        self.rules.get(&target.rule)
    }
}

fn array(root: &mut serde_json::Map<String, Value>, key: &str) -> Vec<Value> {
    match root.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn entry_id(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::NoiseThreshold;
    use rust_decimal_macros::dec;

    const CATALOG: &str = r#"{
        "defaults": {
            "interval_secs": 600,
            "noise": {"default": {"mode": "ratio", "value": "0.001"},
                      "per_currency": {"RUB": {"mode": "absolute", "value": "1"}}},
            "wait": {"kind": "network_idle", "idle_ms": 300}
        },
        "rules": [
            {"name": "petrovich", "locale": "ru", "currency": "RUB",
             "strategies": [{"kind": "css", "selectors": ["[data-test=product-price]"]}]},
            {"name": "broken", "currency": "RUB", "strategies": [{"kind": "css", "selectors": ["div["]}]},
            {"name": "petrovich", "currency": "RUB", "strategies": [{"kind": "json_ld"}]},
            {"currency": "EUR"}
        ],
        "targets": [
            {"id": "drill", "url": "https://petrovich.test/p/1", "rule": "petrovich"},
            {"id": "saw", "url": "https://petrovich.test/p/2", "rule": "petrovich",
             "interval_secs": 3600, "enabled": false, "label": "Saw"},
            {"id": "drill", "url": "https://petrovich.test/p/3", "rule": "petrovich"},
            {"id": "ftp", "url": "ftp://petrovich.test/p", "rule": "petrovich"},
            {"id": "nobody", "url": "https://x.test/", "rule": "missing"},
            {"id": "fast", "url": "https://x.test/", "rule": "petrovich", "interval_secs": 1},
            {"url": "https://x.test/"}
        ]
    }"#;

    #[test]
    fn test_tolerant_load() {
        let catalog =
            Catalog::from_json_str(CATALOG, &CatalogDefaults::new(Duration::from_secs(900))).unwrap();
        assert_eq!(catalog.rules.len(), 1);
        assert_eq!(catalog.targets.len(), 2);

        let drill = catalog.target("drill").unwrap();
        assert_eq!(drill.interval, Duration::from_secs(600));
        assert!(drill.enabled);
        assert_eq!(drill.wait, WaitPolicy::NetworkIdle { idle_ms: 300 });
        let saw = catalog.target("saw").unwrap();
        assert_eq!(saw.interval, Duration::from_secs(3600));
        assert!(!saw.enabled);
        assert!(catalog.rule_for(saw).is_some());

        let rejected: Vec<(Section, usize)> =
            catalog.rejected.iter().map(|r| (r.section, r.index)).collect();
        assert_eq!(
            rejected,
            vec![
                (Section::Rules, 1),
                (Section::Rules, 2),
                (Section::Rules, 3),
                (Section::Targets, 2),
                (Section::Targets, 3),
                (Section::Targets, 4),
                (Section::Targets, 5),
                (Section::Targets, 6),
            ]
        );
        assert_eq!(catalog.rejected[3].id.as_deref(), Some("drill"));

        assert_eq!(catalog.noise.threshold_for("rub"), NoiseThreshold::Absolute(dec!(1)));
        assert_eq!(catalog.noise.threshold_for("EUR"), NoiseThreshold::Ratio(dec!(0.001)));
    }

    #[test]
    fn test_not_an_object_fails() {
        assert!(Catalog::from_json_str("[]", &CatalogDefaults::new(Duration::from_secs(60))).is_err());
        assert!(Catalog::from_json_str("{", &CatalogDefaults::new(Duration::from_secs(60))).is_err());
        let empty = Catalog::from_json_str("{}", &CatalogDefaults::new(Duration::from_secs(60))).unwrap();
        assert!(empty.targets.is_empty() && empty.rejected.is_empty());
    }

    #[test]
    fn test_profile_falls_back_field_by_field() {
        let fallback = CatalogDefaults {
            interval: Duration::from_secs(900),
            profile: ContextProfile {
                user_agent: Some("pricewatch-test/1.0".into()),
                accept_language: Some("de-DE,de;q=0.9".into()),
            },
        };
        let text = r#"{
            "defaults": {"profile": {"accept_language": "ru-RU"}},
            "rules": [{"name": "r", "currency": "RUB", "strategies": [{"kind": "json_ld"}]}],
            "targets": [
                {"id": "plain", "url": "https://x.test/1", "rule": "r"},
                {"id": "own", "url": "https://x.test/2", "rule": "r",
                 "profile": {"user_agent": "Custom/2.0"}}
            ]
        }"#;
        let catalog = Catalog::from_json_str(text, &fallback).unwrap();
        let plain = &catalog.target("plain").unwrap().profile;
        assert_eq!(plain.user_agent.as_deref(), Some("pricewatch-test/1.0"));
        assert_eq!(plain.accept_language.as_deref(), Some("ru-RU"));
        let own = &catalog.target("own").unwrap().profile;
        assert_eq!(own.user_agent.as_deref(), Some("Custom/2.0"));
        assert_eq!(own.accept_language.as_deref(), Some("ru-RU"));

        // Without catalog defaults every target gets the process profile.
        let bare = Catalog::from_json_str(
            r#"{"rules": [{"name": "r", "currency": "RUB", "strategies": [{"kind": "json_ld"}]}],
                "targets": [{"id": "plain", "url": "https://x.test/1", "rule": "r"}]}"#,
            &fallback,
        )
        .unwrap();
        assert_eq!(bare.targets[0].profile, fallback.profile);
    }

    #[test]
    fn test_variant_requires_a_capable_rule() {
        let text = r#"{
            "rules": [
                {"name": "ld", "currency": "RUB", "strategies": [{"kind": "json_ld"}]},
                {"name": "css", "currency": "RUB", "strategies": [{"kind": "css", "selectors": [".p"]}]}
            ],
            "targets": [
                {"id": "nozzle", "url": "https://x.test/n", "rule": "ld", "variant": "N-06"},
                {"id": "flat", "url": "https://x.test/f", "rule": "css", "variant": "N-06"}
            ]
        }"#;
        let catalog = Catalog::from_json_str(text, &CatalogDefaults::new(Duration::from_secs(900))).unwrap();
        assert_eq!(catalog.target("nozzle").unwrap().variant.as_deref(), Some("N-06"));
        assert!(catalog.target("flat").is_none());
        assert_eq!(catalog.rejected.len(), 1);
        assert!(catalog.rejected[0].reason.contains("cannot select variants"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, CATALOG).unwrap();
        let fallback = CatalogDefaults::new(Duration::from_secs(900));
        let catalog = Catalog::load(&path, &fallback).await.unwrap();
        assert_eq!(catalog.targets.len(), 2);
        assert!(Catalog::load(dir.path().join("missing.json"), &fallback)
            .await
            .is_err());
    }
}
