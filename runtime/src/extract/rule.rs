// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Declarative extraction rules.
//!
//! Rules are plain data loaded from the catalog; adding a site means adding a
//! rule, not code.

use super::locale::PriceLocale;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How to pick one value when a strategy yields several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickPolicy {
    /// All candidates must agree; otherwise the match is ambiguous.
    #[default]
    Unique,
    First,
    Lowest,
    Highest,
}

/// One way to find price candidates on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Text (or `attribute`) of elements matching any of `selectors`.
    Css {
        selectors: Vec<String>,
        #[serde(default)]
        attribute: Option<String>,
    },
    /// Regex over the page's visible text. Uses the `price` group, or group 1.
    Regex { pattern: String },
    /// JSON embedded in `<script>` tags whose text contains `contains`.
    ///
    /// With a variant selected, `paths` are read relative to the matching
    /// entry of the first collection found under `variants`.
    JsonScript {
        contains: String,
        paths: Vec<String>,
        #[serde(default)]
        variants: Vec<String>,
    },
    /// schema.org `Product` offers in `application/ld+json` blocks.
    JsonLd {},
}

impl Strategy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Css { .. } => "css",
            Self::Regex { .. } => "regex",
            Self::JsonScript { .. } => "json_script",
            Self::JsonLd {} => "json_ld",
        }
    }

    /// Whether the strategy can narrow its candidates to one variant.
    pub fn selects_variants(&self) -> bool {
        match self {
            Self::JsonScript { variants, .. } => !variants.is_empty(),
            Self::JsonLd {} => true,
            Self::Css { .. } | Self::Regex { .. } => false,
        }
    }
}

/// Markers that mean the item cannot be bought right now.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnavailableMarker {
    /// Present element means unavailable.
    #[serde(default)]
    pub selector: Option<String>,
    /// Case-insensitive phrases in the visible text.
    #[serde(default)]
    pub text: Vec<String>,
}

impl UnavailableMarker {
    pub fn is_empty(&self) -> bool {
        self.selector.is_none() && self.text.iter().all(|t| t.trim().is_empty())
    }
}

/// Extraction rule for one site or page family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub name: String,
    /// Tried in order; the first strategy that yields candidates decides.
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub locale: PriceLocale,
    /// ISO currency used when none is detected.
    pub currency: String,
    /// Read the currency from the matched text or structured data.
    #[serde(default)]
    pub detect_currency: bool,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default)]
    pub pick: PickPolicy,
    #[serde(default)]
    pub unavailable: Option<UnavailableMarker>,
    #[serde(default = "default_title_selector")]
    pub title_selector: Option<String>,
    /// Offer to read when a product page lists several: matched against
    /// `sku`, `name`, `id`, `mpn`, `gtin` or `"name|id"`. Targets may override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

fn default_scale() -> u32 {
    2
}

fn default_title_selector() -> Option<String> {
    Some("h1".to_string())
}

impl ExtractionRule {
    /// Rule with a single CSS strategy and default settings.
    pub fn css(name: impl Into<String>, selector: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategies: vec![Strategy::Css {
                selectors: vec![selector.into()],
                attribute: None,
            }],
            locale: PriceLocale::default(),
            currency: currency.into(),
            detect_currency: false,
            scale: default_scale(),
            pick: PickPolicy::default(),
            unavailable: None,
            title_selector: default_title_selector(),
            variant: None,
        }
    }

    pub fn with_locale(mut self, locale: PriceLocale) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_pick(mut self, pick: PickPolicy) -> Self {
        self.pick = pick;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_unavailable(mut self, marker: UnavailableMarker) -> Self {
        self.unavailable = Some(marker);
        self
    }

    /// Select `variant`, keeping the rule's own selection when `None`.
    pub fn with_variant(mut self, variant: Option<String>) -> Self {
        if variant.is_some() {
            self.variant = variant;
        }
        self
    }

    /// Check selectors, patterns and settings. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("rule name is empty".to_string());
        }
        if self.strategies.is_empty() {
            problems.push("no strategies".to_string());
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            problems.push(format!("currency {:?} is not an ISO 4217 code", self.currency));
        }
        if self.scale > 8 {
            problems.push(format!("scale {} is above 8", self.scale));
        }

        for (i, strategy) in self.strategies.iter().enumerate() {
            match strategy {
                Strategy::Css { selectors, .. } => {
                    if selectors.is_empty() {
                        problems.push(format!("strategy {i}: no selectors"));
                    }
                    for sel in selectors {
                        if scraper::Selector::parse(sel).is_err() {
                            problems.push(format!("strategy {i}: invalid selector {sel:?}"));
                        }
                    }
                }
                Strategy::Regex { pattern } => match regex::Regex::new(pattern) {
                    Ok(re) if re.captures_len() < 2 => {
                        problems.push(format!("strategy {i}: pattern has no capture group"));
                    }
                    Ok(_) => {}
                    Err(e) => problems.push(format!("strategy {i}: invalid pattern: {e}")),
                },
                Strategy::JsonScript {
                    contains,
                    paths,
                    variants,
                } => {
                    if contains.is_empty() {
                        problems.push(format!("strategy {i}: empty `contains`"));
                    }
                    if paths.is_empty() {
                        problems.push(format!("strategy {i}: no paths"));
                    }
                    if variants.iter().any(|v| v.trim().is_empty()) {
                        problems.push(format!("strategy {i}: empty variants path"));
                    }
                }
                Strategy::JsonLd {} => {}
            }
        }

        if let Some(marker) = &self.unavailable {
            if let Some(sel) = &marker.selector {
                if scraper::Selector::parse(sel).is_err() {
                    problems.push(format!("unavailable marker: invalid selector {sel:?}"));
                }
            }
        }
        if let Some(sel) = &self.title_selector {
            if scraper::Selector::parse(sel).is_err() {
                problems.push(format!("invalid title selector {sel:?}"));
            }
        }
        if self.variant.is_some() && !self.strategies.iter().any(Strategy::selects_variants) {
            problems.push("variant set but no strategy can select variants".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Rules by name.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    rules: HashMap<String, ExtractionRule>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: ExtractionRule) -> Option<ExtractionRule> {
        self.rules.insert(rule.name.clone(), rule)
    }

    pub fn get(&self, name: &str) -> Option<&ExtractionRule> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_from_json_with_defaults() {
        let rule: ExtractionRule = serde_json::from_str(
            r#"{
                "name": "shop-de",
                "locale": "de",
                "currency": "EUR",
                "strategies": [
                    {"kind": "json_ld"},
                    {"kind": "css", "selectors": [".price", "[itemprop=price]"], "attribute": "content"},
                    {"kind": "regex", "pattern": "Preis:\\s*(?P<price>[\\d.,]+)"}
                ],
                "unavailable": {"text": ["nicht lieferbar"]}
            }"#,
        )
        .unwrap();
        assert_eq!(rule.scale, 2);
        assert_eq!(rule.pick, PickPolicy::Unique);
        assert_eq!(rule.title_selector.as_deref(), Some("h1"));
        assert_eq!(rule.strategies[0].kind(), "json_ld");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let rule = ExtractionRule {
            currency: "euro".into(),
            ..ExtractionRule::css("bad", "div[", "EUR")
        }
        .with_strategy(Strategy::Regex {
            pattern: r"\d+".into(),
        });
        let problems = rule.validate().unwrap_err();
        assert_eq!(problems.len(), 3, "{problems:?}");
    }

    #[test]
    fn test_variant_needs_a_structured_strategy() {
        let css = ExtractionRule::css("c", ".price", "RUB").with_variant(Some("XL".into()));
        assert!(css.validate().is_err());

        let rule: ExtractionRule = serde_json::from_str(
            r#"{"name": "mk", "currency": "RUB", "variant": "Red",
                "strategies": [{"kind": "json_script", "contains": "variants",
                                "paths": ["price"], "variants": ["product.variants"]}]}"#,
        )
        .unwrap();
        assert!(rule.validate().is_ok());
        assert_eq!(rule.clone().with_variant(None).variant.as_deref(), Some("Red"));
        assert_eq!(rule.with_variant(Some("Blue".into())).variant.as_deref(), Some("Blue"));
    }
}
