// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Price extraction from rendered HTML.
//!
//! [`extract`] applies an [`ExtractionRule`] to a [`RawPage`]: availability
//! markers first, then each strategy in order until one yields candidates,
//! then the rule's pick policy. The parsed document never outlives the call,
//! so nothing here is held across an await point.

pub mod json;
pub mod locale;
pub mod rule;

pub use locale::{detect_currency, parse_canonical, parse_price, PriceLocale};
pub use rule::{ExtractionRule, PickPolicy, RuleBook, Strategy, UnavailableMarker};

use crate::error::{FailureKind, PipelineError};
use crate::fetcher::RawPage;
use crate::model::Price;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use serde::{Deserialize, Serialize};

/// Result of applying a rule to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceReading {
    /// `None` when the page marks the item unavailable.
    pub price: Option<Price>,
    /// Text the price (or the unavailability) was read from.
    pub raw_text: String,
    pub title: Option<String>,
    /// Strategy that decided, or `"unavailable"`.
    pub matched_by: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    raw: String,
    amount: Decimal,
    currency: Option<String>,
}

enum Found {
    Candidates(Vec<Candidate>),
    Unavailable(String),
    Nothing,
}

/// Apply `rule` to `page`.
pub fn extract(page: &RawPage, rule: &ExtractionRule) -> Result<PriceReading, PipelineError> {
    let doc = Html::parse_document(&page.html);
    let text = document_text(&doc);
    let title = find_title(&doc, rule)?;

    if let Some(marker) = &rule.unavailable {
        if let Some(raw) = unavailable_marker(&doc, &text, marker, rule)? {
            return Ok(PriceReading {
                price: None,
                raw_text: raw,
                title,
                matched_by: "unavailable".to_string(),
            });
        }
    }

    for strategy in &rule.strategies {
        let found = match strategy {
            Strategy::Css {
                selectors,
                attribute,
            } => css_candidates(&doc, selectors, attribute.as_deref(), rule)?,
            Strategy::Regex { pattern } => regex_candidates(&text, pattern, rule)?,
            Strategy::JsonScript {
                contains,
                paths,
                variants,
            } => json_script_candidates(&doc, contains, paths, variants, rule)?,
            Strategy::JsonLd {} => json_ld_candidates(&doc, rule)?,
        };
        match found {
            Found::Nothing => continue,
            Found::Unavailable(raw) => {
                return Ok(PriceReading {
                    price: None,
                    raw_text: raw,
                    title,
                    matched_by: strategy.kind().to_string(),
                })
            }
            Found::Candidates(candidates) => {
                let (price, raw) = pick(candidates, rule)?;
                tracing::debug!("rule {} matched {} via {}", rule.name, price, strategy.kind());
                return Ok(PriceReading {
                    price: Some(price),
                    raw_text: raw,
                    title,
                    matched_by: strategy.kind().to_string(),
                });
            }
        }
    }

    let variant = rule
        .variant
        .as_deref()
        .map(|v| format!(" for variant {v:?}"))
        .unwrap_or_default();
    Err(PipelineError::extraction(
        FailureKind::SelectorNotFound,
        format!("rule {}: no strategy matched{variant} on {}", rule.name, page.final_url),
    ))
}

/// Visible text of an HTML document, whitespace collapsed.
pub fn visible_text(html: &str) -> String {
    document_text(&Html::parse_document(html))
}

fn document_text(doc: &Html) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in doc.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value().as_element().is_some_and(|e| {
                matches!(e.name(), "script" | "style" | "noscript" | "template" | "head")
            })
        });
        if !hidden {
            parts.push(text);
        }
    }
    collapse(&parts.join(" "))
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse(&el.text().collect::<String>())
}

fn selector(sel: &str, rule: &ExtractionRule) -> Result<Selector, PipelineError> {
    Selector::parse(sel).map_err(|e| {
        PipelineError::extraction(
            FailureKind::InvalidRule,
            format!("rule {}: invalid selector {sel:?}: {e}", rule.name),
        )
    })
}

fn find_title(doc: &Html, rule: &ExtractionRule) -> Result<Option<String>, PipelineError> {
    if let Some(sel) = &rule.title_selector {
        let sel = selector(sel, rule)?;
        if let Some(title) = doc.select(&sel).map(element_text).find(|t| !t.is_empty()) {
            return Ok(Some(title));
        }
    }
    let fallback = selector("title", rule)?;
    Ok(doc.select(&fallback).map(element_text).find(|t| !t.is_empty()))
}

fn unavailable_marker(
    doc: &Html,
    text: &str,
    marker: &UnavailableMarker,
    rule: &ExtractionRule,
) -> Result<Option<String>, PipelineError> {
    if let Some(sel) = &marker.selector {
        let sel = selector(sel, rule)?;
        if let Some(el) = doc.select(&sel).next() {
            let raw = element_text(el);
            return Ok(Some(if raw.is_empty() { "unavailable".to_string() } else { raw }));
        }
    }
    let lower = text.to_lowercase();
    Ok(marker
        .text
        .iter()
        .map(|t| t.trim())
        .find(|t| !t.is_empty() && lower.contains(&t.to_lowercase()))
        .map(str::to_string))
}

fn parse_error(rule: &ExtractionRule, kind: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::extraction(
        FailureKind::ParseError,
        format!("rule {}, {kind} strategy: {err}", rule.name),
    )
}

fn text_candidate(raw: String, rule: &ExtractionRule, kind: &str) -> Result<Candidate, PipelineError> {
    let amount = parse_price(&raw, rule.locale, rule.scale).map_err(|e| parse_error(rule, kind, e))?;
    let currency = detect_currency(&raw).map(str::to_string);
    Ok(Candidate {
        raw,
        amount,
        currency,
    })
}

fn css_candidates(
    doc: &Html,
    selectors: &[String],
    attribute: Option<&str>,
    rule: &ExtractionRule,
) -> Result<Found, PipelineError> {
    for sel in selectors {
        let parsed = selector(sel, rule)?;
        let raws: Vec<String> = doc
            .select(&parsed)
            .filter_map(|el| match attribute {
                Some(attr) => el.value().attr(attr).map(collapse),
                None => Some(element_text(el)),
            })
            .filter(|raw| !raw.is_empty())
            .collect();
        if raws.is_empty() {
            continue;
        }
        let candidates = raws
            .into_iter()
            .map(|raw| text_candidate(raw, rule, "css"))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Found::Candidates(candidates));
    }
    Ok(Found::Nothing)
}

fn regex_candidates(text: &str, pattern: &str, rule: &ExtractionRule) -> Result<Found, PipelineError> {
    let re = regex::Regex::new(pattern).map_err(|e| {
        PipelineError::extraction(
            FailureKind::InvalidRule,
            format!("rule {}: invalid pattern: {e}", rule.name),
        )
    })?;
    let mut candidates = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(group) = caps.name("price").or_else(|| caps.get(1)) else {
            continue;
        };
        let mut candidate = text_candidate(group.as_str().to_string(), rule, "regex")?;
        if candidate.currency.is_none() {
            candidate.currency = caps.get(0).and_then(|m| detect_currency(m.as_str())).map(str::to_string);
        }
        candidates.push(candidate);
    }
    Ok(if candidates.is_empty() {
        Found::Nothing
    } else {
        Found::Candidates(candidates)
    })
}

fn structured_candidate(value: &Value, rule: &ExtractionRule, kind: &str) -> Result<Option<Candidate>, PipelineError> {
    let Some(raw) = json::scalar_text(value) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let amount = match parse_canonical(&raw, rule.scale) {
        Ok(amount) => amount,
        // Some shops embed display strings ("1 299 ₽") in their state.
        Err(_) => parse_price(&raw, rule.locale, rule.scale).map_err(|e| parse_error(rule, kind, e))?,
    };
    Ok(Some(Candidate {
        currency: detect_currency(&raw).map(str::to_string),
        raw,
        amount,
    }))
}

const VARIANT_FIELDS: &[&str] = &["sku", "name", "id", "@id", "mpn", "gtin"];

/// Whether a JSON offer or variant entry is the one `key` names.
fn variant_matches(entry: &Value, key: &str) -> bool {
    let key = key.trim();
    let field = |name: &str| entry.get(name).and_then(json::scalar_text);
    if VARIANT_FIELDS
        .iter()
        .filter_map(|name| field(name))
        .any(|value| value.trim() == key)
    {
        return true;
    }
    // Composite "name|id" keys.
    let joined: Vec<String> = ["name", "id"]
        .iter()
        .filter_map(|name| field(name))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    joined.len() > 1 && joined.join("|") == key
}

/// Entry of a variant collection: an array of entries or a map keyed by
/// variant name.
fn find_variant<'a>(collection: &'a Value, key: &str) -> Option<&'a Value> {
    match collection {
        Value::Array(items) => items.iter().find(|item| variant_matches(item, key)),
        Value::Object(map) => map
            .get(key.trim())
            .or_else(|| map.values().find(|item| variant_matches(item, key))),
        _ => None,
    }
}

fn json_script_candidates(
    doc: &Html,
    contains: &str,
    paths: &[String],
    variants: &[String],
    rule: &ExtractionRule,
) -> Result<Found, PipelineError> {
    let scripts = selector("script", rule)?;
    let mut candidates = Vec::new();
    for script in doc.select(&scripts) {
        let body: String = script.text().collect();
        if !body.contains(contains) {
            continue;
        }
        for object in json::json_objects(&body) {
            let root = match (&rule.variant, variants.is_empty()) {
                (Some(key), false) => {
                    let entry = variants
                        .iter()
                        .filter_map(|path| json::lookup(&object, path))
                        .find_map(|collection| find_variant(collection, key));
                    match entry {
                        Some(entry) => entry,
                        None => continue,
                    }
                }
                _ => &object,
            };
            for path in paths {
                if let Some(value) = json::lookup(root, path) {
                    if let Some(candidate) = structured_candidate(value, rule, "json_script")? {
                        candidates.push(candidate);
                        break;
                    }
                }
            }
        }
    }
    Ok(if candidates.is_empty() {
        Found::Nothing
    } else {
        Found::Candidates(candidates)
    })
}

fn is_product(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => t == "Product" || t.ends_with("/Product"),
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("Product")),
        _ => false,
    }
}

fn collect_products<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_products(v, out)),
        Value::Object(map) => {
            if is_product(value) {
                out.push(value);
            }
            if let Some(graph) = map.get("@graph") {
                collect_products(graph, out);
            }
            // schema.org ProductGroup lists each variant as a Product.
            if let Some(variants) = map.get("hasVariant") {
                collect_products(variants, out);
            }
        }
        _ => {}
    }
}

fn json_ld_candidates(doc: &Html, rule: &ExtractionRule) -> Result<Found, PipelineError> {
    let scripts = selector(r#"script[type="application/ld+json"]"#, rule)?;
    let mut candidates = Vec::new();
    let mut sold_out: Option<String> = None;

    for script in doc.select(&scripts) {
        let body: String = script.text().collect();
        let Ok(value) = serde_json::from_str::<Value>(body.trim()) else {
            continue;
        };
        let mut products = Vec::new();
        collect_products(&value, &mut products);

        for product in products {
            let offers: Vec<&Value> = match product.get("offers") {
                Some(Value::Array(items)) => items.iter().collect(),
                Some(offer @ Value::Object(_)) => vec![offer],
                _ => continue,
            };
            let variant = rule.variant.as_deref();
            let whole_product = variant.map_or(true, |key| variant_matches(product, key));
            for offer in offers {
                if !whole_product && !variant.is_some_and(|key| variant_matches(offer, key)) {
                    continue;
                }
                let availability = offer.get("availability").and_then(Value::as_str).unwrap_or("");
                if ["OutOfStock", "SoldOut", "Discontinued"]
                    .iter()
                    .any(|m| availability.ends_with(m))
                {
                    sold_out.get_or_insert_with(|| availability.to_string());
                    continue;
                }
                let price = offer.get("price").or_else(|| offer.get("lowPrice"));
                let Some(price) = price else {
                    continue;
                };
                if let Some(mut candidate) = structured_candidate(price, rule, "json_ld")? {
                    if let Some(code) = offer.get("priceCurrency").and_then(Value::as_str) {
                        candidate.currency = Some(code.to_ascii_uppercase());
                    }
                    candidates.push(candidate);
                }
            }
        }
    }

    Ok(match (candidates.is_empty(), sold_out) {
        (false, _) => Found::Candidates(candidates),
        (true, Some(availability)) => Found::Unavailable(availability),
        (true, None) => Found::Nothing,
    })
}

fn pick(candidates: Vec<Candidate>, rule: &ExtractionRule) -> Result<(Price, String), PipelineError> {
    let priced: Vec<(Price, String)> = candidates
        .into_iter()
        .map(|c| {
            let currency = match (&c.currency, rule.detect_currency) {
                (Some(code), true) => code.clone(),
                _ => rule.currency.clone(),
            };
            (Price::new(c.amount, currency), c.raw)
        })
        .collect();

    let chosen = match rule.pick {
        PickPolicy::First => priced.into_iter().next(),
        PickPolicy::Lowest => priced.into_iter().min_by(|a, b| a.0.amount.cmp(&b.0.amount)),
        PickPolicy::Highest => priced.into_iter().max_by(|a, b| a.0.amount.cmp(&b.0.amount)),
        PickPolicy::Unique => {
            let mut distinct: Vec<&Price> = Vec::new();
            for (price, _) in &priced {
                if !distinct.contains(&price) {
                    distinct.push(price);
                }
            }
            if distinct.len() > 1 {
                let listed: Vec<String> = distinct.iter().map(|p| p.to_string()).collect();
                return Err(PipelineError::extraction(
                    FailureKind::AmbiguousMatch,
                    format!("rule {}: {} distinct prices: {}", rule.name, listed.len(), listed.join(", ")),
                ));
            }
            priced.into_iter().next()
        }
    };

    chosen.ok_or_else(|| {
        PipelineError::extraction(
            FailureKind::SelectorNotFound,
            format!("rule {}: no candidates", rule.name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_micros;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn page(html: &str) -> RawPage {
        RawPage {
            url: "https://shop.test/p".into(),
            final_url: "https://shop.test/p".into(),
            status: Some(200),
            html: html.into(),
            latency: Duration::from_millis(5),
            fetched_at: now_micros(),
        }
    }

    #[test]
    fn test_css_with_locale() {
        let rule = ExtractionRule::css("de", ".price", "EUR").with_locale(PriceLocale::De);
        let reading = extract(
            &page("<h1> Akku  Bohrer </h1><span class='price'>1.234,56 €</span>"),
            &rule,
        )
        .unwrap();
        assert_eq!(reading.price, Some(Price::new(dec!(1234.56), "EUR")));
        assert_eq!(reading.title.as_deref(), Some("Akku Bohrer"));
        assert_eq!(reading.raw_text, "1.234,56 €");
        assert_eq!(reading.matched_by, "css");
    }

    #[test]
    fn test_ambiguous_and_pick_policies() {
        let html = "<span class=price>10.00</span><span class=price>12.00</span>";
        let rule = ExtractionRule::css("r", ".price", "USD");
        let err = extract(&page(html), &rule).unwrap_err();
        assert_eq!(err.kind(), FailureKind::AmbiguousMatch);

        let low = extract(&page(html), &rule.clone().with_pick(PickPolicy::Lowest)).unwrap();
        assert_eq!(low.price.unwrap().amount, dec!(10.00));
        let high = extract(&page(html), &rule.with_pick(PickPolicy::Highest)).unwrap();
        assert_eq!(high.price.unwrap().amount, dec!(12.00));

        // Repeated identical values are not ambiguous.
        let same = "<span class=price>10.00</span><span class=price>10.0</span>";
        let rule = ExtractionRule::css("r", ".price", "USD");
        assert!(extract(&page(same), &rule).is_ok());
    }

    #[test]
    fn test_missing_and_unparseable() {
        let rule = ExtractionRule::css("r", ".price", "USD");
        let err = extract(&page("<p>nothing</p>"), &rule).unwrap_err();
        assert_eq!(err.kind(), FailureKind::SelectorNotFound);

        let err = extract(&page("<span class=price>call us</span>"), &rule).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ParseError);

        let bad = ExtractionRule::css("r", "div[", "USD");
        let err = extract(&page("<p></p>"), &bad).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidRule);
    }

    #[test]
    fn test_unavailable_marker_wins() {
        let rule = ExtractionRule::css("r", ".price", "RUB")
            .with_locale(PriceLocale::Ru)
            .with_unavailable(UnavailableMarker {
                selector: None,
                text: vec!["Нет в наличии".into()],
            });
        let reading = extract(
            &page("<span class=price>1 990 ₽</span><div>нет в наличии</div>"),
            &rule,
        )
        .unwrap();
        assert!(reading.price.is_none());
        assert_eq!(reading.matched_by, "unavailable");
    }

    #[test]
    fn test_fallback_strategy_order() {
        let rule = ExtractionRule::css("r", ".missing", "USD").with_strategy(Strategy::Regex {
            pattern: r"Total:\s*(?P<price>[\d,.]+)".into(),
        });
        let html = "<script>var t = 'Total: 1.00';</script><p>Total: 1,499.90</p>";
        let reading = extract(&page(html), &rule).unwrap();
        assert_eq!(reading.price.unwrap().amount, dec!(1499.90));
        assert_eq!(reading.matched_by, "regex");
    }

    #[test]
    fn test_json_script_strategy() {
        let rule = ExtractionRule {
            strategies: vec![Strategy::JsonScript {
                contains: "productCard".into(),
                paths: vec!["productCard.price.current".into(), "product.price".into()],
                variants: vec![],
            }],
            ..ExtractionRule::css("p", ".x", "RUB")
        };
        let html = r#"<script>window.__INITIAL__ = {"productCard": {"sku": "7", "price": {"current": 2200.5}}};</script>"#;
        let reading = extract(&page(html), &rule).unwrap();
        assert_eq!(reading.price, Some(Price::new(dec!(2200.50), "RUB")));
    }

    #[test]
    fn test_json_ld_offers_and_availability() {
        let rule = ExtractionRule {
            strategies: vec![Strategy::JsonLd {}],
            detect_currency: true,
            ..ExtractionRule::css("ld", ".x", "USD")
        };
        let html = r#"<script type="application/ld+json">
            {"@context": "https://schema.org", "@graph": [
                {"@type": "BreadcrumbList"},
                {"@type": "Product", "name": "Saw",
                 "offers": {"@type": "Offer", "price": "89.90", "priceCurrency": "eur",
                            "availability": "https://schema.org/InStock"}}
            ]}</script>"#;
        let reading = extract(&page(html), &rule).unwrap();
        assert_eq!(reading.price, Some(Price::new(dec!(89.90), "EUR")));

        let sold_out = r#"<script type="application/ld+json">
            {"@type": "Product", "offers": [{"price": "5", "availability": "http://schema.org/OutOfStock"}]}
            </script>"#;
        let reading = extract(&page(sold_out), &rule).unwrap();
        assert!(reading.price.is_none());
        assert_eq!(reading.matched_by, "json_ld");
    }

    #[test]
    fn test_json_script_variant_selection() {
        let rule = ExtractionRule {
            strategies: vec![Strategy::JsonScript {
                contains: "variants".into(),
                paths: vec!["price".into(), "priceValue".into()],
                variants: vec!["product.variants".into(), "variants".into()],
            }],
            ..ExtractionRule::css("mk", ".x", "RUB").with_locale(PriceLocale::Ru)
        };
        let listed = r#"<script>window.__STATE__ = {"product": {"title": "Filament", "variants": [
            {"name": "Red", "id": 11, "sku": "PLA-R", "price": 1490},
            {"name": "Black", "id": 12, "sku": "PLA-B", "priceValue": "1 390 ₽"}
        ]}};</script>"#;

        for key in ["Black", "PLA-B", "12", "Black|12"] {
            let reading = extract(&page(listed), &rule.clone().with_variant(Some(key.into()))).unwrap();
            assert_eq!(reading.price.unwrap().amount, dec!(1390), "{key}");
        }
        let red = extract(&page(listed), &rule.clone().with_variant(Some("Red".into()))).unwrap();
        assert_eq!(red.price.unwrap().amount, dec!(1490));

        // A map keyed by variant name.
        let keyed = r#"<script>var data = {"variants": {"0.4 mm": {"price": "250.00"}, "0.6 mm": {"price": "270.00"}}};</script>"#;
        let reading = extract(&page(keyed), &rule.clone().with_variant(Some("0.6 mm".into()))).unwrap();
        assert_eq!(reading.price.unwrap().amount, dec!(270.00));

        // An unknown variant is not replaced by another one.
        let err = extract(&page(listed), &rule.with_variant(Some("Green".into()))).unwrap_err();
        assert_eq!(err.kind(), FailureKind::SelectorNotFound);
        assert!(err.to_string().contains("Green"));
    }

    #[test]
    fn test_json_ld_variant_selection() {
        let rule = ExtractionRule {
            strategies: vec![Strategy::JsonLd {}],
            ..ExtractionRule::css("ld", ".x", "RUB")
        };
        let offers = r#"<script type="application/ld+json">
            {"@type": "Product", "name": "Scanner", "offers": [
                {"@type": "Offer", "sku": "SC-1", "name": "Basic", "price": "45000"},
                {"@type": "Offer", "sku": "SC-2", "name": "Pro", "price": "61000"},
                {"@type": "Offer", "sku": "SC-3", "name": "Max", "price": "80000",
                 "availability": "https://schema.org/OutOfStock"}
            ]}</script>"#;
        // Without a variant the two offers disagree.
        let err = extract(&page(offers), &rule).unwrap_err();
        assert_eq!(err.kind(), FailureKind::AmbiguousMatch);

        let basic = extract(&page(offers), &rule.clone().with_variant(Some("SC-1".into()))).unwrap();
        assert_eq!(basic.price.unwrap().amount, dec!(45000));
        let pro = extract(&page(offers), &rule.clone().with_variant(Some("Pro".into()))).unwrap();
        assert_eq!(pro.price.unwrap().amount, dec!(61000));
        let max = extract(&page(offers), &rule.clone().with_variant(Some("SC-3".into()))).unwrap();
        assert!(max.price.is_none());

        let group = r#"<script type="application/ld+json">
            {"@type": "ProductGroup", "name": "Nozzle", "hasVariant": [
                {"@type": "Product", "sku": "N-04", "offers": {"price": "250"}},
                {"@type": "Product", "sku": "N-06", "offers": {"price": "270"}}
            ]}</script>"#;
        let reading = extract(&page(group), &rule.with_variant(Some("N-06".into()))).unwrap();
        assert_eq!(reading.price.unwrap().amount, dec!(270));
    }

    #[test]
    fn test_visible_text_skips_scripts() {
        let text = visible_text("<html><head><title>T</title></head><body><p>a</p><script>b()</script><p>c</p></body></html>");
        assert_eq!(text, "a c");
    }
}
