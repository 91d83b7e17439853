// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Derive own prices from competitor prices.
//!
//! Each target may carry [`RepricingRule`]s, one per price type. Rules run
//! in `(priority, price_type)` order and a later rule for the same price type
//! replaces the earlier result. Results are rounded half-up to cents.
//!
//! [`Repricer`] applies them to every priced [`MonitorEvent::PriceChanged`]
//! and announces a [`MonitorEvent::RepriceProposed`]. Writing the proposal
//! to a shop or ERP is left to whoever subscribes.

use crate::events::{AlertSink, MonitorEvent};
use crate::extract::locale::round_price;
use crate::model::{ChangeEvent, Classification};
use crate::targets::Catalog;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::warn;

const PRICE_SCALE: u32 = 2;

/// How a rule turns the competitor price into an own price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepriceKind {
    /// `price * (1 + value / 100)`
    PercentMarkup,
    /// `max(price - value, 0)`
    MinusFixed,
    /// The competitor price as is.
    Equal,
}

/// One pricing rule for one price type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepricingRule {
    pub kind: RepriceKind,
    #[serde(default)]
    pub value: Decimal,
    pub price_type: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    10
}

impl RepricingRule {
    pub fn new(kind: RepriceKind, value: Decimal, price_type: impl Into<String>) -> Self {
        Self {
            kind,
            value,
            price_type: price_type.into(),
            priority: default_priority(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.price_type.trim().is_empty() {
            return Err("repricing rule has an empty price type".to_string());
        }
        if self.value < Decimal::ZERO {
            return Err(format!("{}: negative value {}", self.price_type, self.value));
        }
        Ok(())
    }

    /// Unrounded result, `None` on overflow.
    fn apply(&self, price: Decimal) -> Option<Decimal> {
        match self.kind {
            RepriceKind::PercentMarkup => {
                let factor = Decimal::ONE.checked_add(self.value.checked_div(Decimal::ONE_HUNDRED)?)?;
                price.checked_mul(factor)
            }
            RepriceKind::MinusFixed => Some(price.checked_sub(self.value)?.max(Decimal::ZERO)),
            RepriceKind::Equal => Some(price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepriceError {
    #[error("{price_type}: {kind:?} {value} on {price} is out of range")]
    Overflow {
        price_type: String,
        kind: RepriceKind,
        value: Decimal,
        price: Decimal,
    },
}

/// Own price per price type for a competitor `price`.
///
/// Without rules every `fallback_price_types` entry gets the rounded
/// competitor price.
pub fn apply_rules(
    price: Decimal,
    rules: &[RepricingRule],
    fallback_price_types: &[String],
) -> Result<BTreeMap<String, Decimal>, RepriceError> {
    let mut ordered: Vec<&RepricingRule> = rules.iter().collect();
    ordered.sort_by(|a, b| (a.priority, &a.price_type).cmp(&(b.priority, &b.price_type)));

    let mut prices = BTreeMap::new();
    for rule in ordered {
        let value = rule.apply(price).ok_or_else(|| RepriceError::Overflow {
            price_type: rule.price_type.clone(),
            kind: rule.kind,
            value: rule.value,
            price,
        })?;
        prices.insert(rule.price_type.clone(), round_price(value, PRICE_SCALE));
    }

    if prices.is_empty() {
        let rounded = round_price(price, PRICE_SCALE);
        for price_type in fallback_price_types {
            prices.insert(price_type.clone(), rounded);
        }
    }
    Ok(prices)
}

#[derive(Debug, Default)]
struct Plans {
    rules: HashMap<String, Vec<RepricingRule>>,
    fallback_price_types: Vec<String>,
}

/// Alert sink that adds a repricing proposal after each priced change.
pub struct Repricer {
    plans: RwLock<Plans>,
    inner: Arc<dyn AlertSink>,
}

impl Repricer {
    pub fn new(catalog: &Catalog, inner: Arc<dyn AlertSink>) -> Self {
        let repricer = Self {
            plans: RwLock::new(Plans::default()),
            inner,
        };
        repricer.update(catalog);
        repricer
    }

    /// Take rules from a (re)loaded catalog.
    pub fn update(&self, catalog: &Catalog) {
        let plans = Plans {
            rules: catalog
                .targets
                .iter()
                .map(|t| (t.id.clone(), t.repricing.clone()))
                .collect(),
            fallback_price_types: catalog.price_types.clone(),
        };
        match self.plans.write() {
            Ok(mut current) => *current = plans,
            Err(poisoned) => *poisoned.into_inner() = plans,
        }
    }

    /// Proposal for `change`, if it carries a price and the target is repriced.
    pub fn propose(&self, change: &ChangeEvent) -> Option<MonitorEvent> {
        if change.classification == Classification::Unavailable {
            return None;
        }
        let competitor = change.current_price.clone()?;
        let plans = match self.plans.read() {
            Ok(plans) => plans,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rules = plans
            .rules
            .get(&change.target_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        match apply_rules(competitor.amount, rules, &plans.fallback_price_types) {
            Ok(prices) if prices.is_empty() => None,
            Ok(prices) => Some(MonitorEvent::RepriceProposed {
                target_id: change.target_id.clone(),
                competitor_price: competitor,
                prices,
            }),
            Err(e) => {
                warn!("{}: repricing skipped: {e}", change.target_id);
                None
            }
        }
    }
}

impl AlertSink for Repricer {
    fn alert(&self, event: MonitorEvent) {
        let proposal = match &event {
            MonitorEvent::PriceChanged { change, .. } => self.propose(change),
            _ => None,
        };
        self.inner.alert(event);
        if let Some(proposal) = proposal {
            self.inner.alert(proposal);
        }
    }
}
