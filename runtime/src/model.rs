// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core records: observations, change events and failure records.

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An exact price in a given currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub amount: Decimal,
    /// ISO 4217 code, upper case.
    pub currency: String,
}

impl Price {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Natural key of an observation: unique per target and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationKey {
    pub target_id: String,
    pub observed_at: DateTime<Utc>,
}

/// One successful read of a target page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub target_id: String,
    pub observed_at: DateTime<Utc>,
    /// `None` when the page reported the item as unavailable.
    pub price: Option<Price>,
    /// Text the price was read from, kept for audit.
    pub raw_text: String,
    pub title: Option<String>,
    pub fetch_latency_ms: u64,
}

impl Observation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            target_id: self.target_id.clone(),
            observed_at: self.observed_at,
        }
    }

    pub fn is_available(&self) -> bool {
        self.price.is_some()
    }

    /// Whether two observations carry the same reading (ignoring audit fields).
    pub fn same_reading(&self, other: &Observation) -> bool {
        self.target_id == other.target_id
            && self.observed_at == other.observed_at
            && self.price == other.price
    }
}

/// How a new observation relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Initial,
    Increase,
    Decrease,
    Unavailable,
    Restored,
    NoOp,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::Unavailable => "unavailable",
            Self::Restored => "restored",
            Self::NoOp => "no-op",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::Initial),
            "increase" => Some(Self::Increase),
            "decrease" => Some(Self::Decrease),
            "unavailable" => Some(Self::Unavailable),
            "restored" => Some(Self::Restored),
            "no-op" => Some(Self::NoOp),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price difference between two available observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceDelta {
    /// current - previous.
    pub absolute: Decimal,
    /// Relative change in percent, two decimal places. `None` when the
    /// previous price was zero.
    pub percent: Option<Decimal>,
}

/// A meaningful transition between two consecutive observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub target_id: String,
    pub previous: Option<ObservationKey>,
    pub current: ObservationKey,
    pub classification: Classification,
    pub delta: Option<PriceDelta>,
    pub previous_price: Option<Price>,
    pub current_price: Option<Price>,
    pub detected_at: DateTime<Utc>,
}

/// A failed attempt, recorded for backoff decisions and observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub target_id: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: FailureKind,
    pub detail: String,
    /// Consecutive failures including this one.
    pub retry_count: u32,
}

/// Current time truncated to the microsecond precision used in storage.
pub fn now_micros() -> DateTime<Utc> {
    truncate_micros(Utc::now())
}

/// Drop sub-microsecond precision so timestamps survive a storage round trip.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_currency_is_uppercased() {
        let p = Price::new(dec!(10.50), "eur");
        assert_eq!(p.currency, "EUR");
        assert_eq!(p.to_string(), "10.50 EUR");
    }

    #[test]
    fn test_classification_names() {
        for c in [
            Classification::Initial,
            Classification::Increase,
            Classification::Decrease,
            Classification::Unavailable,
            Classification::Restored,
            Classification::NoOp,
        ] {
            assert_eq!(Classification::parse(c.as_str()), Some(c));
        }
        let json = serde_json::to_string(&Classification::NoOp).unwrap();
        assert_eq!(json, "\"no-op\"");
    }

    #[test]
    fn test_truncate_micros_is_stable() {
        let ts = Utc::now();
        let t = truncate_micros(ts);
        assert_eq!(t.timestamp_micros(), ts.timestamp_micros());
        assert_eq!(truncate_micros(t), t);
    }
}
