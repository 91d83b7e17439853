// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Change detection between consecutive observations.

use crate::error::{FailureKind, PipelineError};
use crate::model::{now_micros, ChangeEvent, Classification, Observation, PriceDelta};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Smallest price movement that counts as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum NoiseThreshold {
    /// `|delta| / previous <= ratio` is noise. `0.005` means half a percent.
    Ratio(Decimal),
    /// `|delta| <= amount` is noise, in currency units.
    Absolute(Decimal),
}

impl Default for NoiseThreshold {
    fn default() -> Self {
        Self::Ratio(Decimal::ZERO)
    }
}

impl NoiseThreshold {
    /// Whether moving from `previous` by `delta` stays within the threshold.
    pub fn is_noise(&self, previous: Decimal, delta: Decimal) -> bool {
        let magnitude = delta.abs();
        if magnitude.is_zero() {
            return true;
        }
        match self {
            Self::Absolute(limit) => magnitude <= *limit,
            // Any move away from zero is a change.
            Self::Ratio(_) if previous.is_zero() => false,
            // A ratio too large to represent is far past any limit.
            Self::Ratio(limit) => magnitude
                .checked_div(previous.abs())
                .is_some_and(|ratio| ratio <= *limit),
        }
    }
}

/// Default threshold with per-currency overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoisePolicy {
    #[serde(default)]
    pub default: NoiseThreshold,
    #[serde(default)]
    pub per_currency: HashMap<String, NoiseThreshold>,
}

impl NoisePolicy {
    pub fn threshold_for(&self, currency: &str) -> NoiseThreshold {
        self.per_currency
            .get(&currency.to_ascii_uppercase())
            .copied()
            .unwrap_or(self.default)
    }
}

/// Classify `current` against the previous observation of the same target.
///
/// Returns `Ok(None)` when nothing meaningful changed.
pub fn classify(
    previous: Option<&Observation>,
    current: &Observation,
    noise: &NoisePolicy,
) -> Result<Option<ChangeEvent>, PipelineError> {
    let Some(prev) = previous else {
        return Ok(Some(event(None, current, Classification::Initial, None)));
    };

    if current.observed_at <= prev.observed_at {
        return Err(PipelineError::integrity(
            FailureKind::OutOfOrder,
            format!(
                "{}: observation at {} is not after {}",
                current.target_id, current.observed_at, prev.observed_at
            ),
        ));
    }

    let classification = match (&prev.price, &current.price) {
        (None, None) => None,
        (Some(_), None) => Some((Classification::Unavailable, None)),
        (None, Some(_)) => Some((Classification::Restored, None)),
        (Some(before), Some(after)) => {
            if before.currency != after.currency {
                return Err(PipelineError::integrity(
                    FailureKind::CurrencyMismatch,
                    format!("{}: {} became {}", current.target_id, before, after),
                ));
            }
            let out_of_range = || {
                PipelineError::extraction(
                    FailureKind::ParseError,
                    format!("{}: change from {} to {} is out of range", current.target_id, before, after),
                )
            };
            let delta = after.amount.checked_sub(before.amount).ok_or_else(out_of_range)?;
            if noise.threshold_for(&after.currency).is_noise(before.amount, delta) {
                None
            } else {
                let percent = if before.amount.is_zero() {
                    None
                } else {
                    let ratio = delta
                        .checked_div(before.amount)
                        .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
                        .ok_or_else(out_of_range)?;
                    Some(ratio.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
                };
                let class = if delta.is_sign_positive() {
                    Classification::Increase
                } else {
                    Classification::Decrease
                };
                Some((
                    class,
                    Some(PriceDelta {
                        absolute: delta,
                        percent,
                    }),
                ))
            }
        }
    };

    match classification {
        Some((class, delta)) => Ok(Some(event(Some(prev), current, class, delta))),
        None => {
            debug!("{}: no change ({})", current.target_id, Classification::NoOp);
            Ok(None)
        }
    }
}

fn event(
    prev: Option<&Observation>,
    current: &Observation,
    classification: Classification,
    delta: Option<PriceDelta>,
) -> ChangeEvent {
    ChangeEvent {
        target_id: current.target_id.clone(),
        previous: prev.map(Observation::key),
        current: current.key(),
        classification,
        delta,
        previous_price: prev.and_then(|p| p.price.clone()),
        current_price: current.price.clone(),
        detected_at: now_micros(),
    }
}
