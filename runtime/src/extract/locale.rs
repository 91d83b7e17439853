// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Exact, locale-aware price parsing.
//!
//! Each locale has exactly one decimal separator and a fixed set of grouping
//! separators. Grouping is only accepted in runs of exactly three digits, so
//! `"12.5"` is rejected under `de` rather than silently read as 125.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

const SPACES: &[char] = &[' ', '\u{00A0}', '\u{202F}', '\u{2009}', '\u{2007}'];

/// Number formatting conventions of a shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceLocale {
    /// `1,234.56`
    #[default]
    En,
    /// `1.234,56`
    De,
    /// `1 234,56`
    Fr,
    /// `1 234,56`
    Ru,
    /// `1'234.56`
    Ch,
}

impl PriceLocale {
    pub fn decimal_separator(self) -> char {
        match self {
            Self::En | Self::Ch => '.',
            Self::De | Self::Fr | Self::Ru => ',',
        }
    }

    fn is_group_separator(self, c: char) -> bool {
        match self {
            Self::En => c == ',',
            Self::De => c == '.',
            Self::Fr | Self::Ru => SPACES.contains(&c),
            Self::Ch => c == '\'' || c == '\u{2019}',
        }
    }

    fn is_number_char(self, c: char) -> bool {
        c.is_ascii_digit() || c == self.decimal_separator() || self.is_group_separator(c)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceParseError {
    #[error("no digits in {0:?}")]
    NoDigits(String),
    #[error("{text:?} is not a valid number: {reason}")]
    Malformed { text: String, reason: &'static str },
    #[error("{0:?} is out of range")]
    Overflow(String),
}

/// Parse the first number in `text` under `locale`, rounded half-up to `scale`.
pub fn parse_price(text: &str, locale: PriceLocale, scale: u32) -> Result<Decimal, PriceParseError> {
    let (token, rest) =
        number_token(text, locale).ok_or_else(|| PriceParseError::NoDigits(text.to_string()))?;
    let malformed = |reason| PriceParseError::Malformed {
        text: token.to_string(),
        reason,
    };
    if continues_number(rest) {
        // "1 234,56" under de stops at "1"; reading 1 would be silently wrong.
        return Err(malformed("digits continue after a separator of another locale"));
    }

    let sep = locale.decimal_separator();
    let mut parts = token.splitn(3, sep);
    let int_part = parts.next().unwrap_or_default();
    let frac_part = parts.next();
    if parts.next().is_some() {
        return Err(malformed("more than one decimal separator"));
    }

    let mut groups: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut after_separator = false;
    for c in int_part.chars() {
        if c.is_ascii_digit() {
            current.push(c);
            after_separator = false;
        } else if after_separator && SPACES.contains(&c) {
            // "2\u{A0}\u{202F}200": adjacent spaces form one separator.
            continue;
        } else {
            groups.push(std::mem::take(&mut current));
            after_separator = true;
        }
    }
    groups.push(current);

    if groups.iter().any(|g| g.is_empty()) {
        return Err(malformed("empty digit group"));
    }
    if groups.len() > 1 {
        if groups[0].len() > 3 {
            return Err(malformed("leading group longer than three digits"));
        }
        if groups[1..].iter().any(|g| g.len() != 3) {
            return Err(malformed("digit groups must have three digits"));
        }
    }
    let integer: String = groups.concat();

    let canonical = match frac_part {
        Some(frac) if frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) => {
            return Err(malformed("invalid fraction"));
        }
        Some(frac) => format!("{integer}.{frac}"),
        None => integer,
    };

    let value = Decimal::from_str(&canonical).map_err(|_| PriceParseError::Overflow(token.to_string()))?;
    Ok(round_price(value, scale))
}

/// Parse a value from structured data: point decimal, no grouping.
pub fn parse_canonical(text: &str, scale: u32) -> Result<Decimal, PriceParseError> {
    let trimmed = text.trim();
    if !trimmed.chars().any(|c| c.is_ascii_digit()) {
        return Err(PriceParseError::NoDigits(text.to_string()));
    }
    let value = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| PriceParseError::Malformed {
            text: trimmed.to_string(),
            reason: "not a canonical decimal",
        })?;
    if value.is_sign_negative() {
        return Err(PriceParseError::Malformed {
            text: trimmed.to_string(),
            reason: "negative price",
        });
    }
    Ok(round_price(value, scale))
}

/// Half-up rounding to `scale` decimal places.
pub fn round_price(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// First run of number characters that starts with a digit, without
/// trailing separators, and the text that follows it.
fn number_token(text: &str, locale: PriceLocale) -> Option<(&str, &str)> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let tail = &text[start..];
    let run_len = tail
        .char_indices()
        .find(|&(_, c)| !locale.is_number_char(c))
        .map_or(tail.len(), |(i, _)| i);
    let token = tail[..run_len].trim_end_matches(|c: char| !c.is_ascii_digit());
    Some((token, &tail[token.len()..]))
}

/// True when `rest` is a separator of some locale directly followed by more
/// digits, i.e. the number was cut short by the wrong locale.
fn continues_number(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if SPACES.contains(&c) => chars
            .find(|c| !SPACES.contains(c))
            .is_some_and(|c| c.is_ascii_digit()),
        Some(',' | '.' | '\'' | '\u{2019}') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Guess the ISO currency code from symbols or codes in `text`.
pub fn detect_currency(text: &str) -> Option<&'static str> {
    const SYMBOLS: &[(&str, &str)] = &[
        ("€", "EUR"),
        ("£", "GBP"),
        ("₽", "RUB"),
        ("руб", "RUB"),
        ("₴", "UAH"),
        ("zł", "PLN"),
        ("¥", "JPY"),
        ("₹", "INR"),
        ("$", "USD"),
    ];
    const CODES: &[&str] = &[
        "EUR", "USD", "GBP", "RUB", "CHF", "UAH", "PLN", "CZK", "SEK", "NOK", "DKK", "JPY", "CNY",
        "INR", "CAD", "AUD", "KZT", "BYN",
    ];

    let upper = text.to_uppercase();
    for code in CODES {
        let found = upper.match_indices(code).any(|(i, _)| {
            let before = upper[..i].chars().next_back();
            let after = upper[i + code.len()..].chars().next();
            !before.is_some_and(char::is_alphabetic) && !after.is_some_and(char::is_alphabetic)
        });
        if found {
            return Some(code);
        }
    }
    let lower = text.to_lowercase();
    SYMBOLS
        .iter()
        .find(|(symbol, _)| lower.contains(symbol))
        .map(|(_, code)| *code)
}
