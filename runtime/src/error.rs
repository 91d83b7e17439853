// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the monitoring pipeline.
//!
//! Every stage returns a [`PipelineError`] rather than panicking. The error's
//! [`ErrorClass`] is what the monitoring loop uses to decide between retry,
//! suspension and escalation; the [`FailureKind`] is the fine-grained reason
//! recorded in failure history and alerts.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fine-grained failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum FailureKind {
    // ── Fetch ──
    Timeout,
    Network,
    HttpStatus(u16),
    NavigationAborted,
    AntiBot,
    BrowserCrash,
    PoolExhausted,
    // ── Extraction ──
    SelectorNotFound,
    ParseError,
    AmbiguousMatch,
    InvalidRule,
    // ── Data integrity ──
    CurrencyMismatch,
    OutOfOrder,
    ConflictingDuplicate,
    // ── Resources ──
    BrowserUnavailable,
    StoreUnavailable,
}

impl FailureKind {
    /// Stable short name, used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::HttpStatus(_) => "http_status",
            Self::NavigationAborted => "navigation_aborted",
            Self::AntiBot => "anti_bot",
            Self::BrowserCrash => "browser_crash",
            Self::PoolExhausted => "pool_exhausted",
            Self::SelectorNotFound => "selector_not_found",
            Self::ParseError => "parse_error",
            Self::AmbiguousMatch => "ambiguous_match",
            Self::InvalidRule => "invalid_rule",
            Self::CurrencyMismatch => "currency_mismatch",
            Self::OutOfOrder => "out_of_order",
            Self::ConflictingDuplicate => "conflicting_duplicate",
            Self::BrowserUnavailable => "browser_unavailable",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    /// Inverse of the storage encoding (`as_str` plus optional status).
    pub fn from_parts(name: &str, status: Option<u16>) -> Option<Self> {
        let kind = match name {
            "timeout" => Self::Timeout,
            "network" => Self::Network,
            "http_status" => Self::HttpStatus(status.unwrap_or(0)),
            "navigation_aborted" => Self::NavigationAborted,
            "anti_bot" => Self::AntiBot,
            "browser_crash" => Self::BrowserCrash,
            "pool_exhausted" => Self::PoolExhausted,
            "selector_not_found" => Self::SelectorNotFound,
            "parse_error" => Self::ParseError,
            "ambiguous_match" => Self::AmbiguousMatch,
            "invalid_rule" => Self::InvalidRule,
            "currency_mismatch" => Self::CurrencyMismatch,
            "out_of_order" => Self::OutOfOrder,
            "conflicting_duplicate" => Self::ConflictingDuplicate,
            "browser_unavailable" => Self::BrowserUnavailable,
            "store_unavailable" => Self::StoreUnavailable,
            _ => return None,
        };
        Some(kind)
    }

    /// HTTP status carried by the kind, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStatus(code) => write!(f, "http_status({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Coarse class that drives the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retryable with backoff.
    TransientFetch,
    /// Retryable a bounded number of times, then escalated as a stale rule.
    Extraction,
    /// Never retried automatically.
    DataIntegrity,
    /// Halts the affected targets until the resource recovers.
    FatalResource,
}

/// Typed failure returned by every pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("transient fetch failure ({kind}): {detail}")]
    TransientFetch { kind: FailureKind, detail: String },

    #[error("extraction failed ({kind}): {detail}")]
    Extraction { kind: FailureKind, detail: String },

    #[error("data integrity violation ({kind}): {detail}")]
    DataIntegrity { kind: FailureKind, detail: String },

    #[error("fatal resource failure ({kind}): {detail}")]
    FatalResource { kind: FailureKind, detail: String },
}

impl PipelineError {
    pub fn fetch(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::TransientFetch {
            kind,
            detail: detail.into(),
        }
    }

    pub fn extraction(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Extraction {
            kind,
            detail: detail.into(),
        }
    }

    pub fn integrity(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::DataIntegrity {
            kind,
            detail: detail.into(),
        }
    }

    pub fn fatal(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::FatalResource {
            kind,
            detail: detail.into(),
        }
    }

    /// Shorthand for a store failure, which is always fatal for the cycle.
    pub fn store(err: impl fmt::Display) -> Self {
        Self::fatal(FailureKind::StoreUnavailable, err.to_string())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientFetch { .. } => ErrorClass::TransientFetch,
            Self::Extraction { .. } => ErrorClass::Extraction,
            Self::DataIntegrity { .. } => ErrorClass::DataIntegrity,
            Self::FatalResource { .. } => ErrorClass::FatalResource,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::TransientFetch { kind, .. }
            | Self::Extraction { kind, .. }
            | Self::DataIntegrity { kind, .. }
            | Self::FatalResource { kind, .. } => *kind,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::TransientFetch { detail, .. }
            | Self::Extraction { detail, .. }
            | Self::DataIntegrity { detail, .. }
            | Self::FatalResource { detail, .. } => detail,
        }
    }
}
