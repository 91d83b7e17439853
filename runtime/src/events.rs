// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed alerts from the monitoring loop.
//!
//! The monitor reports through an [`AlertSink`]. [`EventBus`] is the stock
//! sink: a `tokio::sync::broadcast` channel any number of consumers can
//! subscribe to. When no subscribers exist, events are silently dropped.

use crate::error::FailureKind;
use crate::model::{ChangeEvent, Price};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Everything the monitor announces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    // ── Prices ────────────────────────────
    /// A change event was persisted.
    PriceChanged {
        url: String,
        label: Option<String>,
        change: ChangeEvent,
    },
    /// Own prices derived from a competitor price, keyed by price type.
    RepriceProposed {
        target_id: String,
        competitor_price: Price,
        prices: BTreeMap<String, Decimal>,
    },

    // ── Target health ─────────────────────
    /// A target stopped being scheduled.
    TargetSuspended {
        target_id: String,
        kind: FailureKind,
        reason: String,
        consecutive_failures: u32,
    },
    /// An operator reset a target.
    TargetReset { target_id: String },
    /// Stored data would have become inconsistent; nothing was written.
    DataIntegrity {
        target_id: String,
        kind: FailureKind,
        detail: String,
    },

    // ── Resources ─────────────────────────
    /// Browser or store unavailable. Reported once per outage.
    ResourceOutage { kind: FailureKind, detail: String },
    ResourceRecovered { kind: FailureKind },

    // ── Configuration ─────────────────────
    /// A catalog entry was skipped.
    ConfigRejected {
        section: String,
        index: usize,
        id: Option<String>,
        reason: String,
    },

    // ── System ────────────────────────────
    MonitorStarted {
        version: String,
        targets: usize,
        workers: usize,
    },
    MonitorStopped,
}

impl MonitorEvent {
    /// Target the event is about, if any.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::PriceChanged { change, .. } => Some(&change.target_id),
            Self::RepriceProposed { target_id, .. }
            | Self::TargetSuspended { target_id, .. }
            | Self::TargetReset { target_id }
            | Self::DataIntegrity { target_id, .. } => Some(target_id),
            Self::ResourceOutage { .. }
            | Self::ResourceRecovered { .. }
            | Self::ConfigRejected { .. }
            | Self::MonitorStarted { .. }
            | Self::MonitorStopped => None,
        }
    }
}

/// Whether `event` concerns `target_id`. Global events match every target.
pub fn event_matches_target(event: &MonitorEvent, target_id: &str) -> bool {
    event.target_id().map_or(true, |id| id == target_id)
}

/// Receives monitor events. Must not block.
pub trait AlertSink: Send + Sync {
    fn alert(&self, event: MonitorEvent);
}

/// Broadcast channel of [`MonitorEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

impl AlertSink for EventBus {
    fn alert(&self, event: MonitorEvent) {
        self.emit(event);
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn alert(&self, event: MonitorEvent) {
        match &event {
            MonitorEvent::PriceChanged { change, .. } => info!(
                "{} {}: {} -> {}",
                change.target_id,
                change.classification,
                price_text(change.previous_price.as_ref()),
                price_text(change.current_price.as_ref()),
            ),
            MonitorEvent::RepriceProposed {
                target_id, prices, ..
            } => {
                let listed: Vec<String> = prices.iter().map(|(kind, p)| format!("{kind}={p}")).collect();
                info!("{target_id} reprice: {}", listed.join(", "))
            }
            MonitorEvent::TargetSuspended { target_id, reason, .. } => {
                warn!("target {target_id} suspended: {reason}")
            }
            MonitorEvent::DataIntegrity { target_id, detail, .. } => {
                warn!("target {target_id} data integrity violation: {detail}")
            }
            MonitorEvent::ResourceOutage { kind, detail } => warn!("resource outage ({kind}): {detail}"),
            MonitorEvent::ConfigRejected {
                section, index, reason, ..
            } => warn!("catalog {section}[{index}] rejected: {reason}"),
            other => info!("{}", serde_json::to_string(other).unwrap_or_default()),
        }
    }
}

fn price_text(price: Option<&crate::model::Price>) -> String {
    price.map_or_else(|| "unavailable".to_string(), |p| p.to_string())
}
