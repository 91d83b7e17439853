// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence of observations, change events and failure records.
//!
//! The [`PriceStore`] trait is the only way the monitor touches storage.
//! Appends are idempotent by natural key, so a cycle retried after a lost
//! acknowledgement never duplicates history.

pub mod pool;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::PipelineError;
use crate::model::{ChangeEvent, FetchFailure, Observation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What an append did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Inserted,
    /// An identical record was already stored; nothing changed.
    AlreadyPresent,
}

/// Append-only price history.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Store an observation. Same key with a different reading is a
    /// conflict; a timestamp not after the latest one is out of order.
    async fn append_observation(&self, obs: &Observation) -> Result<AppendOutcome, PipelineError>;

    /// Store a change event keyed by its current observation.
    async fn append_change_event(&self, event: &ChangeEvent) -> Result<AppendOutcome, PipelineError>;

    /// Observation and optional event in one transaction.
    async fn commit_cycle(
        &self,
        obs: &Observation,
        event: Option<&ChangeEvent>,
    ) -> Result<AppendOutcome, PipelineError>;

    async fn last_observation(&self, target_id: &str) -> Result<Option<Observation>, PipelineError>;

    /// Best-effort failure log.
    async fn record_failure(&self, failure: &FetchFailure) -> Result<(), PipelineError>;

    /// Newest first.
    async fn history(&self, target_id: &str, limit: usize) -> Result<Vec<Observation>, PipelineError>;

    /// Newest first.
    async fn change_events(&self, target_id: &str, limit: usize) -> Result<Vec<ChangeEvent>, PipelineError>;

    /// Newest first.
    async fn failures(&self, target_id: &str, limit: usize) -> Result<Vec<FetchFailure>, PipelineError>;
}
