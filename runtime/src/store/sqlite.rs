// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! SQLite implementation of [`PriceStore`].
//!
//! Timestamps are stored as integer microseconds since the epoch, amounts as
//! decimal text. The natural keys are primary keys, which is what makes the
//! appends idempotent.

use super::pool::SqlitePool;
use super::{AppendOutcome, PriceStore};
use crate::error::{FailureKind, PipelineError};
use crate::model::{ChangeEvent, Classification, FetchFailure, Observation, ObservationKey, Price, PriceDelta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS observations (
    target_id TEXT NOT NULL,
    observed_us INTEGER NOT NULL,
    amount TEXT,
    currency TEXT,
    raw_text TEXT NOT NULL,
    title TEXT,
    fetch_latency_ms INTEGER NOT NULL,
    PRIMARY KEY (target_id, observed_us)
);
CREATE TABLE IF NOT EXISTS change_events (
    target_id TEXT NOT NULL,
    current_us INTEGER NOT NULL,
    previous_us INTEGER,
    classification TEXT NOT NULL,
    delta_abs TEXT,
    delta_pct TEXT,
    previous_amount TEXT,
    previous_currency TEXT,
    current_amount TEXT,
    current_currency TEXT,
    detected_us INTEGER NOT NULL,
    PRIMARY KEY (target_id, current_us)
);
CREATE TABLE IF NOT EXISTS fetch_failures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id TEXT NOT NULL,
    occurred_us INTEGER NOT NULL,
    kind TEXT NOT NULL,
    status INTEGER,
    detail TEXT NOT NULL,
    retry_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fetch_failures_target
    ON fetch_failures (target_id, occurred_us);
";

/// Price history in a SQLite file (WAL mode).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database and its schema.
    pub async fn open(
        path: impl AsRef<Path>,
        pool_size: usize,
        op_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::store(format!("cannot create {}: {e}", parent.display())))?;
        }
        let pool = SqlitePool::new(path, pool_size, op_timeout);
        pool.run(|conn| conn.execute_batch(SCHEMA).map_err(PipelineError::store))
            .await?;
        info!("price store open at {} (pool {})", path.display(), pool.size());
        Ok(Self { pool })
    }

    /// Default location: `~/.pricewatch/pricewatch.db`.
    pub fn default_path() -> std::path::PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("/tmp"))
            .join(".pricewatch")
            .join("pricewatch.db")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db(err: rusqlite::Error) -> PipelineError {
    PipelineError::store(err)
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let us: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_micros(us).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(us) => DateTime::<Utc>::from_timestamp_micros(us)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us)),
        None => Ok(None),
    }
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => Decimal::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn price_cols(row: &Row<'_>, amount: usize, currency: usize) -> rusqlite::Result<Option<Price>> {
    let amount = decimal_col(row, amount)?;
    let currency: Option<String> = row.get(currency)?;
    Ok(match (amount, currency) {
        (Some(amount), Some(currency)) => Some(Price::new(amount, currency)),
        _ => None,
    })
}

const OBSERVATION_COLUMNS: &str =
    "target_id, observed_us, amount, currency, raw_text, title, fetch_latency_ms";

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        target_id: row.get(0)?,
        observed_at: ts_col(row, 1)?,
        price: price_cols(row, 2, 3)?,
        raw_text: row.get(4)?,
        title: row.get(5)?,
        fetch_latency_ms: row.get::<_, i64>(6)?.max(0) as u64,
    })
}

const EVENT_COLUMNS: &str = "target_id, current_us, previous_us, classification, delta_abs, \
     delta_pct, previous_amount, previous_currency, current_amount, current_currency, detected_us";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let target_id: String = row.get(0)?;
    let class_text: String = row.get(3)?;
    let classification = Classification::parse(&class_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown classification {class_text:?}").into(),
        )
    })?;
    let delta = decimal_col(row, 4)?.map(|absolute| -> rusqlite::Result<PriceDelta> {
        Ok(PriceDelta {
            absolute,
            percent: decimal_col(row, 5)?,
        })
    });
    Ok(ChangeEvent {
        previous: opt_ts_col(row, 2)?.map(|observed_at| ObservationKey {
            target_id: target_id.clone(),
            observed_at,
        }),
        current: ObservationKey {
            target_id: target_id.clone(),
            observed_at: ts_col(row, 1)?,
        },
        classification,
        delta: delta.transpose()?,
        previous_price: price_cols(row, 6, 7)?,
        current_price: price_cols(row, 8, 9)?,
        detected_at: ts_col(row, 10)?,
        target_id,
    })
}

fn amount_text(price: &Option<Price>) -> Option<String> {
    price.as_ref().map(|p| p.amount.to_string())
}

fn currency_text(price: &Option<Price>) -> Option<String> {
    price.as_ref().map(|p| p.currency.clone())
}

fn insert_observation(tx: &Transaction<'_>, obs: &Observation) -> Result<AppendOutcome, PipelineError> {
    let us = micros(obs.observed_at);
    let existing = tx
        .query_row(
            &format!("SELECT {OBSERVATION_COLUMNS} FROM observations WHERE target_id = ?1 AND observed_us = ?2"),
            params![obs.target_id, us],
            row_to_observation,
        )
        .optional()
        .map_err(db)?;
    if let Some(existing) = existing {
        return if existing.same_reading(obs) {
            Ok(AppendOutcome::AlreadyPresent)
        } else {
            Err(PipelineError::integrity(
                FailureKind::ConflictingDuplicate,
                format!(
                    "{} at {}: stored {:?}, new {:?}",
                    obs.target_id, obs.observed_at, existing.price, obs.price
                ),
            ))
        };
    }

    let latest: Option<i64> = tx
        .query_row(
            "SELECT MAX(observed_us) FROM observations WHERE target_id = ?1",
            params![obs.target_id],
            |row| row.get(0),
        )
        .map_err(db)?;
    if let Some(latest) = latest {
        if latest >= us {
            return Err(PipelineError::integrity(
                FailureKind::OutOfOrder,
                format!("{}: observation at {} is older than the latest", obs.target_id, obs.observed_at),
            ));
        }
    }

    tx.execute(
        "INSERT INTO observations (target_id, observed_us, amount, currency, raw_text, title, fetch_latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            obs.target_id,
            us,
            amount_text(&obs.price),
            currency_text(&obs.price),
            obs.raw_text,
            obs.title,
            obs.fetch_latency_ms as i64,
        ],
    )
    .map_err(db)?;
    Ok(AppendOutcome::Inserted)
}

fn insert_event(tx: &Transaction<'_>, event: &ChangeEvent) -> Result<AppendOutcome, PipelineError> {
    let us = micros(event.current.observed_at);
    let existing = tx
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM change_events WHERE target_id = ?1 AND current_us = ?2"),
            params![event.target_id, us],
            row_to_event,
        )
        .optional()
        .map_err(db)?;
    if let Some(existing) = existing {
        let same = existing.classification == event.classification
            && existing.current_price == event.current_price
            && existing.previous == event.previous;
        return if same {
            Ok(AppendOutcome::AlreadyPresent)
        } else {
            Err(PipelineError::integrity(
                FailureKind::ConflictingDuplicate,
                format!(
                    "{} at {}: stored {} event, new {}",
                    event.target_id, event.current.observed_at, existing.classification, event.classification
                ),
            ))
        };
    }

    let delta_abs = event.delta.as_ref().map(|d| d.absolute.to_string());
    let delta_pct = event
        .delta
        .as_ref()
        .and_then(|d| d.percent)
        .map(|p| p.to_string());
    tx.execute(
        "INSERT INTO change_events (target_id, current_us, previous_us, classification, delta_abs,
             delta_pct, previous_amount, previous_currency, current_amount, current_currency, detected_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.target_id,
            us,
            event.previous.as_ref().map(|k| micros(k.observed_at)),
            event.classification.as_str(),
            delta_abs,
            delta_pct,
            amount_text(&event.previous_price),
            currency_text(&event.previous_price),
            amount_text(&event.current_price),
            currency_text(&event.current_price),
            micros(event.detected_at),
        ],
    )
    .map_err(db)?;
    Ok(AppendOutcome::Inserted)
}

fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db)?;
    // Dropping an uncommitted transaction rolls it back.
    let value = f(&tx)?;
    tx.commit().map_err(db)?;
    Ok(value)
}

#[async_trait]
impl PriceStore for SqliteStore {
    async fn append_observation(&self, obs: &Observation) -> Result<AppendOutcome, PipelineError> {
        let obs = obs.clone();
        self.pool
            .run(move |conn| in_transaction(conn, |tx| insert_observation(tx, &obs)))
            .await
    }

    async fn append_change_event(&self, event: &ChangeEvent) -> Result<AppendOutcome, PipelineError> {
        let event = event.clone();
        self.pool
            .run(move |conn| in_transaction(conn, |tx| insert_event(tx, &event)))
            .await
    }

    async fn commit_cycle(
        &self,
        obs: &Observation,
        event: Option<&ChangeEvent>,
    ) -> Result<AppendOutcome, PipelineError> {
        let obs = obs.clone();
        let event = event.cloned();
        let outcome = self
            .pool
            .run(move |conn| {
                in_transaction(conn, |tx| {
                    let outcome = insert_observation(tx, &obs)?;
                    if let Some(event) = &event {
                        insert_event(tx, event)?;
                    }
                    Ok(outcome)
                })
            })
            .await?;
        debug!("cycle committed: {outcome:?}");
        Ok(outcome)
    }

    async fn last_observation(&self, target_id: &str) -> Result<Option<Observation>, PipelineError> {
        let target_id = target_id.to_string();
        self.pool
            .run(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE target_id = ?1
                         ORDER BY observed_us DESC LIMIT 1"
                    ),
                    params![target_id],
                    row_to_observation,
                )
                .optional()
                .map_err(db)
            })
            .await
    }

    async fn record_failure(&self, failure: &FetchFailure) -> Result<(), PipelineError> {
        let failure = failure.clone();
        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO fetch_failures (target_id, occurred_us, kind, status, detail, retry_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        failure.target_id,
                        micros(failure.occurred_at),
                        failure.kind.as_str(),
                        failure.kind.status(),
                        failure.detail,
                        failure.retry_count,
                    ],
                )
                .map(|_| ())
                .map_err(db)
            })
            .await
    }

    async fn history(&self, target_id: &str, limit: usize) -> Result<Vec<Observation>, PipelineError> {
        let target_id = target_id.to_string();
        self.pool
            .run(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE target_id = ?1
                         ORDER BY observed_us DESC LIMIT ?2"
                    ))
                    .map_err(db)?;
                let rows = stmt
                    .query_map(params![target_id, limit as i64], row_to_observation)
                    .map_err(db)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
            })
            .await
    }

    async fn change_events(&self, target_id: &str, limit: usize) -> Result<Vec<ChangeEvent>, PipelineError> {
        let target_id = target_id.to_string();
        self.pool
            .run(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM change_events WHERE target_id = ?1
                         ORDER BY current_us DESC LIMIT ?2"
                    ))
                    .map_err(db)?;
                let rows = stmt
                    .query_map(params![target_id, limit as i64], row_to_event)
                    .map_err(db)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
            })
            .await
    }

    async fn failures(&self, target_id: &str, limit: usize) -> Result<Vec<FetchFailure>, PipelineError> {
        let target_id = target_id.to_string();
        self.pool
            .run(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT target_id, occurred_us, kind, status, detail, retry_count
                         FROM fetch_failures WHERE target_id = ?1
                         ORDER BY occurred_us DESC, id DESC LIMIT ?2",
                    )
                    .map_err(db)?;
                let rows = stmt
                    .query_map(params![target_id, limit as i64], |row| {
                        let name: String = row.get(2)?;
                        let status: Option<u16> = row.get(3)?;
                        let kind = FailureKind::from_parts(&name, status).ok_or_else(|| {
                            rusqlite::Error::FromSqlConversionFailure(
                                2,
                                Type::Text,
                                format!("unknown failure kind {name:?}").into(),
                            )
                        })?;
                        Ok(FetchFailure {
                            target_id: row.get(0)?,
                            occurred_at: ts_col(row, 1)?,
                            kind,
                            detail: row.get(4)?,
                            retry_count: row.get(5)?,
                        })
                    })
                    .map_err(db)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_micros;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("prices.db"), 2, Duration::from_secs(5))
            .await
            .unwrap();
        (dir, store)
    }

    fn obs(second: u32, amount: Option<Decimal>) -> Observation {
        Observation {
            target_id: "drill".into(),
            observed_at: Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, second).unwrap(),
            price: amount.map(|a| Price::new(a, "EUR")),
            raw_text: "raw".into(),
            title: Some("Drill".into()),
            fetch_latency_ms: 120,
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let (_dir, store) = store().await;
        let first = obs(0, Some(dec!(99.90)));
        assert_eq!(store.append_observation(&first).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(
            store.append_observation(&first).await.unwrap(),
            AppendOutcome::AlreadyPresent
        );
        assert_eq!(store.history("drill", 10).await.unwrap().len(), 1);

        let mut conflicting = first.clone();
        conflicting.price = Some(Price::new(dec!(89.90), "EUR"));
        let err = store.append_observation(&conflicting).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConflictingDuplicate);
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let (_dir, store) = store().await;
        store.append_observation(&obs(10, Some(dec!(1)))).await.unwrap();
        let err = store.append_observation(&obs(5, Some(dec!(1)))).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::OutOfOrder);
    }

    #[tokio::test]
    async fn test_commit_cycle_round_trips_event() {
        let (_dir, store) = store().await;
        let a = obs(0, Some(dec!(100)));
        let b = obs(1, Some(dec!(90.00)));
        let event = ChangeEvent {
            target_id: "drill".into(),
            previous: Some(a.key()),
            current: b.key(),
            classification: Classification::Decrease,
            delta: Some(PriceDelta {
                absolute: dec!(-10.00),
                percent: Some(dec!(-10.00)),
            }),
            previous_price: a.price.clone(),
            current_price: b.price.clone(),
            detected_at: now_micros(),
        };
        store.commit_cycle(&a, None).await.unwrap();
        assert_eq!(store.commit_cycle(&b, Some(&event)).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(
            store.commit_cycle(&b, Some(&event)).await.unwrap(),
            AppendOutcome::AlreadyPresent
        );

        let events = store.change_events("drill", 10).await.unwrap();
        assert_eq!(events, vec![event]);
        assert_eq!(store.last_observation("drill").await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_failed_cycle_leaves_nothing_behind() {
        let (_dir, store) = store().await;
        let a = obs(0, Some(dec!(1)));
        let stale_event = ChangeEvent {
            target_id: "drill".into(),
            previous: None,
            current: a.key(),
            classification: Classification::Initial,
            delta: None,
            previous_price: None,
            current_price: a.price.clone(),
            detected_at: now_micros(),
        };
        store.append_change_event(&stale_event).await.unwrap();
        let mut conflicting = stale_event.clone();
        conflicting.classification = Classification::Restored;
        let err = store.commit_cycle(&a, Some(&conflicting)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConflictingDuplicate);
        // The observation insert was rolled back with the event.
        assert!(store.last_observation("drill").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_and_failures() {
        let (_dir, store) = store().await;
        store.append_observation(&obs(0, None)).await.unwrap();
        assert_eq!(store.last_observation("drill").await.unwrap().unwrap().price, None);

        for (i, kind) in [FailureKind::Timeout, FailureKind::HttpStatus(503)].into_iter().enumerate() {
            store
                .record_failure(&FetchFailure {
                    target_id: "drill".into(),
                    occurred_at: now_micros(),
                    kind,
                    detail: "boom".into(),
                    retry_count: i as u32 + 1,
                })
                .await
                .unwrap();
        }
        let failures = store.failures("drill", 10).await.unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind, FailureKind::HttpStatus(503));
        assert!(store.last_observation("other").await.unwrap().is_none());
    }
}
