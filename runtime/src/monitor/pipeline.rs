// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! One monitoring cycle: lease, fetch, extract, detect, persist.
//!
//! The browser context is released before extraction starts, and no store
//! connection is held while a page loads.

use super::state::Stage;
use crate::detect::{classify, NoisePolicy};
use crate::error::{FailureKind, PipelineError};
use crate::extract::{extract, ExtractionRule, PriceReading};
use crate::fetcher::{PageFetcher, RawPage};
use crate::model::{ChangeEvent, Observation};
use crate::session::SessionManager;
use crate::store::{AppendOutcome, PriceStore};
use crate::targets::Target;
use std::sync::Arc;
use std::time::Instant;

/// Collaborators a cycle needs.
#[derive(Clone)]
pub struct PipelineDeps {
    pub sessions: Arc<SessionManager>,
    pub fetcher: PageFetcher,
    pub store: Arc<dyn PriceStore>,
}

/// What a successful cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub observation: Observation,
    /// `None` when nothing changed.
    pub event: Option<ChangeEvent>,
    pub outcome: AppendOutcome,
    pub elapsed_ms: u64,
}

/// Lease a context, load the page and release the context.
pub async fn fetch_page(deps: &PipelineDeps, target: &Target) -> Result<RawPage, PipelineError> {
    let mut lease = deps.sessions.acquire_context(&target.profile).await?;
    let generation = lease.generation();
    let result = match lease.context() {
        Ok(context) => deps.fetcher.fetch(context, &target.url, &target.wait).await,
        Err(e) => Err(e),
    };
    lease.release().await;

    match result {
        Err(e) if matches!(
            e.kind(),
            FailureKind::Timeout | FailureKind::BrowserCrash | FailureKind::NavigationAborted
        ) =>
        {
            if deps.sessions.check_after_failure(generation).await {
                Err(PipelineError::fetch(
                    FailureKind::BrowserCrash,
                    format!("browser died while loading {}: {}", target.url, e.detail()),
                ))
            } else {
                Err(e)
            }
        }
        other => other,
    }
}

/// Apply `rule` off the async workers; HTML parsing is CPU-bound.
pub async fn extract_page(page: RawPage, rule: ExtractionRule) -> Result<(RawPage, PriceReading), PipelineError> {
    tokio::task::spawn_blocking(move || -> Result<(RawPage, PriceReading), PipelineError> {
        let reading = extract(&page, &rule)?;
        Ok((page, reading))
    })
    .await
    .map_err(|e| PipelineError::extraction(FailureKind::ParseError, format!("extractor task failed: {e}")))?
}

/// Build the observation a reading stands for.
pub fn observation(target: &Target, page: &RawPage, reading: PriceReading) -> Observation {
    Observation {
        target_id: target.id.clone(),
        observed_at: page.fetched_at,
        price: reading.price,
        raw_text: reading.raw_text,
        title: reading.title,
        fetch_latency_ms: page.latency.as_millis() as u64,
    }
}

/// Run one full cycle for `target`, reporting each stage through `progress`.
pub async fn run_cycle(
    deps: &PipelineDeps,
    target: &Target,
    rule: &ExtractionRule,
    noise: &NoisePolicy,
    progress: impl Fn(Stage),
) -> Result<CycleReport, PipelineError> {
    let started = Instant::now();

    let page = fetch_page(deps, target).await?;

    progress(Stage::Extracting);
    let rule = rule.clone().with_variant(target.variant.clone());
    let (page, reading) = extract_page(page, rule).await?;
    let observation = observation(target, &page, reading);

    progress(Stage::Detecting);
    let previous = deps.store.last_observation(&target.id).await?;
    let event = classify(previous.as_ref(), &observation, noise)?;

    progress(Stage::Persisting);
    let outcome = deps.store.commit_cycle(&observation, event.as_ref()).await?;

    Ok(CycleReport {
        observation,
        event,
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
