// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Monitoring loop.
//!
//! A single scheduler task owns every target's [`TargetMachine`] and decides
//! when each one runs. Due targets are pushed onto a shared queue that a
//! fixed pool of workers drains; each worker runs one target's whole
//! pipeline and reports back. A target is never queued twice.
//!
//! The scheduler is driven by three inputs: its own tick, worker reports and
//! commands from [`MonitorHandle`].

pub mod backoff;
pub mod pipeline;
pub mod state;

pub use backoff::BackoffPolicy;
pub use pipeline::{CycleReport, PipelineDeps};
pub use state::{Stage, SuspendPolicy, TargetEvent, TargetMachine, TargetState, Transition};

use crate::config::MonitorConfig;
use crate::detect::NoisePolicy;
use crate::error::{ErrorClass, FailureKind, PipelineError};
use crate::events::{AlertSink, MonitorEvent};
use crate::extract::{ExtractionRule, RuleBook};
use crate::health::{self, BrowserHealth, CycleCounters, HealthSnapshot, TargetCounts};
use crate::model::{now_micros, FetchFailure, Price};
use crate::store::AppendOutcome;
use crate::targets::{Catalog, Target};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("monitor is not running")]
    Stopped,
}

/// Point-in-time view of one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub id: String,
    pub url: String,
    pub label: Option<String>,
    pub enabled: bool,
    /// Removed from the catalog by a reload; history is kept.
    pub removed: bool,
    pub state: TargetState,
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_price: Option<Price>,
    pub next_run_in_ms: Option<u64>,
}

/// Effect of a catalog reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub rejected: usize,
}

enum Command {
    Reload(Box<Catalog>, oneshot::Sender<ReloadSummary>),
    Disable(String, oneshot::Sender<bool>),
    Enable(String, oneshot::Sender<bool>),
    Reset(String, oneshot::Sender<bool>),
    Recheck(String, oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<Vec<TargetStatus>>),
    Health(oneshot::Sender<HealthSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

struct Job {
    target: Target,
    rule: ExtractionRule,
    noise: NoisePolicy,
}

enum WorkerMsg {
    Progress {
        target_id: String,
        stage: Stage,
    },
    Done {
        target_id: String,
        result: Result<CycleReport, PipelineError>,
    },
}

struct Entry {
    target: Target,
    machine: TargetMachine,
    in_flight: bool,
    removed: bool,
    next_due: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    last_price: Option<Price>,
}

impl Entry {
    fn new(target: Target, jitter: f64) -> Self {
        let next_due = Instant::now() + backoff::initial_delay(target.interval, jitter);
        Self {
            target,
            machine: TargetMachine::new(),
            in_flight: false,
            removed: false,
            next_due: Some(next_due),
            last_success: None,
            last_price: None,
        }
    }

    fn status(&self, now: Instant) -> TargetStatus {
        TargetStatus {
            id: self.target.id.clone(),
            url: self.target.url.clone(),
            label: self.target.label.clone(),
            enabled: self.target.enabled,
            removed: self.removed,
            state: self.machine.state().clone(),
            in_flight: self.in_flight,
            consecutive_failures: self.machine.consecutive_failures(),
            last_error: self.machine.last_error().map(ToString::to_string),
            last_success: self.last_success,
            last_price: self.last_price.clone(),
            next_run_in_ms: self
                .next_due
                .map(|due| due.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Control surface of a running monitor. Cheap to clone.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MonitorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MonitorError::Stopped)?;
        rx.await.map_err(|_| MonitorError::Stopped)
    }

    /// Replace targets, rules and noise policy. Targets missing from the new
    /// catalog are disabled, not forgotten.
    pub async fn reload(&self, catalog: Catalog) -> Result<ReloadSummary, MonitorError> {
        self.request(|tx| Command::Reload(Box::new(catalog), tx)).await
    }

    /// Stop scheduling `id`. A cycle already running finishes.
    pub async fn disable(&self, id: &str) -> Result<bool, MonitorError> {
        let id = id.to_string();
        self.request(|tx| Command::Disable(id, tx)).await
    }

    pub async fn enable(&self, id: &str) -> Result<bool, MonitorError> {
        let id = id.to_string();
        self.request(|tx| Command::Enable(id, tx)).await
    }

    /// Clear failure counters and lift a suspension.
    pub async fn reset(&self, id: &str) -> Result<bool, MonitorError> {
        let id = id.to_string();
        self.request(|tx| Command::Reset(id, tx)).await
    }

    /// Run `id` now. Returns false when it is running, suspended or disabled.
    pub async fn recheck(&self, id: &str) -> Result<bool, MonitorError> {
        let id = id.to_string();
        self.request(|tx| Command::Recheck(id, tx)).await
    }

    pub async fn snapshot(&self) -> Result<Vec<TargetStatus>, MonitorError> {
        self.request(Command::Snapshot).await
    }

    pub async fn health(&self) -> Result<HealthSnapshot, MonitorError> {
        self.request(Command::Health).await
    }

    /// Stop scheduling, let running cycles finish and close the browser.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        let acked = self.request(Command::Shutdown).await;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        acked
    }
}

/// Start the scheduler and workers for `catalog`.
pub fn start(
    config: MonitorConfig,
    catalog: Catalog,
    deps: PipelineDeps,
    alerts: Arc<dyn AlertSink>,
) -> MonitorHandle {
    report_rejected(&catalog, alerts.as_ref());

    let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
    let (result_tx, result_rx) = mpsc::unbounded_channel::<WorkerMsg>();
    let (command_tx, command_rx) = mpsc::channel::<Command>(64);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let mut workers = JoinSet::new();
    for n in 0..config.workers {
        workers.spawn(worker(n, deps.clone(), Arc::clone(&job_rx), result_tx.clone()));
    }
    drop(result_tx);

    let entries: BTreeMap<String, Entry> = catalog
        .targets
        .into_iter()
        .map(|t| (t.id.clone(), Entry::new(t, config.jitter)))
        .collect();

    alerts.alert(MonitorEvent::MonitorStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
        targets: entries.len(),
        workers: config.workers,
    });
    info!(
        "monitor started: targets={} workers={} max_contexts={}",
        entries.len(),
        config.workers,
        config.max_contexts
    );

    let scheduler = Scheduler {
        config,
        deps,
        alerts,
        entries,
        rules: catalog.rules,
        noise: catalog.noise,
        jobs: Some(job_tx),
        outage: None,
        recovering: Arc::new(AtomicBool::new(false)),
        counters: CycleCounters::default(),
    };
    let task = tokio::spawn(scheduler.run(command_rx, result_rx, workers));

    MonitorHandle {
        commands: command_tx,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

fn report_rejected(catalog: &Catalog, alerts: &dyn AlertSink) {
    for rejected in &catalog.rejected {
        alerts.alert(MonitorEvent::ConfigRejected {
            section: rejected.section.as_str().to_string(),
            index: rejected.index,
            id: rejected.id.clone(),
            reason: rejected.reason.clone(),
        });
    }
}

async fn worker(
    n: usize,
    deps: PipelineDeps,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    results: mpsc::UnboundedSender<WorkerMsg>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        let target_id = job.target.id.clone();
        // A panicking cycle must still report Done, or the target stays in flight.
        let cycle = tokio::spawn({
            let deps = deps.clone();
            let results = results.clone();
            async move {
                let id = job.target.id.clone();
                pipeline::run_cycle(&deps, &job.target, &job.rule, &job.noise, |stage| {
                    let _ = results.send(WorkerMsg::Progress {
                        target_id: id.clone(),
                        stage,
                    });
                })
                .await
            }
        });
        let result = match cycle.await {
            Ok(result) => result,
            Err(e) => {
                warn!("{target_id}: cycle aborted: {e}");
                Err(PipelineError::extraction(
                    FailureKind::ParseError,
                    format!("cycle aborted: {e}"),
                ))
            }
        };
        if results.send(WorkerMsg::Done { target_id, result }).is_err() {
            break;
        }
    }
    debug!("worker {n} stopped");
}

struct Scheduler {
    config: MonitorConfig,
    deps: PipelineDeps,
    alerts: Arc<dyn AlertSink>,
    entries: BTreeMap<String, Entry>,
    rules: RuleBook,
    noise: NoisePolicy,
    /// Dropped on shutdown so workers drain and exit.
    jobs: Option<mpsc::UnboundedSender<Job>>,
    /// Current resource outage, reported once.
    outage: Option<(FailureKind, String)>,
    recovering: Arc<AtomicBool>,
    counters: CycleCounters,
}

impl Scheduler {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut results: mpsc::UnboundedReceiver<WorkerMsg>,
        mut workers: JoinSet<()>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_ticker = tokio::time::interval(self.config.health_every);
        health_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(msg) = results.recv() => self.handle_worker(msg),
                _ = ticker.tick() => self.dispatch_due(),
                _ = health_ticker.tick() => self.health_tick().await,
            }
        }

        info!("monitor stopping, waiting for running cycles");
        self.jobs = None;
        while workers.join_next().await.is_some() {}
        self.deps.sessions.shutdown().await;
        self.alerts.alert(MonitorEvent::MonitorStopped);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.target.enabled && !e.in_flight && e.next_due.is_some_and(|d| d <= now))
            .map(|e| e.target.id.clone())
            .collect();
        for id in due {
            self.start_cycle(&id);
        }
    }

    /// Fire the target's timer and queue a job if the machine allows it.
    fn start_cycle(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        let transition = entry.machine.apply(
            TargetEvent::TimerElapsed,
            &self.config.backoff,
            self.config.suspend_policy,
        );
        if transition != Transition::Start {
            entry.next_due = None;
            return false;
        }

        let Some(rule) = self.rules.get(&entry.target.rule).cloned() else {
            let err = PipelineError::extraction(
                FailureKind::InvalidRule,
                format!("rule {:?} is not in the catalog", entry.target.rule),
            );
            self.finish(id, Err(err));
            return false;
        };
        let Some(jobs) = &self.jobs else {
            return false;
        };

        entry.in_flight = true;
        entry.next_due = None;
        let job = Job {
            target: entry.target.clone(),
            rule,
            noise: self.noise.clone(),
        };
        if jobs.send(job).is_err() {
            entry.in_flight = false;
            return false;
        }
        debug!("queued {id}");
        true
    }

    fn handle_worker(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Progress { target_id, stage } => {
                if let Some(entry) = self.entries.get_mut(&target_id) {
                    entry.machine.apply(
                        TargetEvent::Progress(stage),
                        &self.config.backoff,
                        self.config.suspend_policy,
                    );
                }
            }
            WorkerMsg::Done { target_id, result } => self.finish(&target_id, result),
        }
    }

    fn finish(&mut self, id: &str, result: Result<CycleReport, PipelineError>) {
        let policy = self.config.backoff.clone();
        let suspend = self.config.suspend_policy;
        let jitter = self.config.jitter;
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.in_flight = false;
        let now = Instant::now();

        let err = match result {
            Ok(report) => {
                entry.machine.apply(TargetEvent::Succeeded, &policy, suspend);
                entry.last_success = Some(report.observation.observed_at);
                entry.last_price = report.observation.price.clone();
                entry.next_due = Some(now + backoff::jittered(entry.target.interval, jitter));
                self.counters.cycles_ok += 1;

                let url = entry.target.url.clone();
                let label = entry.target.label.clone();
                debug!("{id}: cycle ok in {}ms ({:?})", report.elapsed_ms, report.outcome);

                if let Some((kind, _)) = self.outage.take() {
                    info!("resource recovered ({kind})");
                    self.alerts.alert(MonitorEvent::ResourceRecovered { kind });
                }
                if let (Some(change), AppendOutcome::Inserted) = (report.event, report.outcome) {
                    self.counters.changes_detected += 1;
                    info!(
                        "{id}: {} {}",
                        change.classification,
                        change
                            .current_price
                            .as_ref()
                            .map_or_else(|| "unavailable".to_string(), ToString::to_string)
                    );
                    self.alerts.alert(MonitorEvent::PriceChanged { url, label, change });
                }
                return;
            }
            Err(err) => err,
        };

        self.counters.cycles_failed += 1;
        let transition = entry
            .machine
            .apply(TargetEvent::Failed(err.clone()), &policy, suspend);
        let retry_count = entry.machine.consecutive_failures();

        match transition {
            Transition::Retry { attempt, delay } => {
                debug!("{id}: {err}; retry {attempt} in {delay:?}");
                entry.next_due = Some(now + delay);
            }
            Transition::Halted { delay } => {
                debug!("{id}: halted for {delay:?}: {err}");
                entry.next_due = Some(now + delay);
                if self.outage.is_none() {
                    warn!("resource outage ({}): {}", err.kind(), err.detail());
                    self.outage = Some((err.kind(), err.detail().to_string()));
                    self.alerts.alert(MonitorEvent::ResourceOutage {
                        kind: err.kind(),
                        detail: err.detail().to_string(),
                    });
                }
            }
            Transition::Suspended { reason } => {
                warn!("{id} suspended: {reason}");
                entry.next_due = match suspend {
                    SuspendPolicy::RetryAfterInterval => Some(now + entry.target.interval),
                    SuspendPolicy::ManualReset => None,
                };
                if err.class() == ErrorClass::DataIntegrity {
                    self.alerts.alert(MonitorEvent::DataIntegrity {
                        target_id: id.to_string(),
                        kind: err.kind(),
                        detail: err.detail().to_string(),
                    });
                }
                self.alerts.alert(MonitorEvent::TargetSuspended {
                    target_id: id.to_string(),
                    kind: err.kind(),
                    reason,
                    consecutive_failures: retry_count,
                });
            }
            _ => {}
        }

        self.record_failure(FetchFailure {
            target_id: id.to_string(),
            occurred_at: now_micros(),
            kind: err.kind(),
            detail: err.detail().to_string(),
            retry_count,
        });
    }

    /// Best effort, off the scheduler.
    fn record_failure(&self, failure: FetchFailure) {
        let store = Arc::clone(&self.deps.store);
        tokio::spawn(async move {
            if let Err(e) = store.record_failure(&failure).await {
                debug!("could not record failure for {}: {e}", failure.target_id);
            }
        });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reload(catalog, reply) => {
                let _ = reply.send(self.reload(*catalog));
            }
            Command::Disable(id, reply) => {
                let found = match self.entries.get_mut(&id) {
                    Some(entry) => {
                        entry.target.enabled = false;
                        info!("{id} disabled");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            Command::Enable(id, reply) => {
                let enabled = match self.entries.get_mut(&id) {
                    Some(entry) if !entry.removed => {
                        entry.target.enabled = true;
                        if entry.next_due.is_none() && !entry.machine.state().is_suspended() {
                            entry.next_due = Some(Instant::now());
                        }
                        info!("{id} enabled");
                        true
                    }
                    _ => false,
                };
                let _ = reply.send(enabled);
            }
            Command::Reset(id, reply) => {
                let found = match self.entries.get_mut(&id) {
                    Some(entry) => {
                        let t = entry.machine.apply(
                            TargetEvent::Reset,
                            &self.config.backoff,
                            self.config.suspend_policy,
                        );
                        if t == Transition::Reset {
                            entry.next_due = Some(Instant::now());
                        }
                        info!("{id} reset");
                        self.alerts.alert(MonitorEvent::TargetReset { target_id: id.clone() });
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            Command::Recheck(id, reply) => {
                let runnable = self.entries.get(&id).is_some_and(|e| {
                    e.target.enabled && !e.in_flight && !e.machine.state().is_suspended()
                });
                let started = runnable && self.start_cycle(&id);
                let _ = reply.send(started);
            }
            Command::Snapshot(reply) => {
                let now = Instant::now();
                let _ = reply.send(self.entries.values().map(|e| e.status(now)).collect());
            }
            Command::Health(reply) => {
                let _ = reply.send(self.health_snapshot().await);
            }
            Command::Shutdown(_) => {}
        }
    }

    fn reload(&mut self, catalog: Catalog) -> ReloadSummary {
        report_rejected(&catalog, self.alerts.as_ref());
        let mut summary = ReloadSummary {
            rejected: catalog.rejected.len(),
            ..ReloadSummary::default()
        };

        let mut seen = HashSet::new();
        for target in catalog.targets {
            seen.insert(target.id.clone());
            match self.entries.get_mut(&target.id) {
                Some(entry) => {
                    if entry.target != target || entry.removed {
                        summary.updated += 1;
                    }
                    entry.removed = false;
                    entry.target = target;
                    if entry.next_due.is_none()
                        && !entry.in_flight
                        && !entry.machine.state().is_suspended()
                    {
                        entry.next_due = Some(Instant::now());
                    }
                }
                None => {
                    summary.added += 1;
                    self.entries
                        .insert(target.id.clone(), Entry::new(target, self.config.jitter));
                }
            }
        }
        for entry in self.entries.values_mut() {
            if !seen.contains(&entry.target.id) && !entry.removed {
                entry.removed = true;
                entry.target.enabled = false;
                summary.removed += 1;
            }
        }

        self.rules = catalog.rules;
        self.noise = catalog.noise;
        info!(
            "catalog reloaded: added={} updated={} removed={} rejected={}",
            summary.added, summary.updated, summary.removed, summary.rejected
        );
        summary
    }

    async fn health_snapshot(&self) -> HealthSnapshot {
        let mut targets = TargetCounts {
            total: self.entries.len(),
            ..TargetCounts::default()
        };
        for entry in self.entries.values() {
            let state = entry.machine.state();
            if entry.target.enabled {
                targets.enabled += 1;
            }
            if entry.in_flight {
                targets.running += 1;
            }
            match state {
                TargetState::Backoff { .. } => targets.backoff += 1,
                TargetState::Suspended { .. } => targets.suspended += 1,
                _ => {}
            }
        }
        let sessions = &self.deps.sessions;
        let browser = BrowserHealth {
            degraded: sessions.is_degraded(),
            available_slots: sessions.available_slots(),
            active_contexts: sessions.active_contexts().await,
        };
        let outage = self
            .outage
            .as_ref()
            .map(|(kind, detail)| format!("{kind}: {detail}"));
        HealthSnapshot::new(browser, targets, self.counters.clone(), outage)
    }

    async fn health_tick(&mut self) {
        self.maybe_recover();
        let snapshot = self.health_snapshot().await;
        let dir = self.config.health_dir.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = health::write_snapshot(&dir, &snapshot) {
                warn!("health ledger write failed: {e}");
            }
        });
    }

    /// Relaunch a degraded browser in the background.
    fn maybe_recover(&self) {
        if !self.deps.sessions.is_degraded() || self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = Arc::clone(&self.deps.sessions);
        let flag = Arc::clone(&self.recovering);
        tokio::spawn(async move {
            if sessions.recover().await {
                info!("browser session manager recovered");
            }
            flag.store(false, Ordering::SeqCst);
        });
    }
}
