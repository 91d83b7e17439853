// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-target state machine.
//!
//! [`TargetMachine::apply`] is the single place where retry, backoff and
//! suspension are decided. It is pure: the scheduler performs whatever the
//! returned [`Transition`] asks for.

use super::backoff::BackoffPolicy;
use crate::error::{ErrorClass, PipelineError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline stage of a running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Extracting,
    Detecting,
    Persisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TargetState {
    Idle,
    Fetching,
    Extracting,
    Detecting,
    Persisting,
    Backoff { attempt: u32, delay: Duration },
    Suspended { reason: String },
}

impl TargetState {
    fn running(stage: Stage) -> Self {
        match stage {
            Stage::Fetching => Self::Fetching,
            Stage::Extracting => Self::Extracting,
            Stage::Detecting => Self::Detecting,
            Stage::Persisting => Self::Persisting,
        }
    }

    /// Stage of a running cycle, `None` when not running.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Fetching => Some(Stage::Fetching),
            Self::Extracting => Some(Stage::Extracting),
            Self::Detecting => Some(Stage::Detecting),
            Self::Persisting => Some(Stage::Persisting),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stage().is_some()
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Extracting => "extracting",
            Self::Detecting => "detecting",
            Self::Persisting => "persisting",
            Self::Backoff { .. } => "backoff",
            Self::Suspended { .. } => "suspended",
        }
    }
}

/// What a suspended target waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendPolicy {
    /// Stay suspended until an operator resets the target.
    #[default]
    ManualReset,
    /// Try once more every full interval.
    RetryAfterInterval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    /// The target's timer fired (regular interval, backoff, or suspension retry).
    TimerElapsed,
    Progress(Stage),
    Succeeded,
    Failed(PipelineError),
    /// Operator reset: clear counters and leave suspension.
    Reset,
}

/// What the scheduler must do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The event does not apply in the current state.
    Ignored,
    /// Dispatch a cycle now.
    Start,
    /// Stage bookkeeping only.
    Advanced,
    /// Cycle done; schedule the next regular run.
    Completed,
    /// Retry after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Resource outage: wait `delay`, failure not counted.
    Halted { delay: Duration },
    /// Stop scheduling; alert.
    Suspended { reason: String },
    /// Counters cleared; schedule a run now.
    Reset,
}

/// State, counters and last error of one target.
#[derive(Debug, Clone)]
pub struct TargetMachine {
    state: TargetState,
    consecutive_failures: u32,
    extraction_failures: u32,
    outage_attempts: u32,
    last_error: Option<PipelineError>,
}

impl Default for TargetMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetMachine {
    pub fn new() -> Self {
        Self {
            state: TargetState::Idle,
            consecutive_failures: 0,
            extraction_failures: 0,
            outage_attempts: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> &TargetState {
        &self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&PipelineError> {
        self.last_error.as_ref()
    }

    /// Apply `event` and return the action it requires.
    pub fn apply(
        &mut self,
        event: TargetEvent,
        policy: &BackoffPolicy,
        suspend: SuspendPolicy,
    ) -> Transition {
        match event {
            TargetEvent::TimerElapsed => match &self.state {
                TargetState::Idle | TargetState::Backoff { .. } => self.start(),
                TargetState::Suspended { .. } if suspend == SuspendPolicy::RetryAfterInterval => {
                    self.start()
                }
                _ => Transition::Ignored,
            },

            TargetEvent::Progress(stage) => match self.state.stage() {
                Some(current) if stage > current => {
                    self.state = TargetState::running(stage);
                    Transition::Advanced
                }
                _ => Transition::Ignored,
            },

            TargetEvent::Succeeded => {
                if !self.state.is_running() {
                    return Transition::Ignored;
                }
                self.state = TargetState::Idle;
                self.consecutive_failures = 0;
                self.extraction_failures = 0;
                self.outage_attempts = 0;
                self.last_error = None;
                Transition::Completed
            }

            TargetEvent::Failed(err) => {
                if !self.state.is_running() {
                    return Transition::Ignored;
                }
                self.fail(err, policy)
            }

            TargetEvent::Reset => {
                self.consecutive_failures = 0;
                self.extraction_failures = 0;
                self.outage_attempts = 0;
                self.last_error = None;
                if self.state.is_running() {
                    // The in-flight cycle finishes on its own.
                    return Transition::Ignored;
                }
                self.state = TargetState::Idle;
                Transition::Reset
            }
        }
    }

    fn start(&mut self) -> Transition {
        self.state = TargetState::Fetching;
        Transition::Start
    }

    fn fail(&mut self, err: PipelineError, policy: &BackoffPolicy) -> Transition {
        let class = err.class();
        let reason = err.to_string();
        self.last_error = Some(err);

        match class {
            ErrorClass::FatalResource => {
                self.outage_attempts = self.outage_attempts.saturating_add(1);
                let delay = policy.delay(self.outage_attempts);
                self.state = TargetState::Backoff {
                    attempt: self.consecutive_failures,
                    delay,
                };
                Transition::Halted { delay }
            }
            ErrorClass::DataIntegrity => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.suspend(reason)
            }
            ErrorClass::TransientFetch => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.extraction_failures = 0;
                if self.consecutive_failures >= policy.max_retries {
                    self.suspend(format!(
                        "{} consecutive failures, last: {reason}",
                        self.consecutive_failures
                    ))
                } else {
                    self.backoff(policy)
                }
            }
            ErrorClass::Extraction => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.extraction_failures = self.extraction_failures.saturating_add(1);
                if self.extraction_failures >= policy.max_extraction_retries {
                    self.suspend(format!(
                        "extraction rule looks stale after {} failures, last: {reason}",
                        self.extraction_failures
                    ))
                } else {
                    self.backoff(policy)
                }
            }
        }
    }

    fn backoff(&mut self, policy: &BackoffPolicy) -> Transition {
        let attempt = self.consecutive_failures;
        let delay = policy.delay(attempt);
        self.state = TargetState::Backoff { attempt, delay };
        Transition::Retry { attempt, delay }
    }

    fn suspend(&mut self, reason: String) -> Transition {
        self.state = TargetState::Suspended {
            reason: reason.clone(),
        };
        Transition::Suspended { reason }
    }
}
