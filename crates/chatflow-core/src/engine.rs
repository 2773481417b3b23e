// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The run execution engine.
//!
//! A run advances in read-compute-write cycles: load the run and its
//! snapshot, apply one event, execute steps until the next suspension point
//! (or the end of the flow), then persist with an optimistic concurrency
//! check. A concurrent writer makes the check fail, in which case the whole
//! cycle is retried against fresh state.
//!
//! Events that don't match the run's suspension state (a late timer after
//! the user already replied, a message while waiting on a timer) are
//! dropped without persisting anything. Terminal runs ignore all events.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use crate::action::ActionExecutor;
use crate::error::{EngineError, Result};
use crate::model::{
    FlowSnapshot, KeywordAction, Run, RunEvent, RunOutcome, StepConfig, WaitKind,
};
use crate::store::Store;

/// Read-compute-write attempts before giving up on a contended run.
const DEFAULT_MAX_ADVANCE_ATTEMPTS: u32 = 5;

/// Result of delivering one event to a run.
#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    /// The run after the advance (persisted state).
    pub run: Run,
    /// Step ids executed during this advance, in order.
    pub executed: Vec<String>,
    /// Whether the event applied; `false` means it was dropped as a no-op.
    pub applied: bool,
}

/// Drives runs through their flows.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    actions: ActionExecutor,
    max_advance_attempts: u32,
}

impl Engine {
    /// Create an engine over the given store and action executor.
    pub fn new(store: Arc<dyn Store>, actions: ActionExecutor) -> Self {
        Self {
            store,
            actions,
            max_advance_attempts: DEFAULT_MAX_ADVANCE_ATTEMPTS,
        }
    }

    /// Deliver one event to a run and advance it to its next suspension
    /// point or terminal state.
    #[instrument(skip(self, event), fields(run_id = %run_id))]
    pub async fn handle_event(&self, run_id: &str, event: RunEvent) -> Result<AdvanceOutcome> {
        for _attempt in 0..self.max_advance_attempts {
            let mut run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;

            if run.outcome.is_terminal() {
                return Ok(AdvanceOutcome {
                    run,
                    executed: Vec::new(),
                    applied: false,
                });
            }

            let snapshot = self
                .store
                .load_snapshot(&run.snapshot_id)
                .await?
                .ok_or_else(|| EngineError::SnapshotNotFound {
                    snapshot_id: run.snapshot_id.clone(),
                })?;

            if !apply_event(&mut run, &snapshot, &event)? {
                return Ok(AdvanceOutcome {
                    run,
                    executed: Vec::new(),
                    applied: false,
                });
            }

            let mut executed = Vec::new();
            self.resume(&mut run, &snapshot, &mut executed).await?;
            run.last_advanced_at = Utc::now();

            if !self.store.update_run(&run).await? {
                warn!(version = run.version, "advance lost the version race, retrying");
                continue;
            }
            run.version += 1;

            self.after_persist(&run).await?;

            if run.outcome.is_terminal() {
                info!(outcome = run.outcome.as_str(), "run reached terminal state");
            }
            return Ok(AdvanceOutcome {
                run,
                executed,
                applied: true,
            });
        }

        Err(EngineError::ConcurrencyConflict {
            run_id: run_id.to_string(),
            attempts: self.max_advance_attempts,
        })
    }

    /// Execute steps until the run suspends or terminates.
    ///
    /// Send failures don't propagate: a terminal rejection or exhausted
    /// retries fail the run in place, recording the reason on it.
    async fn resume(
        &self,
        run: &mut Run,
        snapshot: &FlowSnapshot,
        executed: &mut Vec<String>,
    ) -> Result<()> {
        while run.outcome == RunOutcome::Running && run.waiting_for.is_none() {
            let Some(step_id) = run.current_step_id.clone() else {
                run.outcome = RunOutcome::Completed;
                break;
            };
            let step = snapshot
                .step(&step_id)
                .ok_or_else(|| EngineError::StepNotFound {
                    snapshot_id: snapshot.snapshot_id.clone(),
                    step_id: step_id.clone(),
                })?;

            let send_result = match &step.config {
                StepConfig::CustomReply { message } => {
                    self.actions
                        .send_text(&run.conversation_id, message, &run.variables)
                        .await
                }
                StepConfig::SendTemplate {
                    template_id,
                    variables,
                } => {
                    self.actions
                        .send_template(&run.conversation_id, template_id, variables, &run.variables)
                        .await
                }
                StepConfig::UserReply { question, .. } => {
                    match self
                        .actions
                        .send_text(&run.conversation_id, question, &run.variables)
                        .await
                    {
                        Ok(()) => {
                            executed.push(step_id.clone());
                            // Stay on this step; the answer advances it.
                            run.waiting_for = Some(WaitKind::UserReply);
                            return Ok(());
                        }
                        Err(e) => Err(e),
                    }
                }
                StepConfig::TimeGap { delay_seconds } => {
                    executed.push(step_id.clone());
                    if run.is_test {
                        // Test runs collapse delays instead of suspending.
                        run.current_step_id = step.next_step_id.clone();
                        continue;
                    }
                    run.waiting_for = Some(WaitKind::TimeGap);
                    run.wake_at = Some(Utc::now() + Duration::seconds((*delay_seconds).max(0)));
                    return Ok(());
                }
                StepConfig::KeywordCatch { .. } => {
                    executed.push(step_id.clone());
                    run.waiting_for = Some(WaitKind::KeywordCatch);
                    return Ok(());
                }
            };

            match send_result {
                Ok(()) => {
                    executed.push(step_id);
                    run.current_step_id = step.next_step_id.clone();
                }
                Err(EngineError::SendFailed {
                    retryable, reason, ..
                }) => {
                    warn!(step_id, retryable, "send failed, failing run");
                    run.outcome = RunOutcome::Failed;
                    run.last_error = Some(format!("step '{}': {}", step_id, reason));
                    run.waiting_for = None;
                    run.wake_at = None;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Side effects that follow a successful persist.
    async fn after_persist(&self, run: &Run) -> Result<()> {
        if run.waiting_for == Some(WaitKind::TimeGap)
            && !run.is_test
            && let Some(wake_at) = run.wake_at
        {
            self.store.schedule_timer(&run.run_id, wake_at).await?;
        }

        if run.outcome == RunOutcome::Completed && !run.is_test {
            self.store
                .record_execution(&run.automation_id, Utc::now())
                .await?;
        }

        Ok(())
    }
}

// ============================================================================
// Event Application
// ============================================================================

/// Apply one event to an in-memory run. Returns whether the event matched
/// the run's suspension state; unmatched events are no-ops.
fn apply_event(run: &mut Run, snapshot: &FlowSnapshot, event: &RunEvent) -> Result<bool> {
    match event {
        RunEvent::Start => {
            // Only a fresh, not-yet-suspended run starts.
            Ok(run.waiting_for.is_none())
        }

        RunEvent::InboundMessage { text, .. } => match run.waiting_for {
            Some(WaitKind::UserReply) => {
                let step = current_step(run, snapshot)?;
                let StepConfig::UserReply { save_as, .. } = &step.config else {
                    return Err(step_mismatch(run, snapshot));
                };
                run.variables.insert(save_as.clone(), text.clone());
                run.current_step_id = step.next_step_id.clone();
                run.waiting_for = None;
                Ok(true)
            }
            Some(WaitKind::KeywordCatch) => {
                let step = current_step(run, snapshot)?;
                let StepConfig::KeywordCatch {
                    keywords,
                    action,
                    overrides,
                } = &step.config
                else {
                    return Err(step_mismatch(run, snapshot));
                };

                let lowered = text.to_lowercase();
                let Some(matched) = keywords
                    .iter()
                    .find(|k| lowered.contains(&k.to_lowercase()))
                else {
                    // No keyword matched; keep waiting.
                    return Ok(false);
                };

                match action {
                    KeywordAction::Stop => {
                        run.outcome = RunOutcome::Completed;
                        run.current_step_id = None;
                        run.waiting_for = None;
                    }
                    KeywordAction::Continue => {
                        let target = overrides
                            .iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(matched))
                            .map(|(_, step_id)| step_id.clone());
                        run.current_step_id = target.or_else(|| step.next_step_id.clone());
                        run.waiting_for = None;
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        },

        RunEvent::TimerFired => match run.waiting_for {
            Some(WaitKind::TimeGap) => {
                let step = current_step(run, snapshot)?;
                run.current_step_id = step.next_step_id.clone();
                run.waiting_for = None;
                run.wake_at = None;
                Ok(true)
            }
            _ => Ok(false),
        },
    }
}

fn current_step<'a>(run: &Run, snapshot: &'a FlowSnapshot) -> Result<&'a crate::model::Step> {
    let step_id = run
        .current_step_id
        .as_deref()
        .ok_or_else(|| step_mismatch(run, snapshot))?;
    snapshot
        .step(step_id)
        .ok_or_else(|| EngineError::StepNotFound {
            snapshot_id: snapshot.snapshot_id.clone(),
            step_id: step_id.to_string(),
        })
}

fn step_mismatch(run: &Run, snapshot: &FlowSnapshot) -> EngineError {
    EngineError::StepNotFound {
        snapshot_id: snapshot.snapshot_id.clone(),
        step_id: run.current_step_id.clone().unwrap_or_default(),
    }
}
