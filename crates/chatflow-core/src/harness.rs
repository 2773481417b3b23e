// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test harness: execute an automation's current draft flow immediately.
//!
//! A test run executes against an ephemeral snapshot of the live steps, so
//! the automation doesn't need to be active (or even valid for production).
//! Delays collapse inline, nothing is counted, and the report captures what
//! a contact would have seen.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::model::{FlowSnapshot, Run, RunEvent, RunOutcome, WaitKind};
use crate::store::Store;
use crate::validation::validate_flow;

/// What a test execution did, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    /// The test run's id; inbound messages on the conversation resume it.
    pub run_id: String,
    /// Outcome after running to the first message-wait or the end.
    pub outcome: RunOutcome,
    /// Suspension reason if the run is waiting on a message.
    pub waiting_for: Option<WaitKind>,
    /// Variables captured so far.
    pub variables: BTreeMap<String, String>,
    /// Step ids executed, in order.
    pub steps_executed: Vec<String>,
    /// Validation warnings surfaced to the author.
    pub warnings: Vec<String>,
}

/// Runs draft flows end to end without activating them.
#[derive(Clone)]
pub struct TestHarness {
    store: Arc<dyn Store>,
    engine: Engine,
}

impl TestHarness {
    /// Create a harness over the given store and engine.
    pub fn new(store: Arc<dyn Store>, engine: Engine) -> Self {
        Self { store, engine }
    }

    /// Execute the automation's current steps as a test run.
    ///
    /// Sends go out through the real gateway on the given conversation.
    /// The run suspends at `user_reply`/`keyword_catch` steps like a
    /// production run; `time_gap` delays are collapsed inline.
    #[instrument(skip(self), fields(automation_id = %automation_id))]
    pub async fn run_automation(
        &self,
        automation_id: &str,
        conversation_id: &str,
        contact_id: &str,
    ) -> Result<TestReport> {
        let automation = self
            .store
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| EngineError::AutomationNotFound {
                automation_id: automation_id.to_string(),
            })?;

        let steps = self.store.list_steps(automation_id).await?;
        let validation = validate_flow(&steps);
        if validation.has_errors() {
            return Err(EngineError::ValidationFailed {
                automation_id: automation_id.to_string(),
                errors: validation.error_messages(),
            });
        }

        // Ephemeral snapshot of the draft; production runs keep using the
        // activation snapshot.
        let snapshot = FlowSnapshot::capture(&automation.automation_id, &steps).ok_or_else(
            || EngineError::ValidationFailed {
                automation_id: automation_id.to_string(),
                errors: vec!["flow has no steps".to_string()],
            },
        )?;
        self.store.save_snapshot(&snapshot).await?;

        let run = Run::new(automation_id, conversation_id, contact_id, &snapshot).as_test();
        let run_id = run.run_id.clone();
        self.store.insert_run(&run).await?;

        let outcome = self.engine.handle_event(&run_id, RunEvent::Start).await?;

        Ok(TestReport {
            run_id,
            outcome: outcome.run.outcome,
            waiting_for: outcome.run.waiting_for,
            variables: outcome.run.variables,
            steps_executed: outcome.executed,
            warnings: validation.warnings.iter().map(|w| w.to_string()).collect(),
        })
    }
}
