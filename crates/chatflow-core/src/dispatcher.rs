// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger dispatch: routes conversation events to automations and runs.
//!
//! Two entry points mirror the two inbound webhook events: a conversation
//! opening (which may start new runs) and an inbound message (which may
//! resume suspended runs). A failure on one automation or run never blocks
//! delivery to the others.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::model::{Run, RunEvent, Trigger};
use crate::store::Store;

/// A conversation was opened on a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationStarted {
    /// The new conversation.
    pub conversation_id: String,
    /// Contact the conversation is with.
    pub contact_id: String,
    /// Channel the conversation arrived on.
    pub channel_id: String,
}

/// An inbound message arrived on a conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageReceived {
    /// The conversation the message belongs to.
    pub conversation_id: String,
    /// Message text.
    pub text: String,
    /// When the message was received; defaults to now.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// Per-automation result of a dispatch pass, for the HTTP response.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Runs started or resumed.
    pub dispatched: Vec<String>,
    /// Automations/runs skipped with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Routes inbound conversation events to the engine.
#[derive(Clone)]
pub struct TriggerDispatcher {
    store: Arc<dyn Store>,
    engine: Engine,
}

impl TriggerDispatcher {
    /// Create a dispatcher over the given store and engine.
    pub fn new(store: Arc<dyn Store>, engine: Engine) -> Self {
        Self { store, engine }
    }

    /// Start runs for every active automation matching the conversation's
    /// channel. An automation is skipped if it already has an in-flight run
    /// on this conversation or has no activation snapshot.
    #[instrument(skip(self, event), fields(conversation_id = %event.conversation_id))]
    pub async fn on_conversation_started(
        &self,
        event: &ConversationStarted,
    ) -> Result<DispatchReport> {
        let automations = self
            .store
            .active_automations_for_trigger(Trigger::NewConversation, &event.channel_id)
            .await?;

        let mut report = DispatchReport {
            dispatched: Vec::new(),
            skipped: Vec::new(),
        };

        for automation in automations {
            let Some(snapshot_id) = &automation.snapshot_id else {
                warn!(
                    automation_id = %automation.automation_id,
                    "active automation has no snapshot, skipping"
                );
                report.skipped.push((
                    automation.automation_id.clone(),
                    "no activation snapshot".to_string(),
                ));
                continue;
            };

            if self
                .store
                .find_active_run(&automation.automation_id, &event.conversation_id)
                .await?
                .is_some()
            {
                report.skipped.push((
                    automation.automation_id.clone(),
                    "run already in flight".to_string(),
                ));
                continue;
            }

            match self.start_run(&automation.automation_id, snapshot_id, event).await {
                Ok(run_id) => {
                    info!(
                        automation_id = %automation.automation_id,
                        run_id = %run_id,
                        "run started"
                    );
                    report.dispatched.push(run_id);
                }
                // Another dispatcher won the insert race; not an error.
                Err(EngineError::RunAlreadyActive { .. }) => {
                    report.skipped.push((
                        automation.automation_id.clone(),
                        "run already in flight".to_string(),
                    ));
                }
                Err(e) => {
                    warn!(
                        automation_id = %automation.automation_id,
                        error = %e,
                        "failed to start run"
                    );
                    report
                        .skipped
                        .push((automation.automation_id.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn start_run(
        &self,
        automation_id: &str,
        snapshot_id: &str,
        event: &ConversationStarted,
    ) -> Result<String> {
        let snapshot = self
            .store
            .load_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| EngineError::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })?;

        let run = Run::new(
            automation_id,
            &event.conversation_id,
            &event.contact_id,
            &snapshot,
        );
        let run_id = run.run_id.clone();
        self.store.insert_run(&run).await?;
        self.engine.handle_event(&run_id, RunEvent::Start).await?;
        Ok(run_id)
    }

    /// Forward an inbound message to every run suspended on this
    /// conversation waiting for a message.
    #[instrument(skip(self, event), fields(conversation_id = %event.conversation_id))]
    pub async fn on_message_received(&self, event: &MessageReceived) -> Result<DispatchReport> {
        let runs = self
            .store
            .waiting_runs_for_conversation(&event.conversation_id)
            .await?;

        let mut report = DispatchReport {
            dispatched: Vec::new(),
            skipped: Vec::new(),
        };

        for run in runs {
            let delivery = RunEvent::InboundMessage {
                text: event.text.clone(),
                received_at: event.received_at,
            };
            match self.engine.handle_event(&run.run_id, delivery).await {
                Ok(outcome) if outcome.applied => report.dispatched.push(run.run_id),
                Ok(_) => report
                    .skipped
                    .push((run.run_id, "event did not apply".to_string())),
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "failed to resume run");
                    report.skipped.push((run.run_id, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}
