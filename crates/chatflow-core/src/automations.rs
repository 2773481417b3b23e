// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Automation lifecycle: create, edit, activate, deactivate, delete.
//!
//! Activation is the only path that captures a flow snapshot; edits made
//! after activation touch only the live steps and take effect on the next
//! activation. Deactivating (or deleting) an automation cancels its
//! in-flight runs and their timers.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{EngineError, Result};
use crate::model::{Automation, AutomationStatus, FlowSnapshot, Step, Trigger};
use crate::store::Store;
use crate::validation::{ValidationResult, validate_flow};

/// Manages automation definitions and their lifecycle.
#[derive(Clone)]
pub struct AutomationService {
    store: Arc<dyn Store>,
}

impl AutomationService {
    /// Create a service over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a new (inactive) automation with its steps.
    ///
    /// Steps are validated; hard errors reject the create so an unloadable
    /// flow never lands in the store. Warnings are returned alongside.
    #[instrument(skip(self, steps))]
    pub async fn create(
        &self,
        name: &str,
        trigger: Trigger,
        channel_id: Option<String>,
        steps: Vec<Step>,
    ) -> Result<(Automation, ValidationResult)> {
        let automation = Automation::new(name, trigger, channel_id);
        let validation = self.check(&steps, &automation.automation_id)?;
        let steps = rekey_steps(&automation.automation_id, steps);

        self.store.insert_automation(&automation).await?;
        self.store
            .replace_steps(&automation.automation_id, &steps)
            .await?;

        info!(automation_id = %automation.automation_id, "automation created");
        Ok((automation, validation))
    }

    /// Update an automation's definition and replace its steps.
    ///
    /// In-flight runs are unaffected; they keep executing against the
    /// snapshot captured at their activation.
    #[instrument(skip(self, steps), fields(automation_id = %automation_id))]
    pub async fn update(
        &self,
        automation_id: &str,
        name: &str,
        trigger: Trigger,
        channel_id: Option<String>,
        steps: Vec<Step>,
    ) -> Result<(Automation, ValidationResult)> {
        let mut automation = self.get(automation_id).await?;
        let validation = self.check(&steps, automation_id)?;
        let steps = rekey_steps(automation_id, steps);

        automation.name = name.to_string();
        automation.trigger = trigger;
        automation.channel_id = channel_id;

        self.store.update_automation(&automation).await?;
        self.store.replace_steps(automation_id, &steps).await?;

        Ok((automation, validation))
    }

    /// Fetch an automation.
    pub async fn get(&self, automation_id: &str) -> Result<Automation> {
        self.store
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| EngineError::AutomationNotFound {
                automation_id: automation_id.to_string(),
            })
    }

    /// List all automations.
    pub async fn list(&self) -> Result<Vec<Automation>> {
        self.store.list_automations().await
    }

    /// Fetch an automation's live steps.
    pub async fn steps(&self, automation_id: &str) -> Result<Vec<Step>> {
        // Existence check first so a bad id maps to 404, not an empty flow.
        self.get(automation_id).await?;
        self.store.list_steps(automation_id).await
    }

    /// Activate an automation: validate, snapshot the live steps, and make
    /// it eligible for triggering.
    #[instrument(skip(self), fields(automation_id = %automation_id))]
    pub async fn activate(&self, automation_id: &str) -> Result<(Automation, ValidationResult)> {
        let mut automation = self.get(automation_id).await?;
        let steps = self.store.list_steps(automation_id).await?;
        let validation = self.check(&steps, automation_id)?;

        let snapshot = FlowSnapshot::capture(automation_id, &steps).ok_or_else(|| {
            EngineError::ValidationFailed {
                automation_id: automation_id.to_string(),
                errors: vec!["flow has no steps".to_string()],
            }
        })?;
        self.store.save_snapshot(&snapshot).await?;
        self.store
            .set_automation_status(
                automation_id,
                AutomationStatus::Active,
                Some(&snapshot.snapshot_id),
            )
            .await?;

        automation.status = AutomationStatus::Active;
        automation.snapshot_id = Some(snapshot.snapshot_id);

        info!(automation_id = %automation_id, "automation activated");
        Ok((automation, validation))
    }

    /// Deactivate an automation and cancel its in-flight runs.
    #[instrument(skip(self), fields(automation_id = %automation_id))]
    pub async fn deactivate(
        &self,
        automation_id: &str,
        status: AutomationStatus,
    ) -> Result<Automation> {
        let mut automation = self.get(automation_id).await?;

        let cancelled = self.store.cancel_runs_for_automation(automation_id).await?;
        self.store
            .set_automation_status(automation_id, status, automation.snapshot_id.as_deref())
            .await?;

        automation.status = status;
        info!(
            automation_id = %automation_id,
            cancelled_runs = cancelled,
            "automation deactivated"
        );
        Ok(automation)
    }

    /// Flip an automation between active and paused.
    pub async fn toggle(&self, automation_id: &str) -> Result<(Automation, Option<ValidationResult>)> {
        let automation = self.get(automation_id).await?;
        match automation.status {
            AutomationStatus::Active => {
                let automation = self
                    .deactivate(automation_id, AutomationStatus::Paused)
                    .await?;
                Ok((automation, None))
            }
            AutomationStatus::Inactive | AutomationStatus::Paused => {
                let (automation, validation) = self.activate(automation_id).await?;
                Ok((automation, Some(validation)))
            }
        }
    }

    /// Delete an automation, cancelling its in-flight runs first.
    #[instrument(skip(self), fields(automation_id = %automation_id))]
    pub async fn delete(&self, automation_id: &str) -> Result<()> {
        let cancelled = self.store.cancel_runs_for_automation(automation_id).await?;
        self.store.delete_automation(automation_id).await?;
        info!(
            automation_id = %automation_id,
            cancelled_runs = cancelled,
            "automation deleted"
        );
        Ok(())
    }

    fn check(&self, steps: &[Step], automation_id: &str) -> Result<ValidationResult> {
        let validation = validate_flow(steps);
        if validation.has_errors() {
            return Err(EngineError::ValidationFailed {
                automation_id: automation_id.to_string(),
                errors: validation.error_messages(),
            });
        }
        Ok(validation)
    }
}

/// Point every step at the owning automation, whatever id the payload had.
fn rekey_steps(automation_id: &str, mut steps: Vec<Step>) -> Vec<Step> {
    for step in &mut steps {
        step.automation_id = automation_id.to_string();
    }
    steps
}
