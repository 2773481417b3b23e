// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for chatflow-core.
//!
//! This module defines the storage abstraction the engine, dispatcher and
//! timer scheduler run against, plus the SQLite backend implementation.

pub mod sqlite;

pub use self::sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Automation, AutomationStatus, FlowSnapshot, Run, Step, TimerEntry, Trigger,
};

/// Storage abstraction for automations, flow snapshots, runs, and timers.
///
/// All run mutations go through [`Store::update_run`], which applies an
/// optimistic concurrency check: the write succeeds only if the stored
/// version still equals the version the caller read.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Automations
    // ------------------------------------------------------------------

    /// Insert a new automation.
    async fn insert_automation(&self, automation: &Automation) -> Result<()>;

    /// Update an automation's name, trigger, and channel scope.
    async fn update_automation(&self, automation: &Automation) -> Result<()>;

    /// Fetch an automation by id.
    async fn get_automation(&self, automation_id: &str) -> Result<Option<Automation>>;

    /// List all automations, newest first.
    async fn list_automations(&self) -> Result<Vec<Automation>>;

    /// Delete an automation and its steps. Snapshots stay so that runs
    /// terminated by the deletion remain inspectable.
    async fn delete_automation(&self, automation_id: &str) -> Result<()>;

    /// Set an automation's status and current snapshot reference.
    async fn set_automation_status(
        &self,
        automation_id: &str,
        status: AutomationStatus,
        snapshot_id: Option<&str>,
    ) -> Result<()>;

    /// Bump the execution counter after a production run completes.
    async fn record_execution(&self, automation_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Active automations whose trigger matches, scoped to the channel.
    ///
    /// An automation with no channel scope matches every channel.
    async fn active_automations_for_trigger(
        &self,
        trigger: Trigger,
        channel_id: &str,
    ) -> Result<Vec<Automation>>;

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Replace an automation's live steps with the given set.
    async fn replace_steps(&self, automation_id: &str, steps: &[Step]) -> Result<()>;

    /// List an automation's live steps ordered by position.
    async fn list_steps(&self, automation_id: &str) -> Result<Vec<Step>>;

    // ------------------------------------------------------------------
    // Flow snapshots
    // ------------------------------------------------------------------

    /// Persist a flow snapshot.
    async fn save_snapshot(&self, snapshot: &FlowSnapshot) -> Result<()>;

    /// Load a flow snapshot by id.
    async fn load_snapshot(&self, snapshot_id: &str) -> Result<Option<FlowSnapshot>>;

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Insert a new run.
    ///
    /// Fails with [`crate::error::EngineError::RunAlreadyActive`] when a
    /// non-terminal run already exists for the same (automation,
    /// conversation) pair.
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Find the non-terminal run for an (automation, conversation) pair.
    async fn find_active_run(
        &self,
        automation_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Run>>;

    /// Runs on a conversation that are suspended waiting for an inbound
    /// message (`user_reply` or `keyword_catch`). Includes test runs.
    async fn waiting_runs_for_conversation(&self, conversation_id: &str) -> Result<Vec<Run>>;

    /// Persist a run advance with an optimistic concurrency check.
    ///
    /// The write succeeds only if the stored version equals `run.version`;
    /// on success the stored version is bumped by one. Returns whether the
    /// write was applied.
    async fn update_run(&self, run: &Run) -> Result<bool>;

    /// Cancel every non-terminal run of an automation and delete their
    /// timers. Returns the number of runs cancelled.
    async fn cancel_runs_for_automation(&self, automation_id: &str) -> Result<u64>;

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Schedule (or reschedule) the durable timer for a run.
    async fn schedule_timer(&self, run_id: &str, due_at: DateTime<Utc>) -> Result<()>;

    /// Delete the durable timer for a run, if any.
    async fn delete_timer(&self, run_id: &str) -> Result<()>;

    /// Atomically claim up to `limit` due timers, removing them from the
    /// table. Each claimed entry is delivered at most once; a run whose
    /// timer row is lost is recovered by [`Store::overdue_time_gap_runs`].
    async fn take_due_timers(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TimerEntry>>;

    /// Production runs suspended on a `time_gap` whose wake deadline passed
    /// `cutoff`. Backstop for timer rows lost to a crash between the run
    /// update and the timer insert.
    async fn overdue_time_gap_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Run>>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<()>;
}
